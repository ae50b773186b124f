//! Live connection registry for the room
//!
//! This module tracks every open socket, independent of whether it has joined:
//! - Connection lifecycle (register, unregister) under a hard ceiling
//! - Outbound queue handles used for non-blocking writes
//! - Role metadata attached to the connection itself
//!
//! The registry outlives the room actor. When the room is evicted and
//! reloaded it rebuilds its roster purely from the attachments found here.

use crate::session::Attachment;
use log::{debug, info};
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

pub type ConnectionId = u64;

/// Outbound queue depth per socket. A socket that falls this far behind is
/// treated as dead.
pub const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("outbound queue full")]
    Full,
}

/// Write handle for one socket.
///
/// Writes never wait: the frame is queued for the socket's writer task or the
/// attempt fails straight away.
#[derive(Debug, Clone)]
pub struct Outbound {
    sender: mpsc::Sender<Message>,
}

impl Outbound {
    pub fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Creates a handle plus the receiving end its writer task drains.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE);
        (Self::new(sender), receiver)
    }

    pub fn send(&self, frame: &Message) -> Result<(), DeliveryError> {
        self.sender.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Represents an open socket and whatever role data it carries
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    outbound: Outbound,
    attachment: Option<Attachment>,
}

impl Connection {
    pub fn new(id: ConnectionId, addr: SocketAddr, outbound: Outbound) -> Self {
        Self {
            id,
            addr,
            outbound,
            attachment: None,
        }
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    /// A connection is onboarded once it has joined as player or waiter.
    pub fn is_onboarded(&self) -> bool {
        self.attachment.is_some()
    }
}

/// Manages all open connections
///
/// Connection ids start from 1 and are never reused during the process
/// lifetime, so a stale id can never address a newer socket.
pub struct ClientManager {
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: ConnectionId,
    max_connections: usize,
}

impl ClientManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Registers a new socket
    ///
    /// Returns None when the ceiling is reached; the caller closes the socket.
    pub fn register(&mut self, addr: SocketAddr, outbound: Outbound) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        info!("Connection {} opened from {}", id, addr);
        self.connections.insert(id, Connection::new(id, addr, outbound));
        Some(id)
    }

    pub fn unregister(&mut self, id: &ConnectionId) -> Option<Connection> {
        let connection = self.connections.remove(id)?;
        info!("Connection {} closed", id);
        Some(connection)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn attachment(&self, id: &ConnectionId) -> Option<&Attachment> {
        self.connections.get(id).and_then(Connection::attachment)
    }

    pub fn outbound(&self, id: &ConnectionId) -> Option<Outbound> {
        self.connections.get(id).map(|c| c.outbound.clone())
    }

    /// Stores the latest role snapshot on a connection
    ///
    /// Best effort: a missing or closing connection is skipped and false is
    /// returned. Never fails loudly.
    pub fn attach(&mut self, id: ConnectionId, attachment: Attachment) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) if !connection.outbound.is_closed() => {
                connection.attachment = Some(attachment);
                true
            }
            Some(_) => {
                debug!("Skipping attachment for closing connection {}", id);
                false
            }
            None => {
                debug!("Skipping attachment for unknown connection {}", id);
                false
            }
        }
    }

    /// Every open connection, in no particular order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PlayerRecord, WaitingRecord};

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn player_attachment(connection_id: ConnectionId) -> Attachment {
        Attachment::Player(PlayerRecord::new(
            1,
            connection_id,
            "ann".to_string(),
            "#fff".to_string(),
            None,
            None,
            400.0,
        ))
    }

    #[test]
    fn test_register_assigns_increasing_ids() {
        let mut manager = ClientManager::new(3);
        let (a, _rx_a) = Outbound::channel();
        let (b, _rx_b) = Outbound::channel();

        assert_eq!(manager.register(test_addr(), a), Some(1));
        assert_eq!(manager.register(test_addr(), b), Some(2));
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_register_respects_ceiling() {
        let mut manager = ClientManager::new(1);
        let (a, _rx_a) = Outbound::channel();
        let (b, _rx_b) = Outbound::channel();

        assert!(manager.register(test_addr(), a).is_some());
        assert!(manager.register(test_addr(), b).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let mut manager = ClientManager::new(2);
        let (a, _rx) = Outbound::channel();
        let id = manager.register(test_addr(), a).unwrap();

        assert!(manager.unregister(&id).is_some());
        assert!(manager.unregister(&id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_attach_replaces_role() {
        let mut manager = ClientManager::new(2);
        let (a, _rx) = Outbound::channel();
        let id = manager.register(test_addr(), a).unwrap();

        assert!(manager.attachment(&id).is_none());
        assert!(!manager.get(&id).unwrap().is_onboarded());

        assert!(manager.attach(id, player_attachment(id)));
        assert_eq!(manager.attachment(&id).map(Attachment::player_id), Some(1));

        let waiting = WaitingRecord {
            id: 1,
            connection_id: id,
            name: "ann".to_string(),
            cosmetic_id: None,
            user_id: None,
        };
        assert!(manager.attach(id, Attachment::Waiting(waiting.clone())));
        assert_eq!(manager.attachment(&id), Some(&Attachment::Waiting(waiting)));
    }

    #[test]
    fn test_attach_is_best_effort() {
        let mut manager = ClientManager::new(2);
        assert!(!manager.attach(42, player_attachment(42)));

        let (a, rx) = Outbound::channel();
        let id = manager.register(test_addr(), a).unwrap();
        drop(rx);
        assert!(!manager.attach(id, player_attachment(id)));
        assert!(manager.attachment(&id).is_none());
    }

    #[test]
    fn test_outbound_send_failures() {
        let (outbound, mut rx) = Outbound::channel();
        let frame = Message::text("hello");

        assert!(outbound.send(&frame).is_ok());
        assert_eq!(rx.try_recv().unwrap(), frame);

        for _ in 0..OUTBOUND_QUEUE {
            outbound.send(&frame).unwrap();
        }
        assert_eq!(outbound.send(&frame), Err(DeliveryError::Full));

        drop(rx);
        assert_eq!(outbound.send(&frame), Err(DeliveryError::Closed));
        assert!(outbound.is_closed());
    }
}
