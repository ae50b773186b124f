//! Actor wrapper that owns the connection registry and a possibly evicted room.
//!
//! The registry lives for the whole process. The [`Room`] itself is dropped
//! after an idle window and rebuilt on the next event from its snapshot and
//! the connections' attachments.

use crate::client_manager::{ClientManager, ConnectionId, Outbound};
use crate::config::RoomConfig;
use crate::game::Room;
use crate::profile::ProfileStore;
use crate::settlement;
use crate::storage::SnapshotStore;
use crate::utils::now_ms;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Mailbox depth of the room actor.
const MAILBOX_SIZE: usize = 1024;

/// Inbound stimuli, serialized through the room's mailbox.
#[derive(Debug)]
pub enum RoomEvent {
    Connect {
        addr: SocketAddr,
        outbound: Outbound,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Message {
        connection_id: ConnectionId,
        text: String,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
}

pub struct RoomHost {
    config: RoomConfig,
    clients: ClientManager,
    room: Option<Room>,
    snapshots: Arc<dyn SnapshotStore>,
    profiles: Arc<dyn ProfileStore>,
    /// Idle time after which the room is evicted. `None` keeps it resident.
    hibernate_after: Option<Duration>,
    last_activity: u64,
    /// Alarm of an evicted room, so the host still wakes up for it.
    dormant_alarm: Option<u64>,
}

impl RoomHost {
    pub fn new(
        config: RoomConfig,
        snapshots: Arc<dyn SnapshotStore>,
        profiles: Arc<dyn ProfileStore>,
        hibernate_after: Option<Duration>,
    ) -> Self {
        let clients = ClientManager::new(config.max_connections);
        Self {
            config,
            clients,
            room: None,
            snapshots,
            profiles,
            hibernate_after,
            last_activity: 0,
            dormant_alarm: None,
        }
    }

    /// Starts the actor task and returns its mailbox.
    pub fn spawn(self) -> mpsc::Sender<RoomEvent> {
        let (events_tx, events_rx) = mpsc::channel(MAILBOX_SIZE);
        tokio::spawn(run_room(self, events_rx));
        events_tx
    }

    pub fn is_loaded(&self) -> bool {
        self.room.is_some()
    }

    pub fn clients(&self) -> &ClientManager {
        &self.clients
    }

    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }

    /// Returns the live room, restoring it first if it was evicted.
    pub fn ensure_loaded(&mut self, now: u64) -> &mut Room {
        let Self {
            room,
            config,
            snapshots,
            clients,
            dormant_alarm,
            ..
        } = self;

        room.get_or_insert_with(|| {
            info!("Loading room");
            *dormant_alarm = None;
            Room::restore(
                config.clone(),
                Arc::clone(snapshots),
                StdRng::from_entropy(),
                clients,
                now,
            )
        })
    }

    pub fn handle_event(&mut self, event: RoomEvent, now: u64) {
        self.last_activity = now;

        match event {
            RoomEvent::Connect {
                addr,
                outbound,
                reply,
            } => {
                let id = self.clients.register(addr, outbound);
                if reply.send(id).is_err() {
                    debug!("Connection from {} went away during registration", addr);
                    if let Some(id) = id {
                        self.clients.unregister(&id);
                    }
                }
            }
            RoomEvent::Message {
                connection_id,
                text,
            } => {
                self.ensure_loaded(now);
                if let Some(room) = self.room.as_mut() {
                    room.handle_message(&mut self.clients, connection_id, &text, now);
                }
            }
            RoomEvent::Disconnect { connection_id } => {
                self.ensure_loaded(now);
                if let Some(room) = self.room.as_mut() {
                    room.handle_disconnect(&mut self.clients, connection_id, now);
                }
            }
        }

        self.dispatch_awards();
    }

    /// Fires the room alarm when it is due, reloading the room if needed.
    pub fn handle_alarm(&mut self, now: u64) {
        let due = self
            .room
            .as_ref()
            .map_or(self.dormant_alarm, Room::alarm_at)
            .is_some_and(|at| at <= now);
        if !due {
            return;
        }

        self.ensure_loaded(now);
        if let Some(room) = self.room.as_mut() {
            room.handle_alarm(&mut self.clients, now);
        }
        self.dispatch_awards();
    }

    /// When the loaded room becomes eligible for eviction.
    ///
    /// That is `hibernate_after` past the last event, unless an alarm falls
    /// due within one more window of that moment.
    fn eviction_at(&self) -> Option<u64> {
        let (Some(window), Some(room)) = (self.hibernate_after, self.room.as_ref()) else {
            return None;
        };
        let window = window.as_millis() as u64;
        let at = self.last_activity + window;

        match room.alarm_at() {
            Some(alarm) if alarm <= at + window => None,
            _ => Some(at),
        }
    }

    pub fn maybe_hibernate(&mut self, now: u64) {
        if !self.eviction_at().is_some_and(|at| at <= now) {
            return;
        }
        let Some(room) = self.room.take() else {
            return;
        };

        room.persist(now);
        self.dormant_alarm = room.alarm_at();
        info!("Room hibernated, {} connections stay open", self.clients.len());
    }

    /// The next moment the actor has work to do without any inbound event.
    pub fn next_wake(&self) -> Option<u64> {
        let alarm = match &self.room {
            Some(room) => room.alarm_at(),
            None => self.dormant_alarm,
        };

        match (alarm, self.eviction_at()) {
            (Some(a), Some(e)) => Some(a.min(e)),
            (a, e) => a.or(e),
        }
    }

    fn dispatch_awards(&mut self) {
        let Some(room) = self.room.as_mut() else {
            return;
        };
        let awards = room.take_awards();
        if !awards.is_empty() {
            settlement::dispatch(Arc::clone(&self.profiles), awards);
        }
    }
}

/// The room actor loop: one event or one wake-up at a time.
pub async fn run_room(mut host: RoomHost, mut events: mpsc::Receiver<RoomEvent>) {
    info!("Room actor started");

    loop {
        let delay = host
            .next_wake()
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms())));

        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => host.handle_event(event, now_ms()),
                    None => break,
                }
            }
            _ = tokio::time::sleep(delay.unwrap_or_default()), if delay.is_some() => {
                let now = now_ms();
                host.handle_alarm(now);
                host.maybe_hibernate(now);
            }
        }
    }

    if let Some(room) = host.room.as_ref() {
        room.persist(now_ms());
    }
    info!("Room actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::RoomState;
    use crate::profile::{Catalog, MemoryProfileStore};
    use crate::storage::MemorySnapshotStore;
    use tokio_tungstenite::tungstenite::Message;

    fn host(hibernate_after: Option<Duration>) -> (RoomHost, MemorySnapshotStore) {
        let store = MemorySnapshotStore::new();
        let host = RoomHost::new(
            RoomConfig::default(),
            Arc::new(store.clone()),
            Arc::new(MemoryProfileStore::new(Catalog::default())),
            hibernate_after,
        );
        (host, store)
    }

    fn connect(host: &mut RoomHost, now: u64) -> (ConnectionId, mpsc::Receiver<Message>) {
        let (outbound, inbox) = Outbound::channel();
        let (reply, mut answer) = oneshot::channel();
        host.handle_event(
            RoomEvent::Connect {
                addr: "127.0.0.1:9000".parse().unwrap(),
                outbound,
                reply,
            },
            now,
        );
        (answer.try_recv().unwrap().unwrap(), inbox)
    }

    fn join(host: &mut RoomHost, connection_id: ConnectionId, name: &str, now: u64) {
        host.handle_event(
            RoomEvent::Message {
                connection_id,
                text: format!(r#"{{"type":"join","name":"{}"}}"#, name),
            },
            now,
        );
    }

    #[test]
    fn test_connect_does_not_load_room() {
        let (mut host, _) = host(None);
        connect(&mut host, 0);
        assert!(!host.is_loaded());
        assert_eq!(host.clients().len(), 1);
    }

    #[test]
    fn test_hibernate_waits_for_due_alarm() {
        let (mut host, store) = host(Some(Duration::from_secs(30)));
        let (ann, _inbox) = connect(&mut host, 0);
        join(&mut host, ann, "ann", 0);

        // The idle lobby timer falls inside the window, so the room stays.
        host.maybe_hibernate(30_000);
        assert!(host.is_loaded());

        host.handle_event(RoomEvent::Disconnect { connection_id: ann }, 1_000);
        host.maybe_hibernate(30_999);
        assert!(host.is_loaded());
        host.maybe_hibernate(31_000);
        assert!(!host.is_loaded());
        assert!(store.load().unwrap().is_some());
        assert_eq!(host.next_wake(), None);

        let (bob, _inbox_b) = connect(&mut host, 40_000);
        join(&mut host, bob, "bob", 40_000);
        let room = host.room().unwrap();
        assert_eq!(room.players().len(), 1);
        assert_eq!(room.players()[0].id, 2);
    }

    #[test]
    fn test_evicted_room_restores_from_attachments() {
        let (mut host, _) = host(Some(Duration::from_secs(1)));
        let (ann, _inbox) = connect(&mut host, 0);
        join(&mut host, ann, "ann", 0);
        host.handle_event(
            RoomEvent::Message {
                connection_id: ann,
                text: r#"{"type":"move","x":250}"#.to_string(),
            },
            0,
        );
        let before = host.room().map(|r| r.players().to_vec()).unwrap();

        // Drop the room directly to simulate process eviction.
        host.dormant_alarm = host.room().and_then(Room::alarm_at);
        host.room().unwrap().persist(0);
        host.room = None;

        assert_eq!(host.next_wake(), Some(20_000));
        host.handle_alarm(20_000);

        let room = host.room().unwrap();
        assert_eq!(room.players(), before.as_slice());
        assert_eq!(room.state(), RoomState::Countdown);
    }

    #[test]
    fn test_next_wake_prefers_earliest() {
        let (mut host, _) = host(Some(Duration::from_secs(5)));
        assert_eq!(host.next_wake(), None);

        let (ann, _inbox) = connect(&mut host, 0);
        join(&mut host, ann, "ann", 0);
        assert_eq!(host.next_wake(), Some(5_000));
    }

    #[tokio::test]
    async fn test_actor_registers_and_welcomes() {
        let (host, _) = host(None);
        let mailbox = host.spawn();

        let (outbound, mut inbox) = Outbound::channel();
        let (reply, answer) = oneshot::channel();
        mailbox
            .send(RoomEvent::Connect {
                addr: "127.0.0.1:9000".parse().unwrap(),
                outbound,
                reply,
            })
            .await
            .unwrap();
        let connection_id = answer.await.unwrap().unwrap();

        mailbox
            .send(RoomEvent::Message {
                connection_id,
                text: r#"{"type":"join","name":"ann"}"#.to_string(),
            })
            .await
            .unwrap();

        let frame = inbox.recv().await.unwrap();
        assert!(frame.to_text().unwrap().contains("welcome"));
    }
}
