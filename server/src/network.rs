//! WebSocket front end feeding the room actor.
//!
//! Each accepted socket is gated during the upgrade (connection ceiling,
//! origin check), then split into a reader that forwards text frames to the
//! room mailbox and a writer that drains the connection's outbound queue.

use crate::client_manager::Outbound;
use crate::host::RoomEvent;
use coinfall_shared::MAX_PAYLOAD_BYTES;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("room actor has shut down")]
    RoomClosed,
}

/// Upgrade-time admission rules shared by every connection task.
#[derive(Debug)]
struct Gate {
    max_connections: usize,
    /// Origins accepted in addition to the serving host itself.
    allowed_origins: Vec<String>,
    live: AtomicUsize,
}

/// Counts a socket as live for as long as it is held.
struct LiveSlot {
    gate: Arc<Gate>,
    /// Live sockets including this one, at the moment it was accepted.
    position: usize,
}

impl LiveSlot {
    fn acquire(gate: &Arc<Gate>) -> Self {
        let position = gate.live.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            gate: Arc::clone(gate),
            position,
        }
    }

    fn over_capacity(&self) -> bool {
        self.position > self.gate.max_connections
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.gate.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Server {
    listener: TcpListener,
    room: mpsc::Sender<RoomEvent>,
    gate: Arc<Gate>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        room: mpsc::Sender<RoomEvent>,
        max_connections: usize,
        allowed_origins: Vec<String>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            room,
            gate: Arc::new(Gate {
                max_connections,
                allowed_origins,
                live: AtomicUsize::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) -> Result<(), ServerError> {
        info!("Room server listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let slot = LiveSlot::acquire(&self.gate);
            let room = self.room.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, room, slot).await {
                    debug!("Connection from {} ended: {}", addr, e);
                }
            });
        }
    }
}

/// Whether a browser-declared origin may open a socket on `host`.
///
/// Requests without an `Origin` header come from non-browser clients and are
/// allowed. Otherwise the origin's authority must equal the `Host` header, or
/// the full origin must be listed in `extra`.
pub fn origin_allowed(origin: Option<&str>, host: Option<&str>, extra: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let origin = origin.trim().trim_end_matches('/');

    if extra
        .iter()
        .any(|allowed| allowed.trim().trim_end_matches('/').eq_ignore_ascii_case(origin))
    {
        return true;
    }

    let authority = origin
        .split_once("://")
        .map_or(origin, |(_, authority)| authority);
    host.is_some_and(|host| host.trim().eq_ignore_ascii_case(authority))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    room: mpsc::Sender<RoomEvent>,
    slot: LiveSlot,
) -> Result<(), ServerError> {
    let over_capacity = slot.over_capacity();
    let gate = Arc::clone(&slot.gate);

    let callback = move |request: &Request, response: Response| {
        if over_capacity {
            warn!("Rejecting {}: connection limit reached", addr);
            return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "Room is at capacity"));
        }

        let origin = request
            .headers()
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok());
        if !origin_allowed(origin, host, &gate.allowed_origins) {
            warn!("Rejecting {}: cross-origin upgrade from {:?}", addr, origin);
            return Err(reject(StatusCode::FORBIDDEN, "Cross-origin request rejected"));
        }

        Ok(response)
    };

    let socket = accept_hdr_async(stream, callback).await?;

    let (outbound, mut outbox) = Outbound::channel();
    let (reply, registered) = oneshot::channel();
    room.send(RoomEvent::Connect {
        addr,
        outbound,
        reply,
    })
    .await
    .map_err(|_| ServerError::RoomClosed)?;

    let Some(connection_id) = registered.await.map_err(|_| ServerError::RoomClosed)? else {
        warn!("Registry full, closing connection from {}", addr);
        return Ok(());
    };

    let (mut sink, mut frames) = socket.split();

    let writer = async move {
        while let Some(frame) = outbox.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!("Write to connection {} failed: {}", connection_id, e);
                break;
            }
        }
        let _ = sink.close().await;
    };

    let reader = async {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    if text.len() > MAX_PAYLOAD_BYTES {
                        debug!("Dropping oversized frame from connection {}", connection_id);
                        continue;
                    }
                    let event = RoomEvent::Message {
                        connection_id,
                        text: text.as_str().to_owned(),
                    };
                    if room.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => debug!("Dropping non-text frame from connection {}", connection_id),
                Err(e) => {
                    debug!("Read from connection {} failed: {}", connection_id, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    let _ = room.send(RoomEvent::Disconnect { connection_id }).await;
    drop(slot);
    Ok(())
}
