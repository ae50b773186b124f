//! # Coinfall Room Server Library
//!
//! This library provides the authoritative room for the coin-catching arcade
//! game. Up to five players slide along the bottom of the playfield and catch
//! falling coins; the room owns the round lifecycle, runs the simulation and
//! fans state out to every connected client.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Simulation
//! Coins are spawned, moved and caught on the server only. Clients send their
//! horizontal position and render whatever the room broadcasts.
//!
//! ### Round Lifecycle
//! The room cycles through lobby, countdown, playing and game over, driven
//! by player joins, movement messages and a single pending alarm:
//! - Idle lobby auto-start once the first player has waited long enough
//! - Immediate start when every slot is taken
//! - Fallback ticks that keep a round running when nobody moves
//! - Settlement of currency awards when a round ends
//!
//! ### Capacity
//! A hard socket ceiling is enforced before the WebSocket upgrade. Joins
//! beyond the five gameplay slots, or during a running round, are queued and
//! promoted in join order when the room returns to the lobby.
//!
//! ## Architecture Design
//!
//! ### Single-Writer Actor
//! All room state is mutated from one task consuming a mailbox. Connection
//! tasks only forward frames; writes to sockets go through bounded queues
//! and never block the actor.
//!
//! ### Survivable Eviction
//! The room can be dropped from memory while sockets stay open. Shared state
//! is snapshotted on transitions; per-player state is attached to each
//! connection. Reloading rebuilds the rosters from live connections alone.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Registry of open sockets, their outbound queues and role attachments.
//!
//! ### Game Module (`game`)
//! The room state machine, both broadcast paths and restart recovery.
//!
//! ### Physics Module (`physics`)
//! Coin spawning, motion, ground misses and catch detection.
//!
//! ### Session Module (`session`)
//! Player and waiting records, join validation and admission.
//!
//! ### Settlement Module (`settlement`)
//! End-of-round ranking and best-effort currency dispatch.
//!
//! ### Host and Network Modules (`host`, `network`)
//! The actor loop with hibernation, and the WebSocket front end.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use coinfall_server::config::RoomConfig;
//! use coinfall_server::host::RoomHost;
//! use coinfall_server::network::Server;
//! use coinfall_server::profile::{Catalog, MemoryProfileStore};
//! use coinfall_server::storage::MemorySnapshotStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RoomConfig::default();
//!     let max_connections = config.max_connections;
//!
//!     let mailbox = RoomHost::new(
//!         config,
//!         Arc::new(MemorySnapshotStore::new()),
//!         Arc::new(MemoryProfileStore::new(Catalog::default())),
//!         None,
//!     )
//!     .spawn();
//!
//!     let server = Server::bind("127.0.0.1:8080", mailbox, max_connections, Vec::new()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod game;
pub mod host;
pub mod network;
pub mod physics;
pub mod profile;
pub mod session;
pub mod settlement;
pub mod storage;
pub mod utils;
