//! Wire protocol and playfield geometry shared by the room server and its clients.
//!
//! Every message is a single JSON object tagged by a `type` field. Clients send
//! [`ClientMessage`]s, the room answers with [`ServerMessage`]s.

use serde::{Deserialize, Serialize};

pub const WORLD_WIDTH: f32 = 800.0;
pub const WORLD_HEIGHT: f32 = 600.0;
/// Objects whose centre passes this line are missed and removed.
pub const GROUND_Y: f32 = 580.0;

pub const PLAYER_WIDTH: f32 = 60.0;
pub const PLAYER_HEIGHT: f32 = 30.0;
/// Top edge of every player's catch box. Players only move along x.
pub const PLAYER_Y: f32 = 540.0;

pub const COIN_RADIUS: f32 = 15.0;
/// Extra reach added to the coin radius when testing a catch.
pub const CATCH_FORGIVENESS: f32 = 10.0;

pub const MAX_NAME_CHARS: usize = 8;
/// Inbound text frames longer than this are dropped unread.
pub const MAX_PAYLOAD_BYTES: usize = 512;

pub type PlayerId = u32;
pub type CoinId = u32;

/// Messages sent by clients to the room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Join {
        name: String,
        #[serde(default, rename = "userId")]
        user_id: Option<String>,
        #[serde(default, rename = "cosmeticId")]
        cosmetic_id: Option<String>,
    },
    Move {
        x: f32,
    },
}

impl ClientMessage {
    /// Parses an inbound text frame.
    ///
    /// Returns `None` for oversized payloads, invalid JSON, unknown message
    /// types and non-numeric or non-finite positions. Callers drop those
    /// frames without replying.
    pub fn decode(text: &str) -> Option<ClientMessage> {
        if text.len() > MAX_PAYLOAD_BYTES {
            return None;
        }
        match serde_json::from_str::<ClientMessage>(text).ok()? {
            ClientMessage::Move { x } if !x.is_finite() => None,
            msg => Some(msg),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Lobby roster entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    pub player_id: PlayerId,
    pub name: String,
    pub color: String,
    pub cosmetic_id: Option<String>,
}

/// Per-player slice of a `gameState` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub player_id: PlayerId,
    pub x: f32,
    pub score: u32,
    pub color: String,
    pub name: String,
    pub cosmetic_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoinState {
    pub id: CoinId,
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
}

/// A catch, reported so clients can spawn a particle burst at `(x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectedEvent {
    pub player_id: PlayerId,
    pub x: f32,
    pub y: f32,
}

/// Final ranking row of a `gameOver` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalStanding {
    pub player_id: PlayerId,
    pub name: String,
    pub score: u32,
    pub color: String,
    pub cosmetic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coins_earned: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_winner: Option<bool>,
}

/// Messages sent by the room to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Welcome {
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },
    Lobby {
        players: Vec<LobbyPlayer>,
        /// Whole seconds until the lobby auto-starts, 0 when no timer runs.
        #[serde(rename = "idleTimer")]
        idle_timer: u32,
    },
    Countdown {
        seconds: u32,
    },
    GameState {
        players: Vec<PlayerState>,
        coins: Vec<CoinState>,
        #[serde(rename = "timeLeft")]
        time_left: f32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        collected: Vec<CollectedEvent>,
    },
    GameOver {
        players: Vec<FinalStanding>,
    },
    Waiting {
        message: String,
    },
    NameRejected {
        reason: String,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<ServerMessage, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// The wire `type` tag, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::Lobby { .. } => "lobby",
            ServerMessage::Countdown { .. } => "countdown",
            ServerMessage::GameState { .. } => "gameState",
            ServerMessage::GameOver { .. } => "gameOver",
            ServerMessage::Waiting { .. } => "waiting",
            ServerMessage::NameRejected { .. } => "nameRejected",
        }
    }
}
