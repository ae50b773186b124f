//! Per-connection session records and join admission.
//!
//! A joined connection is either an active [`PlayerRecord`] or a
//! [`WaitingRecord`]. The latest copy of either is attached to the connection
//! itself (see [`crate::client_manager`]) so the roster can be rebuilt from
//! live connections alone.

use crate::client_manager::ConnectionId;
use crate::config::RoomConfig;
use coinfall_shared::{
    FinalStanding, LobbyPlayer, PlayerId, PlayerState, MAX_NAME_CHARS, PLAYER_WIDTH, WORLD_WIDTH,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DEFAULT_NAME: &str = "Player";
const MAX_COSMETIC_ID_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connected,
    /// The socket stopped accepting writes; the record is about to be dropped.
    Stale,
}

/// An occupant of one of the gameplay slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: PlayerId,
    pub connection_id: ConnectionId,
    pub name: String,
    /// Centre of the catch box, clamped to the playfield.
    pub x: f32,
    pub score: u32,
    pub color: String,
    pub cosmetic_id: Option<String>,
    /// Linked profile, only used for currency settlement.
    pub user_id: Option<Uuid>,
    pub connection_state: ConnectionState,
}

impl PlayerRecord {
    pub fn new(
        id: PlayerId,
        connection_id: ConnectionId,
        name: String,
        color: String,
        cosmetic_id: Option<String>,
        user_id: Option<Uuid>,
        x: f32,
    ) -> Self {
        Self {
            id,
            connection_id,
            name,
            x: clamp_player_x(x),
            score: 0,
            color,
            cosmetic_id,
            user_id,
            connection_state: ConnectionState::Connected,
        }
    }

    pub fn move_to(&mut self, x: f32) {
        self.x = clamp_player_x(x);
    }

    pub fn lobby_view(&self) -> LobbyPlayer {
        LobbyPlayer {
            player_id: self.id,
            name: self.name.clone(),
            color: self.color.clone(),
            cosmetic_id: self.cosmetic_id.clone(),
        }
    }

    pub fn game_view(&self) -> PlayerState {
        PlayerState {
            player_id: self.id,
            x: self.x,
            score: self.score,
            color: self.color.clone(),
            name: self.name.clone(),
            cosmetic_id: self.cosmetic_id.clone(),
        }
    }

    pub fn standing(&self) -> FinalStanding {
        FinalStanding {
            player_id: self.id,
            name: self.name.clone(),
            score: self.score,
            color: self.color.clone(),
            cosmetic_id: self.cosmetic_id.clone(),
            coins_earned: None,
            is_winner: None,
        }
    }
}

/// A connection queued for the next round. Has no position or score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingRecord {
    pub id: PlayerId,
    pub connection_id: ConnectionId,
    pub name: String,
    pub cosmetic_id: Option<String>,
    pub user_id: Option<Uuid>,
}

impl WaitingRecord {
    pub fn promote(self, color: String, x: f32) -> PlayerRecord {
        PlayerRecord::new(
            self.id,
            self.connection_id,
            self.name,
            color,
            self.cosmetic_id,
            self.user_id,
            x,
        )
    }
}

impl From<PlayerRecord> for WaitingRecord {
    fn from(player: PlayerRecord) -> Self {
        Self {
            id: player.id,
            connection_id: player.connection_id,
            name: player.name,
            cosmetic_id: player.cosmetic_id,
            user_id: player.user_id,
        }
    }
}

/// Role metadata carried by a connection. Unjoined connections carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attachment {
    Player(PlayerRecord),
    Waiting(WaitingRecord),
}

impl Attachment {
    pub fn player_id(&self) -> PlayerId {
        match self {
            Attachment::Player(player) => player.id,
            Attachment::Waiting(waiting) => waiting.id,
        }
    }
}

/// Validated contents of a `join` request.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub name: String,
    pub user_id: Option<Uuid>,
    pub cosmetic_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    Blocked,
}

impl NameError {
    pub fn reason(&self) -> &'static str {
        match self {
            NameError::Blocked => "That name is not allowed",
        }
    }
}

impl JoinRequest {
    pub fn parse(
        name: &str,
        user_id: Option<&str>,
        cosmetic_id: Option<&str>,
        config: &RoomConfig,
    ) -> Result<Self, NameError> {
        Ok(Self {
            name: sanitize_name(name, &config.blocked_names)?,
            user_id: user_id.and_then(parse_user_id),
            cosmetic_id: cosmetic_id.and_then(sanitize_cosmetic_id),
        })
    }
}

/// Cleans up a display name.
///
/// Control characters are stripped, whitespace runs collapse to one space and
/// the result is cut to `MAX_NAME_CHARS` characters. An empty result becomes
/// the default name. Names containing a blocked word are rejected, with
/// punctuation and spacing ignored so `a.d m i n` is caught too.
pub fn sanitize_name(raw: &str, blocked: &[String]) -> Result<String, NameError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let squashed: String = cleaned
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();
    if blocked
        .iter()
        .any(|word| !word.is_empty() && squashed.contains(word.as_str()))
    {
        return Err(NameError::Blocked);
    }

    let truncated: String = cleaned.chars().take(MAX_NAME_CHARS).collect();
    let truncated = truncated.trim_end().to_string();
    if truncated.is_empty() {
        Ok(DEFAULT_NAME.to_string())
    } else {
        Ok(truncated)
    }
}

pub fn parse_user_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw.trim()).ok()
}

pub fn sanitize_cosmetic_id(raw: &str) -> Option<String> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_COSMETIC_ID_CHARS
        && raw
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    valid.then(|| raw.to_string())
}

pub fn clamp_player_x(x: f32) -> f32 {
    let half = PLAYER_WIDTH / 2.0;
    if x.is_nan() {
        return WORLD_WIDTH / 2.0;
    }
    x.clamp(half, WORLD_WIDTH - half)
}

/// Evenly spreads `count` players across the playfield, left to right.
pub fn starting_positions(count: usize) -> Vec<f32> {
    (0..count)
        .map(|i| WORLD_WIDTH * (i as f32 + 1.0) / (count as f32 + 1.0))
        .collect()
}

/// Where a join request lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Active,
    Waiting,
}

/// Joins become active only in the lobby and only while a slot is free.
pub fn admit(in_lobby: bool, active_players: usize, config: &RoomConfig) -> Admission {
    if in_lobby && active_players < config.max_players {
        Admission::Active
    } else {
        Admission::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn blocked() -> Vec<String> {
        RoomConfig::default().blocked_names
    }

    #[test]
    fn test_sanitize_name_truncates_and_collapses() {
        assert_eq!(sanitize_name("  ann   marie  ", &blocked()).unwrap(), "ann mari");
        assert_eq!(sanitize_name("bob\u{7}", &blocked()).unwrap(), "bob");
        assert_eq!(sanitize_name("abcdefghijkl", &blocked()).unwrap(), "abcdefgh");
    }

    #[test]
    fn test_sanitize_name_defaults_when_empty() {
        assert_eq!(sanitize_name("   ", &blocked()).unwrap(), DEFAULT_NAME);
        assert_eq!(sanitize_name("", &blocked()).unwrap(), DEFAULT_NAME);
    }

    #[test]
    fn test_sanitize_name_rejects_blocked_words() {
        assert_eq!(sanitize_name("ADMIN", &blocked()), Err(NameError::Blocked));
        assert_eq!(sanitize_name("a.d m-i n", &blocked()), Err(NameError::Blocked));
        assert!(sanitize_name("adam", &blocked()).is_ok());
    }

    #[test]
    fn test_user_id_must_be_uuid() {
        assert!(parse_user_id("not-a-uuid").is_none());
        assert!(parse_user_id("67e55044-10b1-426f-9247-bb680e5fe0c8").is_some());
    }

    #[test]
    fn test_cosmetic_id_validation() {
        assert_eq!(sanitize_cosmetic_id("top_hat-2"), Some("top_hat-2".to_string()));
        assert!(sanitize_cosmetic_id("").is_none());
        assert!(sanitize_cosmetic_id("Top Hat").is_none());
        assert!(sanitize_cosmetic_id(&"a".repeat(33)).is_none());
    }

    #[test]
    fn test_join_request_parse() {
        let config = RoomConfig::default();
        let request = JoinRequest::parse("zed", Some("garbage"), Some("crown"), &config).unwrap();
        assert_eq!(request.name, "zed");
        assert!(request.user_id.is_none());
        assert_eq!(request.cosmetic_id.as_deref(), Some("crown"));
    }

    #[test]
    fn test_player_position_clamped() {
        let mut player = PlayerRecord::new(1, 1, "a".into(), "#fff".into(), None, None, -50.0);
        assert_approx_eq!(player.x, PLAYER_WIDTH / 2.0, 0.001);

        player.move_to(WORLD_WIDTH * 2.0);
        assert_approx_eq!(player.x, WORLD_WIDTH - PLAYER_WIDTH / 2.0, 0.001);

        player.move_to(f32::NAN);
        assert_approx_eq!(player.x, WORLD_WIDTH / 2.0, 0.001);
    }

    #[test]
    fn test_starting_positions_even_spread() {
        let positions = starting_positions(3);
        assert_eq!(positions.len(), 3);
        assert_approx_eq!(positions[0], 200.0, 0.001);
        assert_approx_eq!(positions[1], 400.0, 0.001);
        assert_approx_eq!(positions[2], 600.0, 0.001);
    }

    #[test]
    fn test_admission() {
        let config = RoomConfig::default();
        assert_eq!(admit(true, 0, &config), Admission::Active);
        assert_eq!(admit(true, 4, &config), Admission::Active);
        assert_eq!(admit(true, 5, &config), Admission::Waiting);
        assert_eq!(admit(false, 0, &config), Admission::Waiting);
    }

    #[test]
    fn test_waiting_promotion_keeps_identity() {
        let waiting = WaitingRecord {
            id: 7,
            connection_id: 3,
            name: "wai".to_string(),
            cosmetic_id: Some("crown".to_string()),
            user_id: None,
        };
        let player = waiting.promote("#abc".to_string(), 100.0);
        assert_eq!(player.id, 7);
        assert_eq!(player.connection_id, 3);
        assert_eq!(player.score, 0);
        assert_eq!(player.color, "#abc");
    }
}
