//! Injected, read-only tuning for the room.
//!
//! Every timing, capacity and scoring constant of the room lives here so that
//! tests can shrink windows and the binary can override limits from the
//! command line. `RoomConfig::default()` is the production tuning.

use std::time::Duration;

/// Player colours, handed out round-robin.
pub const DEFAULT_PALETTE: [&str; 5] = ["#ff5e5b", "#00cecb", "#ffed66", "#9b5de5", "#52b788"];

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Active gameplay slots.
    pub max_players: usize,
    /// Hard ceiling on open sockets, checked before the upgrade completes.
    pub max_connections: usize,

    pub idle_timeout: Duration,
    pub countdown_seconds: u32,
    pub round_seconds: f32,
    pub fallback_tick: Duration,
    pub game_over_display: Duration,
    /// Minimum spacing between hot-path `gameState` writes.
    pub broadcast_interval: Duration,

    /// Largest `dt` a single physics step may simulate.
    pub max_step: f32,
    /// Largest elapsed time one trigger may catch up on.
    pub max_catch_up: f32,

    pub spawn_interval: f32,
    pub max_objects: usize,
    pub min_fall_speed: f32,
    pub max_fall_speed: f32,
    pub max_wobble: f32,
    pub max_rotation_speed: f32,

    pub points_per_catch: u32,
    pub winner_bonus: u32,
    pub participation_bonus: u32,

    pub palette: Vec<String>,
    /// Lower-case words that may not appear in display names.
    pub blocked_names: Vec<String>,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: 5,
            max_connections: 20,
            idle_timeout: Duration::from_secs(20),
            countdown_seconds: 5,
            round_seconds: 60.0,
            fallback_tick: Duration::from_secs(1),
            game_over_display: Duration::from_secs(5),
            broadcast_interval: Duration::from_millis(50),
            max_step: 0.2,
            max_catch_up: 1.0,
            spawn_interval: 0.6,
            max_objects: 50,
            min_fall_speed: 140.0,
            max_fall_speed: 260.0,
            max_wobble: 24.0,
            max_rotation_speed: 4.0,
            points_per_catch: 10,
            winner_bonus: 50,
            participation_bonus: 25,
            palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
            blocked_names: ["admin", "fuck", "shit", "cunt", "nazi", "bitch"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
        }
    }
}

impl RoomConfig {
    /// Colour for a roster slot. An empty palette falls back to the default one.
    pub fn color_for(&self, slot: usize) -> String {
        match self.palette.len() {
            0 => DEFAULT_PALETTE[slot % DEFAULT_PALETTE.len()].to_string(),
            len => self.palette[slot % len].clone(),
        }
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout.as_millis() as u64
    }

    pub fn fallback_tick_ms(&self) -> u64 {
        self.fallback_tick.as_millis() as u64
    }

    pub fn game_over_display_ms(&self) -> u64 {
        self.game_over_display.as_millis() as u64
    }

    pub fn broadcast_interval_ms(&self) -> u64 {
        self.broadcast_interval.as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = RoomConfig::default();
        assert_eq!(config.max_players, 5);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.max_objects, 50);
        assert_eq!(config.palette.len(), config.max_players);
        assert_eq!(config.broadcast_interval_ms(), 50);
        assert_eq!(config.fallback_tick_ms(), 1000);
    }

    #[test]
    fn test_color_round_robin() {
        let config = RoomConfig::default();
        assert_eq!(config.color_for(0), config.color_for(5));
        assert_ne!(config.color_for(0), config.color_for(1));
    }

    #[test]
    fn test_empty_palette_uses_default_colors() {
        let config = RoomConfig {
            palette: Vec::new(),
            ..RoomConfig::default()
        };
        assert_eq!(config.color_for(0), DEFAULT_PALETTE[0]);
        assert_eq!(config.color_for(6), DEFAULT_PALETTE[1]);
    }
}
