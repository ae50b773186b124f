//! Falling-object simulation and catch detection.
//!
//! [`advance`] is a pure function of the elapsed time and the current world:
//! it performs no I/O and never broadcasts. Object motion only depends on how
//! much time has passed, so many small steps and a few large ones land on the
//! same positions for the same total elapsed time.

use crate::config::RoomConfig;
use crate::session::PlayerRecord;
use coinfall_shared::{
    CoinId, CoinState, CollectedEvent, CATCH_FORGIVENESS, COIN_RADIUS, GROUND_Y, PLAYER_HEIGHT,
    PLAYER_WIDTH, PLAYER_Y, WORLD_WIDTH,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Radians of wobble per pixel fallen.
const WOBBLE_FREQUENCY: f32 = 0.02;

/// Remaining round time below this counts as zero. Absorbs f32 drift from
/// summing many sub-steps.
const CLOCK_EPSILON: f32 = 0.01;

///Represents a coin falling towards the players.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallingObject {
    pub id: CoinId,
    /// Horizontal centre the wobble oscillates around.
    pub origin_x: f32,
    pub x: f32,
    pub y: f32,
    pub fall_speed: f32,
    pub rotation: f32,
    pub rotation_speed: f32,
    pub wobble_phase: f32,
    pub wobble_amount: f32,
}

impl FallingObject {
    ///Moves the object down by `dt` seconds of fall.
    pub fn simulate(&mut self, dt: f32) {
        self.y += self.fall_speed * dt;
        self.rotation = (self.rotation + self.rotation_speed * dt).rem_euclid(TAU);
        self.apply_wobble();
    }

    /// Horizontal position is a function of height, never of frame count.
    fn apply_wobble(&mut self) {
        let offset = self.wobble_amount * (self.y * WOBBLE_FREQUENCY + self.wobble_phase).sin();
        self.x = (self.origin_x + offset).clamp(COIN_RADIUS, WORLD_WIDTH - COIN_RADIUS);
    }

    pub fn is_grounded(&self) -> bool {
        self.y > GROUND_Y
    }

    ///Checks the coin against a player's catch box.
    ///
    /// The box spans the player's width around `player_x` and sits at
    /// `PLAYER_Y`; the coin counts as caught when its centre is within its own
    /// radius plus the catch forgiveness of the closest point of that box.
    pub fn is_caught_by(&self, player_x: f32) -> bool {
        let left = player_x - PLAYER_WIDTH / 2.0;
        let right = player_x + PLAYER_WIDTH / 2.0;
        let top = PLAYER_Y;
        let bottom = PLAYER_Y + PLAYER_HEIGHT;

        let closest_x = self.x.clamp(left, right);
        let closest_y = self.y.clamp(top, bottom);
        let dx = self.x - closest_x;
        let dy = self.y - closest_y;
        let reach = COIN_RADIUS + CATCH_FORGIVENESS;

        dx * dx + dy * dy <= reach * reach
    }

    pub fn view(&self) -> CoinState {
        CoinState {
            id: self.id,
            x: self.x,
            y: self.y,
            rotation: self.rotation,
        }
    }
}

/// The simulated part of a round. Persisted as-is in the room snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicsWorld {
    pub objects: Vec<FallingObject>,
    pub time_left: f32,
    pub spawn_accumulator: f32,
    pub next_object_id: CoinId,
}

impl PhysicsWorld {
    pub fn new(round_seconds: f32) -> Self {
        Self {
            objects: Vec::new(),
            time_left: round_seconds,
            spawn_accumulator: 0.0,
            next_object_id: 1,
        }
    }

    /// Clears the field for a fresh round. Object ids keep counting up.
    pub fn reset(&mut self, round_seconds: f32) {
        self.objects.clear();
        self.time_left = round_seconds;
        self.spawn_accumulator = 0.0;
    }

    pub fn coin_views(&self) -> Vec<CoinState> {
        self.objects.iter().map(FallingObject::view).collect()
    }

    fn spawn<R: Rng>(&mut self, age: f32, config: &RoomConfig, rng: &mut R) {
        if self.objects.len() >= config.max_objects {
            return;
        }

        let margin = COIN_RADIUS + config.max_wobble;
        let origin_x = if WORLD_WIDTH > 2.0 * margin {
            rng.gen_range(margin..=WORLD_WIDTH - margin)
        } else {
            WORLD_WIDTH / 2.0
        };

        let mut object = FallingObject {
            id: self.next_object_id,
            origin_x,
            x: origin_x,
            y: -COIN_RADIUS,
            fall_speed: rng.gen_range(config.min_fall_speed..=config.max_fall_speed),
            rotation: rng.gen_range(0.0..TAU),
            rotation_speed: rng.gen_range(-config.max_rotation_speed..=config.max_rotation_speed),
            wobble_phase: rng.gen_range(0.0..TAU),
            wobble_amount: rng.gen_range(0.0..=config.max_wobble),
        };
        self.next_object_id = self.next_object_id.wrapping_add(1).max(1);

        // Account for the part of the step that elapsed after the spawn moment.
        object.simulate(age);
        self.objects.push(object);
    }
}

/// Limits a wall-clock gap to one simulatable step. Negative or NaN gaps count as zero.
pub fn clamp_step(dt: f32, max_step: f32) -> f32 {
    if dt.is_nan() || dt <= 0.0 {
        0.0
    } else {
        dt.min(max_step)
    }
}

/// Runs one physics step and returns the catches it produced.
///
/// Order within a step: the round clock runs down, existing objects fall,
/// objects past the ground line disappear, due spawns appear, and finally every
/// remaining object is tested against the players in slice order. The first
/// player that overlaps an object catches it and scores; nobody else can.
pub fn advance<R: Rng>(
    dt: f32,
    world: &mut PhysicsWorld,
    players: &mut [PlayerRecord],
    config: &RoomConfig,
    rng: &mut R,
) -> Vec<CollectedEvent> {
    let dt = clamp_step(dt, config.max_step);

    world.time_left = (world.time_left - dt).max(0.0);
    if world.time_left < CLOCK_EPSILON {
        world.time_left = 0.0;
    }

    for object in &mut world.objects {
        object.simulate(dt);
    }
    world.objects.retain(|object| !object.is_grounded());

    world.spawn_accumulator += dt;
    while world.spawn_accumulator >= config.spawn_interval {
        world.spawn_accumulator -= config.spawn_interval;
        let age = world.spawn_accumulator;
        world.spawn(age, config, rng);
    }

    let mut collected = Vec::new();
    world.objects.retain(|object| {
        let catcher = players.iter_mut().find(|p| object.is_caught_by(p.x));
        match catcher {
            Some(player) => {
                player.score += config.points_per_catch;
                collected.push(CollectedEvent {
                    player_id: player.id,
                    x: object.x,
                    y: object.y,
                });
                false
            }
            None => true,
        }
    });

    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PlayerRecord;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn coin(id: CoinId, x: f32, y: f32, speed: f32) -> FallingObject {
        FallingObject {
            id,
            origin_x: x,
            x,
            y,
            fall_speed: speed,
            rotation: 0.0,
            rotation_speed: 1.0,
            wobble_phase: 0.0,
            wobble_amount: 0.0,
        }
    }

    fn player(id: u32, x: f32) -> PlayerRecord {
        PlayerRecord::new(id, id as u64, format!("p{}", id), "#fff".to_string(), None, None, x)
    }

    #[test]
    fn test_time_left_never_negative() {
        let config = RoomConfig::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut world = PhysicsWorld::new(0.3);

        let mut previous = world.time_left;
        for _ in 0..10 {
            advance(0.1, &mut world, &mut [], &config, &mut rng);
            assert!(world.time_left <= previous);
            assert!(world.time_left >= 0.0);
            previous = world.time_left;
        }
        assert_eq!(world.time_left, 0.0);
    }

    #[test]
    fn test_large_gap_behaves_like_max_step() {
        let config = RoomConfig::default();

        let mut huge = PhysicsWorld::new(60.0);
        huge.objects.push(coin(1, 100.0, 0.0, 200.0));
        let mut capped = huge.clone();

        advance(10.0, &mut huge, &mut [], &config, &mut StdRng::seed_from_u64(7));
        advance(config.max_step, &mut capped, &mut [], &config, &mut StdRng::seed_from_u64(7));

        assert_eq!(huge, capped);
        assert_approx_eq!(huge.time_left, 60.0 - config.max_step, 0.0001);
    }

    #[test]
    fn test_clamp_step() {
        assert_eq!(clamp_step(-1.0, 0.2), 0.0);
        assert_eq!(clamp_step(f32::NAN, 0.2), 0.0);
        assert_eq!(clamp_step(0.05, 0.2), 0.05);
        assert_eq!(clamp_step(3.0, 0.2), 0.2);
    }

    #[test]
    fn test_object_cap() {
        let config = RoomConfig {
            spawn_interval: 0.001,
            ..RoomConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut world = PhysicsWorld::new(60.0);

        for _ in 0..20 {
            advance(0.2, &mut world, &mut [], &config, &mut rng);
            assert!(world.objects.len() <= config.max_objects);
        }
        assert_eq!(world.objects.len(), config.max_objects);
    }

    #[test]
    fn test_catch_scores_once() {
        let config = RoomConfig::default();
        let mut rng = StdRng::seed_from_u64(5);
        let mut world = PhysicsWorld::new(60.0);
        world.objects.push(coin(1, 400.0, PLAYER_Y - 5.0, 100.0));

        // Two players on top of each other: only the first one may score.
        let mut players = vec![player(1, 400.0), player(2, 400.0)];
        let events = advance(0.01, &mut world, &mut players, &config, &mut rng);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].player_id, 1);
        assert_eq!(players[0].score, 10);
        assert_eq!(players[1].score, 0);
        assert!(world.objects.is_empty());

        let events = advance(0.01, &mut world, &mut players, &config, &mut rng);
        assert!(events.is_empty());
        assert_eq!(players[0].score, 10);
    }

    #[test]
    fn test_catch_forgiveness_reach() {
        let edge = 400.0 + PLAYER_WIDTH / 2.0 + COIN_RADIUS + CATCH_FORGIVENESS;
        let near = coin(1, edge - 1.0, PLAYER_Y, 0.0);
        let far = coin(2, edge + 1.0, PLAYER_Y, 0.0);
        assert!(near.is_caught_by(400.0));
        assert!(!far.is_caught_by(400.0));
    }

    #[test]
    fn test_ground_miss_is_silent() {
        let config = RoomConfig::default();
        let mut rng = StdRng::seed_from_u64(9);
        let mut world = PhysicsWorld::new(60.0);
        world.objects.push(coin(1, 50.0, GROUND_Y - 1.0, 200.0));

        // Player far away from the coin.
        let mut players = vec![player(1, 700.0)];
        let events = advance(0.1, &mut world, &mut players, &config, &mut rng);

        assert!(events.is_empty());
        assert!(world.objects.iter().all(|o| o.id != 1));
        assert_eq!(players[0].score, 0);
    }

    #[test]
    fn test_wobble_depends_on_height_only() {
        let mut a = coin(1, 300.0, 0.0, 100.0);
        a.wobble_amount = 20.0;
        a.wobble_phase = 1.3;
        let mut b = a.clone();

        a.simulate(1.0);
        for _ in 0..10 {
            b.simulate(0.1);
        }

        assert_approx_eq!(a.y, b.y, 0.01);
        assert_approx_eq!(a.x, b.x, 0.01);
        assert_approx_eq!(a.rotation, b.rotation, 0.01);
    }

    #[test]
    fn test_step_partition_converges() {
        let config = RoomConfig {
            spawn_interval: 0.35,
            ..RoomConfig::default()
        };

        let mut fine = PhysicsWorld::new(60.0);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..25 {
            advance(0.04, &mut fine, &mut [], &config, &mut rng);
        }

        let mut coarse = PhysicsWorld::new(60.0);
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..5 {
            advance(0.2, &mut coarse, &mut [], &config, &mut rng);
        }

        assert_eq!(fine.objects.len(), 2);
        assert_eq!(fine.objects.len(), coarse.objects.len());
        assert_approx_eq!(fine.time_left, coarse.time_left, 0.001);
        for (f, c) in fine.objects.iter().zip(&coarse.objects) {
            assert_eq!(f.id, c.id);
            assert_approx_eq!(f.y, c.y, 0.05);
            assert_approx_eq!(f.x, c.x, 0.05);
        }
    }

    #[test]
    fn test_spawned_objects_start_above_field() {
        let config = RoomConfig {
            spawn_interval: 0.1,
            ..RoomConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let mut world = PhysicsWorld::new(60.0);

        advance(config.spawn_interval, &mut world, &mut [], &config, &mut rng);

        assert_eq!(world.objects.len(), 1);
        let object = &world.objects[0];
        assert!(object.y < COIN_RADIUS);
        assert!(object.fall_speed >= config.min_fall_speed);
        assert!(object.fall_speed <= config.max_fall_speed);
        assert!(object.x >= COIN_RADIUS && object.x <= WORLD_WIDTH - COIN_RADIUS);
    }
}
