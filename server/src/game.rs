//! The room state machine.
//!
//! A [`Room`] is the single owner of everything a round needs: the lifecycle
//! state, the physics world, the active roster and the waiting queue. All
//! mutation goes through `&mut self` from one actor task, so nothing in here
//! locks or awaits.
//!
//! The room cycles `Lobby -> Countdown -> Playing -> GameOver -> Lobby` forever.
//! Progress without player input is driven by a single pending alarm
//! (`alarm_at`) that the host fires once it is due.

use crate::client_manager::{ClientManager, ConnectionId, Outbound};
use crate::config::RoomConfig;
use crate::physics::{advance, clamp_step, PhysicsWorld};
use crate::session::{
    admit, starting_positions, Admission, Attachment, ConnectionState, JoinRequest, PlayerRecord,
    WaitingRecord,
};
use crate::settlement::{settle, Award};
use crate::storage::SnapshotStore;
use crate::utils::{elapsed_secs, seconds_until};
use coinfall_shared::{ClientMessage, CollectedEvent, PlayerId, ServerMessage, WORLD_WIDTH};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

/// Spacing of countdown notifications.
const COUNTDOWN_TICK_MS: u64 = 1000;

const WAITING_ROOM_FULL: &str = "The room is full. You will join the next round.";
const WAITING_ROUND_RUNNING: &str = "A round is in progress. You will join the next round.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomState {
    Lobby,
    Countdown,
    Playing,
    GameOver,
}

/// Everything about the room that is not player data.
///
/// Rosters are rebuilt from connection attachments, never from here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub state: RoomState,
    pub countdown: u32,
    pub world: PhysicsWorld,
    pub next_player_id: PlayerId,
    pub color_cursor: usize,
    pub alarm_at: Option<u64>,
    pub last_physics_at: u64,
    pub last_broadcast_at: u64,
    pub pending_collected: Vec<CollectedEvent>,
    pub saved_at: u64,
}

pub struct Room {
    config: RoomConfig,
    store: Arc<dyn SnapshotStore>,
    rng: StdRng,

    state: RoomState,
    countdown: u32,
    world: PhysicsWorld,
    /// Active roster in join order. Catch priority follows this order.
    players: Vec<PlayerRecord>,
    /// FIFO queue for the next round.
    waiting: Vec<WaitingRecord>,
    /// Hot-path write handles for every joined connection.
    outbound: HashMap<ConnectionId, Outbound>,

    next_player_id: PlayerId,
    color_cursor: usize,
    alarm_at: Option<u64>,
    last_physics_at: u64,
    last_broadcast_at: u64,
    pending_collected: Vec<CollectedEvent>,
    /// Settlement of the last finished round, waiting to be dispatched.
    awards: Vec<Award>,
}

impl Room {
    pub fn new(config: RoomConfig, store: Arc<dyn SnapshotStore>, rng: StdRng) -> Self {
        let world = PhysicsWorld::new(config.round_seconds);
        Self {
            config,
            store,
            rng,
            state: RoomState::Lobby,
            countdown: 0,
            world,
            players: Vec::new(),
            waiting: Vec::new(),
            outbound: HashMap::new(),
            next_player_id: 1,
            color_cursor: 0,
            alarm_at: None,
            last_physics_at: 0,
            last_broadcast_at: 0,
            pending_collected: Vec::new(),
            awards: Vec::new(),
        }
    }

    /// Brings a room back after it was evicted or the process restarted.
    ///
    /// Shared state comes from the last snapshot, the rosters from whatever
    /// live connections carry. A round left running without players goes
    /// straight back to the lobby. Exactly one alarm is armed afterwards.
    pub fn restore(
        config: RoomConfig,
        store: Arc<dyn SnapshotStore>,
        rng: StdRng,
        clients: &mut ClientManager,
        now: u64,
    ) -> Self {
        let mut room = Self::new(config, store, rng);

        match room.store.load() {
            Ok(Some(snapshot)) => room.apply_snapshot(snapshot),
            Ok(None) => debug!("No snapshot found, starting a fresh room"),
            Err(e) => warn!("Ignoring unreadable room snapshot: {}", e),
        }
        room.rebuild_rosters(clients);

        info!(
            "Restored room in {:?} with {} players and {} waiting",
            room.state,
            room.players.len(),
            room.waiting.len()
        );

        let in_round = matches!(room.state, RoomState::Countdown | RoomState::Playing);
        if in_round && room.players.is_empty() {
            warn!("Restored {:?} room has no players, returning to lobby", room.state);
            room.enter_lobby(clients, now);
        } else {
            room.rearm(now);
            room.persist(now);
        }
        room
    }

    fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        self.state = snapshot.state;
        self.countdown = snapshot.countdown;
        self.world = snapshot.world;
        self.next_player_id = snapshot.next_player_id;
        self.color_cursor = snapshot.color_cursor;
        self.alarm_at = snapshot.alarm_at;
        self.last_physics_at = snapshot.last_physics_at;
        self.last_broadcast_at = snapshot.last_broadcast_at;
        self.pending_collected = snapshot.pending_collected;
    }

    fn rebuild_rosters(&mut self, clients: &mut ClientManager) {
        let mut players = Vec::new();
        let mut waiting = Vec::new();

        for connection in clients.connections() {
            if connection.outbound().is_closed() {
                continue;
            }
            match connection.attachment() {
                Some(Attachment::Player(player)) => players.push(player.clone()),
                Some(Attachment::Waiting(entry)) => waiting.push(entry.clone()),
                None => continue,
            }
            self.outbound
                .insert(connection.id, connection.outbound().clone());
        }

        players.sort_by_key(|p: &PlayerRecord| p.id);
        if players.len() > self.config.max_players {
            for player in players.split_off(self.config.max_players) {
                let entry = WaitingRecord::from(player);
                clients.attach(entry.connection_id, Attachment::Waiting(entry.clone()));
                waiting.push(entry);
            }
        }
        waiting.sort_by_key(|w: &WaitingRecord| w.id);

        let highest = players
            .iter()
            .map(|p| p.id)
            .chain(waiting.iter().map(|w| w.id))
            .max()
            .unwrap_or(0);
        self.next_player_id = self.next_player_id.max(highest + 1);

        self.players = players;
        self.waiting = waiting;
    }

    /// Keeps a restored alarm, or arms the default one for the current state.
    fn rearm(&mut self, now: u64) {
        let fallback = match self.state {
            RoomState::Lobby => now + self.config.idle_timeout_ms(),
            RoomState::Countdown => now + COUNTDOWN_TICK_MS,
            RoomState::Playing => now + self.config.fallback_tick_ms(),
            RoomState::GameOver => now + self.config.game_over_display_ms(),
        };
        self.alarm_at = if self.state == RoomState::Lobby && self.players.is_empty() {
            None
        } else {
            Some(self.alarm_at.unwrap_or(fallback))
        };
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn countdown(&self) -> u32 {
        self.countdown
    }

    pub fn time_left(&self) -> f32 {
        self.world.time_left
    }

    pub fn players(&self) -> &[PlayerRecord] {
        &self.players
    }

    pub fn waiting(&self) -> &[WaitingRecord] {
        &self.waiting
    }

    /// When the room next needs to be woken, if ever.
    pub fn alarm_at(&self) -> Option<u64> {
        self.alarm_at
    }

    /// Hands over the awards of the last finished round, at most once.
    pub fn take_awards(&mut self) -> Vec<Award> {
        std::mem::take(&mut self.awards)
    }

    pub fn snapshot(&self, now: u64) -> RoomSnapshot {
        RoomSnapshot {
            state: self.state,
            countdown: self.countdown,
            world: self.world.clone(),
            next_player_id: self.next_player_id,
            color_cursor: self.color_cursor,
            alarm_at: self.alarm_at,
            last_physics_at: self.last_physics_at,
            last_broadcast_at: self.last_broadcast_at,
            pending_collected: self.pending_collected.clone(),
            saved_at: now,
        }
    }

    pub fn persist(&self, now: u64) {
        if let Err(e) = self.store.save(&self.snapshot(now)) {
            warn!("Failed to persist room snapshot: {}", e);
        }
    }

    /// Processes one inbound text frame. Malformed frames are dropped.
    pub fn handle_message(
        &mut self,
        clients: &mut ClientManager,
        connection_id: ConnectionId,
        text: &str,
        now: u64,
    ) {
        let Some(message) = ClientMessage::decode(text) else {
            debug!("Dropping malformed payload from connection {}", connection_id);
            return;
        };

        match message {
            ClientMessage::Join {
                name,
                user_id,
                cosmetic_id,
            } => self.handle_join(
                clients,
                connection_id,
                &name,
                user_id.as_deref(),
                cosmetic_id.as_deref(),
                now,
            ),
            ClientMessage::Move { x } => self.handle_move(clients, connection_id, x, now),
        }
    }

    fn handle_join(
        &mut self,
        clients: &mut ClientManager,
        connection_id: ConnectionId,
        name: &str,
        user_id: Option<&str>,
        cosmetic_id: Option<&str>,
        now: u64,
    ) {
        if clients.attachment(&connection_id).is_some() {
            debug!("Connection {} already joined", connection_id);
            return;
        }
        let Some(outbound) = clients.outbound(&connection_id) else {
            debug!("Join from unknown connection {}", connection_id);
            return;
        };

        let request = match JoinRequest::parse(name, user_id, cosmetic_id, &self.config) {
            Ok(request) => request,
            Err(e) => {
                info!("Rejected name from connection {}", connection_id);
                self.send_to(
                    clients,
                    connection_id,
                    &ServerMessage::NameRejected {
                        reason: e.reason().to_string(),
                    },
                );
                return;
            }
        };

        let player_id = self.next_player_id;
        self.next_player_id += 1;
        self.outbound.insert(connection_id, outbound);

        match admit(
            self.state == RoomState::Lobby,
            self.players.len(),
            &self.config,
        ) {
            Admission::Active => {
                let color = self.next_color();
                let slot = self.players.len();
                let x = starting_positions(slot + 1)
                    .last()
                    .copied()
                    .unwrap_or(WORLD_WIDTH / 2.0);
                let player = PlayerRecord::new(
                    player_id,
                    connection_id,
                    request.name,
                    color,
                    request.cosmetic_id,
                    request.user_id,
                    x,
                );
                info!("Player {} ({}) joined", player.id, player.name);

                clients.attach(connection_id, Attachment::Player(player.clone()));
                self.players.push(player);
                self.send_to(clients, connection_id, &ServerMessage::Welcome { player_id });

                if self.players.len() >= self.config.max_players {
                    self.start_countdown(clients, now);
                    return;
                }
                if self.alarm_at.is_none() {
                    self.alarm_at = Some(now + self.config.idle_timeout_ms());
                }
                self.broadcast_lobby(clients, now);
                self.persist(now);
            }
            Admission::Waiting => {
                let entry = WaitingRecord {
                    id: player_id,
                    connection_id,
                    name: request.name,
                    cosmetic_id: request.cosmetic_id,
                    user_id: request.user_id,
                };
                info!("Player {} ({}) is waiting for the next round", entry.id, entry.name);

                clients.attach(connection_id, Attachment::Waiting(entry.clone()));
                self.waiting.push(entry);

                let message = if self.state == RoomState::Lobby {
                    WAITING_ROOM_FULL
                } else {
                    WAITING_ROUND_RUNNING
                };
                self.send_to(
                    clients,
                    connection_id,
                    &ServerMessage::Waiting {
                        message: message.to_string(),
                    },
                );
            }
        }
    }

    fn handle_move(&mut self, clients: &mut ClientManager, connection_id: ConnectionId, x: f32, now: u64) {
        let Some(player) = self
            .players
            .iter_mut()
            .find(|p| p.connection_id == connection_id)
        else {
            debug!("Ignoring move from non-player connection {}", connection_id);
            return;
        };
        player.move_to(x);
        clients.attach(connection_id, Attachment::Player(player.clone()));

        if self.state != RoomState::Playing {
            return;
        }

        self.step_physics(clients, now);
        if self.world.time_left <= 0.0 {
            self.end_round(clients, now);
            return;
        }
        self.broadcast_game_state(clients, now, false);
        self.abandon_if_empty(clients, now);
    }

    /// Removes a closed connection from the registry and the rosters.
    pub fn handle_disconnect(&mut self, clients: &mut ClientManager, connection_id: ConnectionId, now: u64) {
        clients.unregister(&connection_id);
        self.outbound.remove(&connection_id);

        if let Some(index) = self
            .waiting
            .iter()
            .position(|w| w.connection_id == connection_id)
        {
            let entry = self.waiting.remove(index);
            info!("Waiting player {} left", entry.id);
            return;
        }

        let Some(index) = self
            .players
            .iter()
            .position(|p| p.connection_id == connection_id)
        else {
            return;
        };
        let player = self.players.remove(index);
        info!("Player {} ({}) left", player.id, player.name);

        match self.state {
            RoomState::Lobby => {
                if self.players.is_empty() {
                    self.alarm_at = None;
                }
                self.broadcast_lobby(clients, now);
                self.persist(now);
            }
            RoomState::Countdown | RoomState::Playing => {
                self.abandon_if_empty(clients, now);
            }
            RoomState::GameOver => {}
        }
    }

    /// Fires the pending alarm if it is due. Early calls are ignored.
    pub fn handle_alarm(&mut self, clients: &mut ClientManager, now: u64) {
        match self.alarm_at {
            Some(at) if at <= now => self.alarm_at = None,
            _ => return,
        }

        match self.state {
            RoomState::Lobby => {
                if self.players.is_empty() {
                    self.persist(now);
                } else {
                    self.start_countdown(clients, now);
                }
            }
            RoomState::Countdown => self.tick_countdown(clients, now),
            RoomState::Playing => self.tick_round(clients, now),
            RoomState::GameOver => self.enter_lobby(clients, now),
        }
    }

    fn tick_countdown(&mut self, clients: &mut ClientManager, now: u64) {
        if self.players.is_empty() {
            self.enter_lobby(clients, now);
            return;
        }

        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.start_round(clients, now);
            return;
        }

        self.broadcast_full(
            clients,
            &ServerMessage::Countdown {
                seconds: self.countdown,
            },
        );
        self.alarm_at = Some(now + COUNTDOWN_TICK_MS);
        self.persist(now);
    }

    /// Fallback tick: guarantees the round advances when nobody moves.
    fn tick_round(&mut self, clients: &mut ClientManager, now: u64) {
        if self.players.is_empty() {
            info!("Round abandoned, no players left");
            self.enter_lobby(clients, now);
            return;
        }

        self.step_physics(clients, now);
        if self.world.time_left <= 0.0 {
            self.end_round(clients, now);
            return;
        }

        self.broadcast_game_state(clients, now, true);
        if self.abandon_if_empty(clients, now) {
            return;
        }
        // Ticks do not persist; eviction and shutdown do.
        self.alarm_at = Some(now + self.config.fallback_tick_ms());
    }

    /// Simulates the wall-clock time since the last step.
    ///
    /// The gap is capped at `max_catch_up` and fed to the engine in chunks of
    /// at most `max_step`, so message-driven and timer-driven steps cover the
    /// same simulated time for the same elapsed time.
    fn step_physics(&mut self, clients: &mut ClientManager, now: u64) {
        let mut remaining = elapsed_secs(self.last_physics_at, now).min(self.config.max_catch_up);
        self.last_physics_at = self.last_physics_at.max(now);

        let mut caught = false;
        while remaining > 0.0 && self.world.time_left > 0.0 {
            let dt = clamp_step(remaining, self.config.max_step);
            let events = advance(
                dt,
                &mut self.world,
                &mut self.players,
                &self.config,
                &mut self.rng,
            );
            caught |= !events.is_empty();
            self.pending_collected.extend(events);
            remaining -= dt;
        }

        if caught {
            for player in &self.players {
                clients.attach(player.connection_id, Attachment::Player(player.clone()));
            }
        }
    }

    fn start_countdown(&mut self, clients: &mut ClientManager, now: u64) {
        self.state = RoomState::Countdown;
        self.countdown = self.config.countdown_seconds;
        info!("Countdown started with {} players", self.players.len());

        self.broadcast_full(
            clients,
            &ServerMessage::Countdown {
                seconds: self.countdown,
            },
        );
        self.alarm_at = Some(now + COUNTDOWN_TICK_MS);
        self.persist(now);
    }

    fn start_round(&mut self, clients: &mut ClientManager, now: u64) {
        self.state = RoomState::Playing;
        self.countdown = 0;
        self.world.reset(self.config.round_seconds);
        self.pending_collected.clear();
        self.spread_players(clients);
        info!("Round started with {} players", self.players.len());

        self.last_physics_at = now;
        self.broadcast_game_state(clients, now, true);
        if self.abandon_if_empty(clients, now) {
            return;
        }
        self.alarm_at = Some(now + self.config.fallback_tick_ms());
        self.persist(now);
    }

    fn end_round(&mut self, clients: &mut ClientManager, now: u64) {
        // Catches still held back by the throttle go out before the results.
        if !self.pending_collected.is_empty() {
            self.broadcast_game_state(clients, now, true);
        }
        self.state = RoomState::GameOver;
        self.pending_collected.clear();

        let settlement = settle(&self.players, &self.config);
        if let Some(top) = settlement.standings.first() {
            info!("Round over, {} leads with {}", top.name, top.score);
        }
        self.awards = settlement.awards;

        self.broadcast_full(
            clients,
            &ServerMessage::GameOver {
                players: settlement.standings,
            },
        );
        self.alarm_at = Some(now + self.config.game_over_display_ms());
        self.persist(now);
    }

    /// Returns to the lobby and fills free slots from the waiting queue.
    fn enter_lobby(&mut self, clients: &mut ClientManager, now: u64) {
        self.state = RoomState::Lobby;
        self.countdown = 0;
        self.world.reset(self.config.round_seconds);
        self.pending_collected.clear();

        let free = self.config.max_players.saturating_sub(self.players.len());
        let promote = free.min(self.waiting.len());
        let promoted: Vec<WaitingRecord> = self.waiting.drain(..promote).collect();
        let mut welcomed = Vec::with_capacity(promoted.len());
        for entry in promoted {
            welcomed.push((entry.connection_id, entry.id));
            self.players.push(entry.promote(String::new(), WORLD_WIDTH / 2.0));
        }

        for (slot, player) in self.players.iter_mut().enumerate() {
            player.color = self.config.color_for(slot);
        }
        self.color_cursor = self.players.len();
        self.spread_players(clients);

        for (connection_id, player_id) in welcomed {
            info!("Player {} promoted from the waiting room", player_id);
            self.send_to(clients, connection_id, &ServerMessage::Welcome { player_id });
        }

        if self.players.len() >= self.config.max_players {
            self.start_countdown(clients, now);
            return;
        }

        self.alarm_at = if self.players.is_empty() {
            None
        } else {
            Some(now + self.config.idle_timeout_ms())
        };
        info!("Back in lobby with {} players", self.players.len());
        self.broadcast_lobby(clients, now);
        self.persist(now);
    }

    /// Spreads the roster evenly, zeroes scores and re-attaches every record.
    fn spread_players(&mut self, clients: &mut ClientManager) {
        let positions = starting_positions(self.players.len());
        for (player, x) in self.players.iter_mut().zip(positions) {
            player.score = 0;
            player.move_to(x);
            clients.attach(player.connection_id, Attachment::Player(player.clone()));
        }
    }

    /// Drops back to the lobby when a round has lost every player.
    fn abandon_if_empty(&mut self, clients: &mut ClientManager, now: u64) -> bool {
        let in_round = matches!(self.state, RoomState::Countdown | RoomState::Playing);
        if in_round && self.players.is_empty() {
            info!("No players left during {:?}, returning to lobby", self.state);
            self.enter_lobby(clients, now);
            true
        } else {
            false
        }
    }

    fn next_color(&mut self) -> String {
        let color = self.config.color_for(self.color_cursor);
        self.color_cursor += 1;
        color
    }

    /// Hot path: writes one serialized `gameState` to every joined connection.
    ///
    /// Unless forced, writes are spaced by the broadcast interval; catches
    /// queue up in the meantime and ride along with the next frame. A
    /// connection that cannot take the frame is evicted on the spot.
    fn broadcast_game_state(&mut self, clients: &mut ClientManager, now: u64, force: bool) {
        if !force && now.saturating_sub(self.last_broadcast_at) < self.config.broadcast_interval_ms()
        {
            return;
        }
        self.last_broadcast_at = now;

        let message = ServerMessage::GameState {
            players: self.players.iter().map(PlayerRecord::game_view).collect(),
            coins: self.world.coin_views(),
            time_left: self.world.time_left,
            collected: std::mem::take(&mut self.pending_collected),
        };
        let Some(frame) = encode(&message) else {
            return;
        };

        let recipients = self
            .players
            .iter()
            .map(|p| p.connection_id)
            .chain(self.waiting.iter().map(|w| w.connection_id));

        let mut dead = Vec::new();
        for connection_id in recipients {
            let delivered = match self.outbound.get(&connection_id) {
                Some(outbound) => outbound.send(&frame),
                None => continue,
            };
            if let Err(e) = delivered {
                warn!("Evicting connection {}: {}", connection_id, e);
                dead.push(connection_id);
            }
        }

        if !dead.is_empty() {
            self.evict(clients, &dead);
        }
    }

    fn evict(&mut self, clients: &mut ClientManager, dead: &[ConnectionId]) {
        for player in self
            .players
            .iter_mut()
            .filter(|p| dead.contains(&p.connection_id))
        {
            player.connection_state = ConnectionState::Stale;
        }
        self.players
            .retain(|p| p.connection_state == ConnectionState::Connected);
        self.waiting.retain(|w| !dead.contains(&w.connection_id));

        for connection_id in dead {
            self.outbound.remove(connection_id);
            clients.unregister(connection_id);
        }
    }

    fn broadcast_lobby(&self, clients: &ClientManager, now: u64) {
        let idle_timer = self
            .alarm_at
            .map(|at| seconds_until(at, now))
            .unwrap_or(0);
        let message = ServerMessage::Lobby {
            players: self.players.iter().map(PlayerRecord::lobby_view).collect(),
            idle_timer,
        };
        self.broadcast_full(clients, &message);
    }

    /// Low-frequency path: scans the registry and writes to every onboarded
    /// connection. Failures are skipped, nothing is evicted.
    fn broadcast_full(&self, clients: &ClientManager, message: &ServerMessage) {
        let Some(frame) = encode(message) else {
            return;
        };
        for connection in clients.connections().filter(|c| c.is_onboarded()) {
            if let Err(e) = connection.outbound().send(&frame) {
                debug!(
                    "Skipping {} for connection {}: {}",
                    message.kind(),
                    connection.id,
                    e
                );
            }
        }
    }

    fn send_to(&self, clients: &ClientManager, connection_id: ConnectionId, message: &ServerMessage) {
        let (Some(outbound), Some(frame)) = (clients.outbound(&connection_id), encode(message))
        else {
            return;
        };
        if let Err(e) = outbound.send(&frame) {
            debug!(
                "Failed to send {} to connection {}: {}",
                message.kind(),
                connection_id,
                e
            );
        }
    }
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match message.to_json() {
        Ok(json) => Some(Message::text(json)),
        Err(e) => {
            error!("Failed to serialize {}: {}", message.kind(), e);
            None
        }
    }
}
