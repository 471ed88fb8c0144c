//! The authoritative room loop.
//!
//! A room is an actor: one task owns the simulation, the seat roster and the phase,
//! and everything else talks to it through a bounded mailbox. Join, reconnect,
//! leave, disconnect, input and room actions are handled one at a time, and the
//! fixed-rate tick drains the mailbox before stepping so every tick sees all input
//! received before it.

use crate::client_manager::{ClientManager, SeatKind};
use crate::config::ServerConfig;
use crate::error::{RoomError, SessionError};
use crate::game::Game;
use crate::input_buffer::{FallbackPolicy, InputOutcome};
use crate::session::Session;
use crate::token::{SessionTokenService, TokenClaims};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{
    FrameInput, GameEvent, Packet, Phase, RoomAction, RoomInfo, WanderBot, WorldView,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

pub enum RoomEvent {
    Join {
        session: Arc<dyn Session>,
        name: String,
        reply: oneshot::Sender<Result<u32, RoomError>>,
    },
    Reconnect {
        session: Arc<dyn Session>,
        claims: TokenClaims,
        reply: oneshot::Sender<Result<u32, RoomError>>,
    },
    /// Explicit leave: the seat and the entity are removed
    Leave { player_id: u32 },
    /// Transport loss: the seat is held for the reconnection grace period
    Disconnected { player_id: u32, session_id: u64 },
    Input {
        player_id: u32,
        inputs: Vec<FrameInput>,
    },
    Action {
        player_id: u32,
        action: RoomAction,
    },
}

/// What the outside world may know about a room without asking its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStatus {
    pub seated: usize,
    pub humans: usize,
    pub capacity: usize,
    pub phase: Phase,
    /// Set by the reaper; a closing room accepts nothing new
    pub closing: bool,
}

fn lock(status: &Mutex<RoomStatus>) -> MutexGuard<'_, RoomStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct RoomHandle {
    id: String,
    mailbox: mpsc::Sender<RoomEvent>,
    status: Arc<Mutex<RoomStatus>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RoomHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> RoomStatus {
        *lock(&self.status)
    }

    pub fn info(&self) -> RoomInfo {
        let status = self.status();
        RoomInfo {
            room_id: self.id.clone(),
            players: status.seated,
            capacity: status.capacity,
            phase: status.phase,
        }
    }

    /// Whether an auto-matched join should be routed here
    pub fn is_joinable(&self) -> bool {
        let status = self.status();
        !status.closing && status.phase != Phase::Ending && status.seated < status.capacity
    }

    /// Flags the room as closing if nobody is seated and no round is live.
    /// Checked and set under one lock so a concurrent join cannot slip in between.
    pub fn mark_closing_if_idle(&self) -> bool {
        let mut status = lock(&self.status);
        let idle = status.seated == 0 && !matches!(status.phase, Phase::Running | Phase::Countdown);
        if idle {
            status.closing = true;
        }
        idle
    }

    pub fn is_closing(&self) -> bool {
        lock(&self.status).closing
    }

    pub async fn join(&self, session: Arc<dyn Session>, name: String) -> Result<u32, RoomError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(RoomEvent::Join {
                session,
                name,
                reply,
            })
            .await
            .map_err(|_| RoomError::Closed)?;
        response.await.map_err(|_| RoomError::Closed)?
    }

    /// Resumes the seat named by verified token claims
    pub async fn reconnect(
        &self,
        session: Arc<dyn Session>,
        claims: TokenClaims,
    ) -> Result<u32, RoomError> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(RoomEvent::Reconnect {
                session,
                claims,
                reply,
            })
            .await
            .map_err(|_| RoomError::Closed)?;
        response.await.map_err(|_| RoomError::Closed)?
    }

    pub async fn send(&self, event: RoomEvent) -> Result<(), RoomError> {
        self.mailbox.send(event).await.map_err(|_| RoomError::Closed)
    }

    /// Non-blocking delivery for lossy traffic such as input batches
    pub fn try_send(&self, event: RoomEvent) -> bool {
        self.mailbox.try_send(event).is_ok()
    }

    pub fn shutdown(&self) {
        lock(&self.status).closing = true;
        self.shutdown.send_replace(true);
    }
}

pub struct Room {
    id: String,
    /// Distinguishes this instance from earlier rooms that used the same id
    epoch: u64,
    config: Arc<ServerConfig>,
    tokens: SessionTokenService,
    game: Game,
    phase: Phase,
    /// Ticks spent in the current phase
    phase_ticks: u32,
    seats: ClientManager,
    status: Arc<Mutex<RoomStatus>>,
    seeds: StdRng,
    bots_created: u32,
}

impl Room {
    pub fn new(id: impl Into<String>, config: Arc<ServerConfig>, tokens: SessionTokenService) -> Self {
        let mut seeds = StdRng::from_entropy();
        let game = Game::new(config.game, seeds.gen());
        Self::build(id.into(), config, tokens, game, seeds)
    }

    /// A room around a prepared world, for tests and tools
    pub fn with_game(
        id: impl Into<String>,
        config: Arc<ServerConfig>,
        tokens: SessionTokenService,
        game: Game,
    ) -> Self {
        let seeds = StdRng::seed_from_u64(game.seed());
        Self::build(id.into(), config, tokens, game, seeds)
    }

    fn build(
        id: String,
        config: Arc<ServerConfig>,
        tokens: SessionTokenService,
        game: Game,
        seeds: StdRng,
    ) -> Self {
        let status = Arc::new(Mutex::new(RoomStatus {
            seated: 0,
            humans: 0,
            capacity: config.room_capacity,
            phase: Phase::Waiting,
            closing: false,
        }));
        Self {
            id,
            epoch: rand::random(),
            seats: ClientManager::new(config.room_capacity, config.input_lookback),
            config,
            tokens,
            game,
            phase: Phase::Waiting,
            phase_ticks: 0,
            status,
            seeds,
            bots_created: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn seats(&self) -> &ClientManager {
        &self.seats
    }

    /// Starts the event loop on the runtime and returns the handle to reach it
    pub fn spawn(self) -> (RoomHandle, JoinHandle<()>) {
        let (mailbox, events) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let (shutdown, shutdown_signal) = watch::channel(false);
        let handle = RoomHandle {
            id: self.id.clone(),
            mailbox,
            status: self.status.clone(),
            shutdown: Arc::new(shutdown),
        };
        let task = tokio::spawn(self.run(events, shutdown_signal));
        (handle, task)
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RoomEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.config.tick_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Room {} open", self.id);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                _ = ticker.tick() => {
                    while let Ok(event) = events.try_recv() {
                        self.handle_event(event);
                    }
                    self.tick();
                }

                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.close_all("room closed");
        info!("Room {} closed", self.id);
    }

    pub fn handle_event(&mut self, event: RoomEvent) {
        match event {
            RoomEvent::Join {
                session,
                name,
                reply,
            } => {
                let result = self.join(session, name);
                if let Err(e) = &result {
                    info!("Room {}: join rejected: {}", self.id, e);
                }
                // Matchmaking reads the status, so it must be current before the reply
                self.publish_status();
                let _ = reply.send(result);
            }
            RoomEvent::Reconnect {
                session,
                claims,
                reply,
            } => {
                let result = self.reconnect(session, &claims);
                if let Err(e) = &result {
                    info!(
                        "Room {}: reconnect of {} rejected: {}",
                        self.id, claims.player_id, e
                    );
                }
                self.publish_status();
                let _ = reply.send(result);
            }
            RoomEvent::Leave { player_id } => self.leave(player_id),
            RoomEvent::Disconnected {
                player_id,
                session_id,
            } => self.disconnect(player_id, session_id),
            RoomEvent::Input { player_id, inputs } => self.queue_inputs(player_id, inputs),
            RoomEvent::Action { player_id, action } => self.room_action(player_id, action),
        }
        self.publish_status();
    }

    /// One fixed time step
    pub fn tick(&mut self) {
        let expired = self
            .seats
            .expired(self.config.reconnect_grace, Instant::now());
        if !expired.is_empty() {
            for player_id in expired {
                info!("Room {}: seat {} expired", self.id, player_id);
                self.remove_seat(player_id);
            }
            self.after_roster_change();
        }

        match self.phase {
            Phase::Waiting => {}
            Phase::Countdown => {
                self.phase_ticks += 1;
                if self.phase_ticks >= self.config.game.countdown_frames {
                    self.set_phase(Phase::Running);
                }
            }
            Phase::Running => self.step(),
            Phase::Ending => {
                self.phase_ticks += 1;
                if self.phase_ticks >= self.config.ending_grace_frames {
                    self.restart_round();
                }
            }
        }

        let snapshot = self.snapshot_packet(false);
        self.broadcast(&snapshot);
        self.publish_status();
    }

    fn step(&mut self) {
        let frame = self.game.frame();
        let policy = self.config.fallback;
        let sim = self.game.sim();

        let mut inputs = BTreeMap::new();
        for seat in self.seats.iter_mut() {
            let input = match &mut seat.kind {
                SeatKind::Human {
                    session: Some(_), ..
                } => seat.inputs.take(frame, policy),
                SeatKind::Human { session: None, .. } => {
                    seat.inputs.take(frame, FallbackPolicy::Idle)
                }
                SeatKind::Bot { brain } => brain.decide(&WorldView {
                    frame,
                    player_id: seat.player_id,
                    simulation: sim,
                }),
            };
            inputs.insert(seat.player_id, input);
        }

        let alive_before = self.game.sim().alive_players();
        self.game.advance(&inputs);

        let sim = self.game.sim();
        let config = *sim.config();
        let mut deaths = Vec::new();
        for player_id in alive_before {
            if let Some(player) = sim.player(player_id).filter(|p| p.dead) {
                let killer = sim.explosion_at(player.cell(&config)).map(|e| e.owner);
                deaths.push((player_id, killer));
            }
        }
        for (player_id, killer) in deaths {
            info!(
                "Room {}: player {} died at frame {} (blast by {:?})",
                self.id, player_id, frame, killer
            );
            self.broadcast(&Packet::Event(GameEvent::PlayerDied {
                player_id,
                killer,
                frame,
            }));
        }

        self.check_round_over();
    }

    fn join(&mut self, session: Arc<dyn Session>, name: String) -> Result<u32, RoomError> {
        if lock(&self.status).closing {
            return Err(RoomError::Closed);
        }
        if self.phase == Phase::Ending {
            return Err(RoomError::Ending);
        }
        if self.seats.is_full() {
            // Humans take precedence over fill bots
            match self.seats.bot_ids().last().copied() {
                Some(bot) => {
                    self.remove_seat(bot);
                    self.broadcast(&Packet::Event(GameEvent::PlayerLeft { player_id: bot }));
                }
                None => return Err(RoomError::Full),
            }
        }

        let player_id = self
            .seats
            .add_human(name.clone(), session.clone())
            .ok_or(RoomError::Full)?;
        self.game.add_player(player_id);

        let token = self.tokens.issue(player_id, &self.id, self.epoch);
        self.deliver(
            player_id,
            &session,
            &Packet::Joined {
                player_id,
                room_id: self.id.clone(),
                token,
                seed: self.game.seed(),
                tick_rate: self.config.game.tick_rate,
                frame: self.game.frame(),
            },
        );

        if self.phase == Phase::Waiting {
            self.start_round();
        }

        let snapshot = self.snapshot_packet(true);
        self.deliver(player_id, &session, &snapshot);
        self.broadcast_except(
            player_id,
            &Packet::Event(GameEvent::PlayerJoined { player_id, name }),
        );

        info!("Room {}: player {} joined", self.id, player_id);
        Ok(player_id)
    }

    fn reconnect(
        &mut self,
        session: Arc<dyn Session>,
        claims: &TokenClaims,
    ) -> Result<u32, RoomError> {
        if lock(&self.status).closing {
            return Err(RoomError::Closed);
        }
        let player_id = claims.player_id;
        if claims.room_id != self.id || claims.room_epoch != self.epoch {
            // Issued by another room, or by an earlier room under this id whose
            // player ids have since been handed out again
            return Err(match self.seats.get(player_id) {
                Some(seat) if seat.is_connected() => RoomError::AlreadySeated(player_id),
                _ => RoomError::WrongRoom(self.id.clone()),
            });
        }
        let previous = self.seats.attach(player_id, session.clone())?;
        if let Some(previous) = previous {
            if previous.id() != session.id() {
                previous.close();
            }
        }

        let token = self.tokens.issue(player_id, &self.id, self.epoch);
        self.deliver(
            player_id,
            &session,
            &Packet::Reconnected {
                player_id,
                room_id: self.id.clone(),
                token,
                seed: self.game.seed(),
                tick_rate: self.config.game.tick_rate,
                frame: self.game.frame(),
            },
        );
        let snapshot = self.snapshot_packet(true);
        self.deliver(player_id, &session, &snapshot);

        info!(
            "Room {}: player {} resumed at frame {}",
            self.id,
            player_id,
            self.game.frame()
        );
        Ok(player_id)
    }

    fn leave(&mut self, player_id: u32) {
        if self.remove_seat(player_id) {
            info!("Room {}: player {} left", self.id, player_id);
            self.broadcast(&Packet::Event(GameEvent::PlayerLeft { player_id }));
            self.after_roster_change();
        } else {
            debug!("Room {}: leave from unknown player {}", self.id, player_id);
        }
    }

    fn disconnect(&mut self, player_id: u32, session_id: u64) {
        if self.seats.detach(player_id, session_id, Instant::now()) {
            info!(
                "Room {}: player {} disconnected, holding seat for {:?}",
                self.id, player_id, self.config.reconnect_grace
            );
            self.broadcast_except(
                player_id,
                &Packet::Event(GameEvent::PlayerLeft { player_id }),
            );
        }
    }

    fn queue_inputs(&mut self, player_id: u32, inputs: Vec<FrameInput>) {
        let current = self.game.frame();
        let Some(seat) = self.seats.get_mut(player_id) else {
            debug!("Room {}: input for unknown player {}", self.id, player_id);
            return;
        };
        for record in inputs {
            if seat.inputs.push(record, current) == InputOutcome::TooFarAhead {
                debug!(
                    "Room {}: player {} input for frame {} is too far ahead of {}",
                    self.id, player_id, record.frame, current
                );
            }
        }
    }

    fn room_action(&mut self, player_id: u32, action: RoomAction) {
        if self.seats.get(player_id).map_or(true, |seat| seat.is_bot()) {
            debug!("Room {}: action from non-member {}", self.id, player_id);
            return;
        }
        match action {
            RoomAction::AddBot => {
                if self.add_bot().is_none() {
                    debug!("Room {}: no seat for another bot", self.id);
                }
            }
            RoomAction::RemoveBot => {
                if let Some(bot) = self.seats.bot_ids().last().copied() {
                    self.leave(bot);
                }
            }
        }
    }

    fn add_bot(&mut self) -> Option<u32> {
        if self.phase == Phase::Ending {
            return None;
        }
        self.bots_created += 1;
        let name = format!("bot-{}", self.bots_created);
        let brain = Box::new(WanderBot::new(self.seeds.gen()));
        let player_id = self.seats.add_bot(name.clone(), brain)?;
        self.game.add_player(player_id);
        info!("Room {}: added {} as player {}", self.id, name, player_id);
        self.broadcast(&Packet::Event(GameEvent::PlayerJoined { player_id, name }));
        Some(player_id)
    }

    fn remove_seat(&mut self, player_id: u32) -> bool {
        match self.seats.remove(player_id) {
            Some(_) => {
                self.game.remove_player(player_id);
                true
            }
            None => false,
        }
    }

    /// Bots never keep a room alive on their own, and an emptied round ends.
    fn after_roster_change(&mut self) {
        if self.seats.humans() == 0 {
            for bot in self.seats.bot_ids() {
                self.remove_seat(bot);
            }
        }
        match self.phase {
            Phase::Running => self.check_round_over(),
            Phase::Countdown if self.seats.is_empty() => {
                self.set_phase(Phase::Waiting);
            }
            _ => {}
        }
    }

    fn start_round(&mut self) {
        if self.config.ai_fill {
            let target = self.config.ai_fill_target.min(self.seats.capacity());
            while self.seats.len() < target {
                if self.add_bot().is_none() {
                    break;
                }
            }
        }
        if self.config.game.countdown_frames > 0 {
            self.set_phase(Phase::Countdown);
        } else {
            self.set_phase(Phase::Running);
        }
    }

    fn check_round_over(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        if let Some(outcome) = self.game.sim().outcome() {
            let frame = self.game.frame();
            info!(
                "Room {}: round over at frame {}, winner {:?}",
                self.id, frame, outcome.winner
            );
            self.broadcast(&Packet::Event(GameEvent::RoundOver {
                winner: outcome.winner,
                frame,
            }));
            self.set_phase(Phase::Ending);
        }
    }

    fn restart_round(&mut self) {
        let seed = self.seeds.gen();
        let players = self.seats.ids();
        for seat in self.seats.iter_mut() {
            seat.inputs.reset();
        }
        self.game.reset(seed, &players);
        self.set_phase(Phase::Waiting);

        let snapshot = self.snapshot_packet(true);
        self.broadcast(&snapshot);

        if !self.seats.is_empty() {
            self.start_round();
        }
    }

    /// Applies a phase change if it is a legal transition. Illegal or repeated
    /// transitions are ignored.
    fn set_phase(&mut self, next: Phase) -> bool {
        let legal = matches!(
            (self.phase, next),
            (Phase::Waiting, Phase::Countdown)
                | (Phase::Waiting, Phase::Running)
                | (Phase::Countdown, Phase::Running)
                | (Phase::Countdown, Phase::Waiting)
                | (Phase::Running, Phase::Ending)
                | (Phase::Ending, Phase::Waiting)
        );
        if !legal {
            warn!(
                "Room {}: ignoring phase change {} -> {}",
                self.id, self.phase, next
            );
            return false;
        }

        info!("Room {}: {} -> {}", self.id, self.phase, next);
        self.phase = next;
        self.phase_ticks = 0;
        let frame = self.game.frame();
        self.broadcast(&Packet::Event(GameEvent::PhaseChanged { phase: next, frame }));
        self.publish_status();
        true
    }

    fn snapshot_packet(&self, full: bool) -> Packet {
        Packet::Snapshot(self.game.snapshot(
            self.phase,
            self.seats.last_processed_inputs(),
            full,
            shared::now_ms(),
        ))
    }

    fn deliver(&self, player_id: u32, session: &Arc<dyn Session>, packet: &Packet) {
        if let Err(e) = session.send_packet(packet) {
            match e {
                SessionError::QueueFull | SessionError::Closed => {
                    debug!("Room {}: dropped {} for player {}: {}", self.id, packet.kind(), player_id, e)
                }
                SessionError::Backpressure(_) => {
                    warn!("Room {}: player {} is not keeping up: {}", self.id, player_id, e)
                }
                SessionError::Protocol(_) => {
                    error!("Room {}: cannot send {} to player {}: {}", self.id, packet.kind(), player_id, e)
                }
            }
        }
    }

    fn broadcast(&self, packet: &Packet) {
        for (player_id, session) in self.seats.sessions() {
            self.deliver(player_id, &session, packet);
        }
    }

    fn broadcast_except(&self, excluded: u32, packet: &Packet) {
        for (player_id, session) in self.seats.sessions() {
            if player_id != excluded {
                self.deliver(player_id, &session, packet);
            }
        }
    }

    fn close_all(&mut self, reason: &str) {
        let packet = Packet::Disconnected {
            reason: reason.to_string(),
        };
        for (player_id, session) in self.seats.sessions() {
            self.deliver(player_id, &session, &packet);
            session.close();
        }
        lock(&self.status).closing = true;
    }

    fn publish_status(&self) {
        let mut status = lock(&self.status);
        status.seated = self.seats.len();
        status.humans = self.seats.humans();
        status.phase = self.phase;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use shared::framing::split_frame;
    use shared::{Direction, GameConfig, Input, Map, Simulation};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    static NEXT_ID: AtomicU64 = AtomicU64::new(1_000);

    /// Keeps every packet it is sent
    pub struct RecordingSession {
        id: u64,
        packets: Mutex<Vec<Packet>>,
        closed: AtomicBool,
        broken: bool,
    }

    impl RecordingSession {
        pub fn new() -> Arc<Self> {
            Self::build(false)
        }

        /// Fails every send
        pub fn broken() -> Arc<Self> {
            Self::build(true)
        }

        fn build(broken: bool) -> Arc<Self> {
            Arc::new(Self {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                packets: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                broken,
            })
        }

        pub fn packets(&self) -> Vec<Packet> {
            self.packets.lock().unwrap().clone()
        }

        pub fn events(&self) -> Vec<GameEvent> {
            self.packets()
                .into_iter()
                .filter_map(|p| match p {
                    Packet::Event(event) => Some(event),
                    _ => None,
                })
                .collect()
        }

        pub fn last_snapshot(&self) -> Option<shared::Snapshot> {
            self.packets().into_iter().rev().find_map(|p| match p {
                Packet::Snapshot(s) => Some(s),
                _ => None,
            })
        }

        pub fn clear(&self) {
            self.packets.lock().unwrap().clear();
        }
    }

    impl Session for RecordingSession {
        fn id(&self) -> u64 {
            self.id
        }

        fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
            if self.broken {
                return Err(SessionError::Closed);
            }
            let packet = Packet::decode(split_frame(&frame)?)?;
            self.packets.lock().unwrap().push(packet);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn tokens() -> SessionTokenService {
        SessionTokenService::new([1u8; 32], Duration::from_secs(600))
    }

    fn room_with(config: ServerConfig) -> Room {
        Room::new("test", Arc::new(config), tokens())
    }

    fn join(room: &mut Room, session: &Arc<RecordingSession>) -> Result<u32, RoomError> {
        let (reply, mut response) = oneshot::channel();
        room.handle_event(RoomEvent::Join {
            session: session.clone(),
            name: "player".into(),
            reply,
        });
        response.try_recv().unwrap()
    }

    fn claims_for(room: &Room, player_id: u32) -> TokenClaims {
        TokenClaims {
            player_id,
            room_id: room.id().to_string(),
            room_epoch: room.epoch(),
            issued_at_ms: 0,
            expires_at_ms: u64::MAX,
        }
    }

    fn reconnect_with(
        room: &mut Room,
        session: &Arc<RecordingSession>,
        claims: TokenClaims,
    ) -> Result<u32, RoomError> {
        let (reply, mut response) = oneshot::channel();
        room.handle_event(RoomEvent::Reconnect {
            session: session.clone(),
            claims,
            reply,
        });
        response.try_recv().unwrap()
    }

    fn reconnect(
        room: &mut Room,
        session: &Arc<RecordingSession>,
        player_id: u32,
    ) -> Result<u32, RoomError> {
        let claims = claims_for(room, player_id);
        reconnect_with(room, session, claims)
    }

    fn joined_token(session: &RecordingSession) -> String {
        session
            .packets()
            .into_iter()
            .find_map(|p| match p {
                Packet::Joined { token, .. } => Some(token),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_first_join_starts_round() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();

        assert_eq!(room.phase(), Phase::Running);
        let packets = session.packets();
        match &packets[0] {
            Packet::Joined {
                player_id: id,
                room_id,
                token,
                seed,
                ..
            } => {
                assert_eq!(*id, player_id);
                assert_eq!(room_id, "test");
                assert_eq!(*seed, room.game().seed());
                let claims = tokens().verify(token).unwrap();
                assert_eq!(claims.player_id, player_id);
                assert_eq!(claims.room_id, "test");
            }
            other => panic!("expected Joined first, got {:?}", other),
        }
        assert!(session.events().contains(&GameEvent::PhaseChanged {
            phase: Phase::Running,
            frame: 0
        }));
        let snapshot = session.last_snapshot().unwrap();
        assert!(snapshot.full);
        assert!(snapshot.player(player_id).is_some());
    }

    #[test]
    fn test_join_rejected_when_full() {
        let config = ServerConfig {
            room_capacity: 1,
            ..ServerConfig::default()
        };
        let mut room = room_with(config);
        join(&mut room, &RecordingSession::new()).unwrap();
        assert_eq!(
            join(&mut room, &RecordingSession::new()),
            Err(RoomError::Full)
        );
    }

    #[test]
    fn test_join_rejected_while_ending() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();
        room.handle_event(RoomEvent::Leave { player_id });
        assert_eq!(room.phase(), Phase::Ending);
        assert_eq!(
            join(&mut room, &RecordingSession::new()),
            Err(RoomError::Ending)
        );
    }

    #[test]
    fn test_tick_applies_queued_input() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();
        let start = room.game().sim().player(player_id).unwrap().clone();

        // Spawn corner (1, 1) always has an open cell to the right
        room.handle_event(RoomEvent::Input {
            player_id,
            inputs: vec![FrameInput {
                sequence: 1,
                frame: 0,
                input: Input::moving(Direction::Right),
            }],
        });
        room.tick();

        let moved = room.game().sim().player(player_id).unwrap();
        assert!(moved.x > start.x);
        let snapshot = session.last_snapshot().unwrap();
        assert_eq!(snapshot.frame, 1);
        assert!(!snapshot.full);
        assert_eq!(snapshot.last_processed_input.get(&player_id), Some(&1));
    }

    #[test]
    fn test_ack_is_monotonic_across_snapshots() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();

        let batches = [(5, 0), (3, 1), (7, 2), (6, 1), (8, 3)];
        let mut last = 0;
        for (sequence, frame) in batches {
            room.handle_event(RoomEvent::Input {
                player_id,
                inputs: vec![FrameInput {
                    sequence,
                    frame,
                    input: Input::idle(),
                }],
            });
            room.tick();
            let ack = *session
                .last_snapshot()
                .unwrap()
                .last_processed_input
                .get(&player_id)
                .unwrap();
            assert!(ack >= last);
            last = ack;
        }
        assert_eq!(last, 8);
    }

    #[test]
    fn test_leave_of_last_player_ends_round_then_waits() {
        let config = ServerConfig {
            ending_grace_frames: 3,
            ..ServerConfig::default()
        };
        let mut room = room_with(config);
        let a = RecordingSession::new();
        let b = RecordingSession::new();
        let first = join(&mut room, &a).unwrap();
        let second = join(&mut room, &b).unwrap();

        room.handle_event(RoomEvent::Leave { player_id: second });
        assert!(a.events().contains(&GameEvent::PlayerLeft { player_id: second }));
        assert!(room.game().sim().player(second).is_none());
        assert_eq!(room.phase(), Phase::Running);

        room.handle_event(RoomEvent::Leave { player_id: first });
        assert_eq!(room.phase(), Phase::Ending);

        for _ in 0..3 {
            room.tick();
        }
        assert_eq!(room.phase(), Phase::Waiting);
        assert!(room.seats().is_empty());
    }

    #[test]
    fn test_restart_after_ending_grace() {
        let config = ServerConfig {
            ending_grace_frames: 2,
            ..ServerConfig::default()
        };
        let map = Map::from_rows(&["#####", "#   #", "#   #", "#   #", "#####"]);
        let game = Game::from_simulation(Simulation::with_map(GameConfig::default(), map), 5);
        let mut room = Room::with_game("scripted", Arc::new(config), tokens(), game);
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();

        // Stand on the bomb until it goes off
        room.handle_event(RoomEvent::Input {
            player_id,
            inputs: vec![FrameInput {
                sequence: 1,
                frame: 0,
                input: Input::idle().with_bomb(),
            }],
        });
        let fuse = room.game().sim().config().fuse_frames;
        for _ in 0..=fuse {
            room.tick();
        }
        assert_eq!(room.phase(), Phase::Ending);
        assert!(session.events().contains(&GameEvent::RoundOver {
            winner: None,
            frame: fuse + 1
        }));

        session.clear();
        room.tick();
        room.tick();
        assert_eq!(room.phase(), Phase::Running);
        assert_ne!(room.game().seed(), 5);
        let restarted = room.game().sim().player(player_id).unwrap();
        assert!(restarted.is_alive());
        assert!(session.packets().iter().any(|p| matches!(
            p,
            Packet::Snapshot(s) if s.full && s.phase == Phase::Waiting
        )));
    }

    #[test]
    fn test_player_death_event_names_killer() {
        let map = Map::from_rows(&[
            "#######",
            "#     #",
            "#     #",
            "#     #",
            "#######",
        ]);
        let game = Game::from_simulation(Simulation::with_map(GameConfig::default(), map), 9);
        let mut room = Room::with_game("scripted", Arc::new(ServerConfig::default()), tokens(), game);
        let a = RecordingSession::new();
        let b = RecordingSession::new();
        // Corner rotation puts the first player at (1, 1) and the second at (5, 3)
        let bomber = join(&mut room, &a).unwrap();
        let victim = join(&mut room, &b).unwrap();

        room.handle_event(RoomEvent::Input {
            player_id: bomber,
            inputs: vec![FrameInput {
                sequence: 1,
                frame: 0,
                input: Input::idle().with_bomb(),
            }],
        });
        room.tick();

        // March the victim left along the bottom row into reach of the blast at (1, 3)
        for frame in 1..=128u32 {
            room.handle_event(RoomEvent::Input {
                player_id: victim,
                inputs: vec![FrameInput {
                    sequence: frame,
                    frame,
                    input: Input::moving(Direction::Left),
                }],
            });
            room.tick();
        }
        let config = *room.game().sim().config();
        assert_eq!(
            room.game().sim().player(victim).unwrap().cell(&config),
            (1, 3)
        );

        let fuse = config.fuse_frames;
        while room.game().frame() <= fuse {
            room.tick();
        }
        assert!(a.events().contains(&GameEvent::PlayerDied {
            player_id: victim,
            killer: Some(bomber),
            frame: fuse
        }));
    }

    #[test]
    fn test_disconnect_holds_seat_and_reconnect_resumes() {
        let mut room = room_with(ServerConfig::default());
        let old = RecordingSession::new();
        let other = RecordingSession::new();
        let player_id = join(&mut room, &old).unwrap();
        join(&mut room, &other).unwrap();
        for _ in 0..10 {
            room.tick();
        }
        let frame_at_disconnect = room.game().frame();

        room.handle_event(RoomEvent::Disconnected {
            player_id,
            session_id: old.id(),
        });
        assert!(other.events().contains(&GameEvent::PlayerLeft { player_id }));
        assert!(room.game().sim().player(player_id).is_some());
        room.tick();

        let fresh = RecordingSession::new();
        assert_eq!(reconnect(&mut room, &fresh, player_id), Ok(player_id));
        let packets = fresh.packets();
        assert!(matches!(packets[0], Packet::Reconnected { player_id: id, .. } if id == player_id));
        let snapshot = fresh.last_snapshot().unwrap();
        assert!(snapshot.full);
        assert!(snapshot.frame >= frame_at_disconnect);
        assert_eq!(
            snapshot.players.iter().filter(|p| p.id == player_id).count(),
            1
        );

        // The stale session's late disconnect does not unseat the new one
        room.handle_event(RoomEvent::Disconnected {
            player_id,
            session_id: old.id(),
        });
        assert!(room.seats().get(player_id).unwrap().is_connected());
    }

    #[test]
    fn test_reconnect_closes_replaced_session() {
        let mut room = room_with(ServerConfig::default());
        let old = RecordingSession::new();
        let player_id = join(&mut room, &old).unwrap();
        let fresh = RecordingSession::new();
        reconnect(&mut room, &fresh, player_id).unwrap();
        assert!(old.is_closed());
    }

    #[test]
    fn test_token_from_earlier_room_with_same_id_rejected() {
        let mut first = room_with(ServerConfig::default());
        let original = RecordingSession::new();
        join(&mut first, &original).unwrap();
        let claims = tokens().verify(&joined_token(&original)).unwrap();
        drop(first);

        let mut second = room_with(ServerConfig::default());
        assert_ne!(second.epoch(), claims.room_epoch);
        let occupant = RecordingSession::new();
        let occupant_id = join(&mut second, &occupant).unwrap();
        assert_eq!(occupant_id, claims.player_id);

        let intruder = RecordingSession::new();
        assert_eq!(
            reconnect_with(&mut second, &intruder, claims.clone()),
            Err(RoomError::AlreadySeated(occupant_id))
        );
        assert!(!occupant.is_closed());
        assert!(second.seats().get(occupant_id).unwrap().is_connected());
        assert!(intruder.packets().is_empty());

        // Still refused once the seat it names is only being held
        second.handle_event(RoomEvent::Disconnected {
            player_id: occupant_id,
            session_id: occupant.id(),
        });
        assert_eq!(
            reconnect_with(&mut second, &intruder, claims),
            Err(RoomError::WrongRoom("test".into()))
        );
        assert_eq!(reconnect(&mut second, &occupant, occupant_id), Ok(occupant_id));
    }

    #[test]
    fn test_token_from_other_room_rejected() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();
        let claims = TokenClaims {
            room_id: "elsewhere".into(),
            ..claims_for(&room, player_id)
        };
        assert_eq!(
            reconnect_with(&mut room, &RecordingSession::new(), claims),
            Err(RoomError::AlreadySeated(player_id))
        );
        assert!(!session.is_closed());
    }

    #[test]
    fn test_reissued_token_resumes_seat() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();
        let claims = tokens().verify(&joined_token(&session)).unwrap();
        assert_eq!(claims.room_epoch, room.epoch());

        let fresh = RecordingSession::new();
        assert_eq!(reconnect_with(&mut room, &fresh, claims), Ok(player_id));
        assert!(session.is_closed());
    }

    #[test]
    fn test_reconnect_unknown_player_rejected() {
        let mut room = room_with(ServerConfig::default());
        assert_eq!(
            reconnect(&mut room, &RecordingSession::new(), 42),
            Err(RoomError::UnknownPlayer(42))
        );
    }

    #[test]
    fn test_seat_released_after_grace() {
        let config = ServerConfig {
            reconnect_grace: Duration::ZERO,
            ..ServerConfig::default()
        };
        let mut room = room_with(config);
        let a = RecordingSession::new();
        let b = RecordingSession::new();
        let gone = join(&mut room, &a).unwrap();
        join(&mut room, &b).unwrap();

        room.handle_event(RoomEvent::Disconnected {
            player_id: gone,
            session_id: a.id(),
        });
        room.tick();
        assert!(room.seats().get(gone).is_none());
        assert!(room.game().sim().player(gone).is_none());
    }

    #[test]
    fn test_failing_recipient_does_not_block_others() {
        let mut room = room_with(ServerConfig::default());
        let broken = RecordingSession::broken();
        let healthy = RecordingSession::new();
        join(&mut room, &broken).unwrap();
        join(&mut room, &healthy).unwrap();
        healthy.clear();

        room.tick();
        room.tick();
        let snapshots = healthy
            .packets()
            .into_iter()
            .filter(|p| matches!(p, Packet::Snapshot(_)))
            .count();
        assert_eq!(snapshots, 2);
    }

    #[test]
    fn test_ai_fill_adds_bots() {
        let config = ServerConfig {
            ai_fill: true,
            ai_fill_target: 3,
            ..ServerConfig::default()
        };
        let mut room = room_with(config);
        let session = RecordingSession::new();
        join(&mut room, &session).unwrap();
        assert_eq!(room.seats().len(), 3);
        assert_eq!(room.seats().bot_ids().len(), 2);
        assert_eq!(room.game().sim().players().count(), 3);

        for _ in 0..30 {
            room.tick();
        }
        assert_eq!(room.game().frame(), 30);
    }

    #[test]
    fn test_human_replaces_bot_when_full() {
        let config = ServerConfig {
            ai_fill: true,
            ai_fill_target: 2,
            room_capacity: 2,
            ..ServerConfig::default()
        };
        let mut room = room_with(config);
        join(&mut room, &RecordingSession::new()).unwrap();
        assert!(room.seats().is_full());
        join(&mut room, &RecordingSession::new()).unwrap();
        assert!(room.seats().bot_ids().is_empty());
        assert_eq!(room.seats().humans(), 2);
    }

    #[test]
    fn test_room_actions_manage_bots() {
        let mut room = room_with(ServerConfig::default());
        let session = RecordingSession::new();
        let player_id = join(&mut room, &session).unwrap();

        room.handle_event(RoomEvent::Action {
            player_id,
            action: RoomAction::AddBot,
        });
        assert_eq!(room.seats().bot_ids().len(), 1);
        room.handle_event(RoomEvent::Action {
            player_id,
            action: RoomAction::RemoveBot,
        });
        assert!(room.seats().bot_ids().is_empty());
    }

    #[test]
    fn test_last_human_leaving_removes_bots() {
        let config = ServerConfig {
            ai_fill: true,
            ai_fill_target: 3,
            ..ServerConfig::default()
        };
        let mut room = room_with(config);
        let player_id = join(&mut room, &RecordingSession::new()).unwrap();
        room.handle_event(RoomEvent::Leave { player_id });
        assert!(room.seats().is_empty());
    }

    #[test]
    fn test_countdown_precedes_running() {
        let mut config = ServerConfig::default();
        config.game.countdown_frames = 3;
        let mut room = room_with(config);
        join(&mut room, &RecordingSession::new()).unwrap();
        assert_eq!(room.phase(), Phase::Countdown);
        room.tick();
        room.tick();
        assert_eq!(room.phase(), Phase::Countdown);
        assert_eq!(room.game().frame(), 0);
        room.tick();
        assert_eq!(room.phase(), Phase::Running);
    }

    #[test]
    fn test_illegal_phase_change_ignored() {
        let mut room = room_with(ServerConfig::default());
        assert!(!room.set_phase(Phase::Ending));
        assert_eq!(room.phase(), Phase::Waiting);
        assert!(room.set_phase(Phase::Running));
        assert!(!room.set_phase(Phase::Running));
    }

    #[tokio::test]
    async fn test_spawned_room_serves_joins_and_shuts_down() {
        let room = room_with(ServerConfig::default());
        let (handle, task) = room.spawn();
        let session = RecordingSession::new();
        let player_id = handle.join(session.clone(), "p".into()).await.unwrap();
        assert_eq!(player_id, 1);
        assert_eq!(handle.status().seated, 1);
        assert_eq!(handle.status().phase, Phase::Running);

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(session.is_closed());
        assert!(matches!(
            session.packets().last(),
            Some(Packet::Disconnected { .. })
        ));
        assert_eq!(
            handle.join(RecordingSession::new(), "late".into()).await,
            Err(RoomError::Closed)
        );
    }
}
