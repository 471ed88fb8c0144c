use crate::config::ClientConfig;
use crate::input::InputManager;
use crate::latency::LatencyTracker;
use crate::prediction::ClientPredictor;
use crate::reconciliation::{Correction, ReconciliationEngine};
use crate::smoothing::{RemoteSmoother, Sample};
use log::{debug, info};
use shared::{
    Direction, FrameInput, GameConfig, GameEvent, Input, Packet, Phase, Player, Snapshot,
    TileType,
};
use std::collections::BTreeMap;

/// Anything the render collaborator can draw as a player
pub trait Drawable {
    fn id(&self) -> u32;
    fn position(&self) -> (f32, f32);
    fn direction(&self) -> Direction;
    fn is_moving(&self) -> bool;
    fn is_dead(&self) -> bool;
    fn is_local(&self) -> bool;
}

/// The player this client controls: predicted, reconciled, drawn with the
/// correction offset applied.
#[derive(Debug, Clone)]
pub struct LocalPlayer {
    pub state: Player,
    pub visual: (f32, f32),
}

/// Someone else: drawn from the smoother, falling back to the newest snapshot.
#[derive(Debug, Clone)]
pub struct RemotePlayer {
    pub state: Player,
    pub position: (f32, f32),
    pub moving: bool,
    pub direction: Direction,
}

impl Drawable for LocalPlayer {
    fn id(&self) -> u32 {
        self.state.id
    }
    fn position(&self) -> (f32, f32) {
        self.visual
    }
    fn direction(&self) -> Direction {
        self.state.direction
    }
    fn is_moving(&self) -> bool {
        self.state.moving
    }
    fn is_dead(&self) -> bool {
        self.state.dead
    }
    fn is_local(&self) -> bool {
        true
    }
}

impl Drawable for RemotePlayer {
    fn id(&self) -> u32 {
        self.state.id
    }
    fn position(&self) -> (f32, f32) {
        self.position
    }
    fn direction(&self) -> Direction {
        self.direction
    }
    fn is_moving(&self) -> bool {
        self.moving && !self.state.dead
    }
    fn is_dead(&self) -> bool {
        self.state.dead
    }
    fn is_local(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerView {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub direction: Direction,
    pub moving: bool,
    pub dead: bool,
    pub local: bool,
    /// Grid cell under the drawn position
    pub cell: (i32, i32),
}

impl PlayerView {
    fn of(entity: &dyn Drawable, config: &GameConfig) -> Self {
        let (x, y) = entity.position();
        Self {
            id: entity.id(),
            x,
            y,
            cell: config.cell_at(x, y),
            direction: entity.direction(),
            moving: entity.is_moving(),
            dead: entity.is_dead(),
            local: entity.is_local(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BombView {
    pub x: i32,
    pub y: i32,
    /// 1.0 when placed, 0.0 when it goes off
    pub fuse_ratio: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplosionView {
    pub cells: Vec<(i32, i32)>,
    /// 0.0 when created, 1.0 when it expires
    pub age_ratio: f32,
}

/// Read-only picture of the world for one rendered frame
#[derive(Debug, Clone, PartialEq)]
pub struct RenderView {
    pub frame: u32,
    pub phase: Phase,
    pub width: i32,
    pub height: i32,
    pub tile_size: f32,
    pub tiles: Vec<TileType>,
    pub players: Vec<PlayerView>,
    pub bombs: Vec<BombView>,
    pub explosions: Vec<ExplosionView>,
}

impl RenderView {
    pub fn tile(&self, x: i32, y: i32) -> TileType {
        if x < 0 || y < 0 || x >= self.width || y >= self.height {
            return TileType::Wall;
        }
        self.tiles[(y * self.width + x) as usize]
    }
}

/// Everything the client knows about its room, and the pipeline that keeps it
/// current: input ring, predictor, reconciliation, remote smoothing and latency.
pub struct ClientGameState {
    config: ClientConfig,
    game: GameConfig,
    player_id: Option<u32>,
    room_id: Option<String>,
    phase: Phase,
    winner: Option<Option<u32>>,

    predictor: Option<ClientPredictor>,
    reconciler: ReconciliationEngine,
    smoother: RemoteSmoother,
    inputs: InputManager,
    latency: LatencyTracker,
    remotes: BTreeMap<u32, RemotePlayer>,

    /// Frame and server time of the newest snapshot, used to estimate the server's
    /// current frame between snapshots
    anchor_frame: u32,
    anchor_server_ms: u64,

    pub prediction_enabled: bool,
    pub reconciliation_enabled: bool,
    pub interpolation_enabled: bool,
}

impl ClientGameState {
    pub fn new(config: ClientConfig, game: GameConfig) -> Self {
        Self {
            reconciler: ReconciliationEngine::new(&config),
            smoother: RemoteSmoother::new(config.smoother_capacity, config.dead_reckoning_ms),
            inputs: InputManager::new(config.input_ring, config.input_batch),
            latency: LatencyTracker::new(&config),
            config,
            game,
            player_id: None,
            room_id: None,
            phase: Phase::Waiting,
            winner: None,
            predictor: None,
            remotes: BTreeMap::new(),
            anchor_frame: 0,
            anchor_server_ms: 0,
            prediction_enabled: true,
            reconciliation_enabled: true,
            interpolation_enabled: true,
        }
    }

    pub fn player_id(&self) -> Option<u32> {
        self.player_id
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// `Some(winner)` once the current round has been decided
    pub fn round_result(&self) -> Option<Option<u32>> {
        self.winner
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn latency_mut(&mut self) -> &mut LatencyTracker {
        &mut self.latency
    }

    pub fn inputs(&self) -> &InputManager {
        &self.inputs
    }

    pub fn predictor(&self) -> Option<&ClientPredictor> {
        self.predictor.as_ref()
    }

    pub fn last_correction(&self) -> Correction {
        self.reconciler.last_correction()
    }

    pub fn local_player(&self) -> Option<&Player> {
        self.predictor.as_ref()?.local_player()
    }

    pub fn remote_players(&self) -> impl Iterator<Item = &RemotePlayer> {
        self.remotes.values()
    }

    /// Starts following a seat. A reconnect into the same seat keeps the pending
    /// inputs; anything else starts fresh.
    pub fn on_joined(&mut self, player_id: u32, room_id: &str, seed: u64, frame: u32, now_ms: u64) {
        let same_seat =
            self.player_id == Some(player_id) && self.room_id.as_deref() == Some(room_id);
        if !same_seat {
            self.inputs.clear();
            self.smoother.clear();
            self.remotes.clear();
            self.reconciler.reset();
            self.predictor = Some(ClientPredictor::new(player_id, self.game, seed));
        }
        self.player_id = Some(player_id);
        self.room_id = Some(room_id.to_string());
        self.anchor_frame = frame;
        self.anchor_server_ms = self.latency.server_now_ms(now_ms);
        info!("Playing as {} in room {} (frame {})", player_id, room_id, frame);
    }

    pub fn apply_snapshot(&mut self, snapshot: &Snapshot, now_ms: u64) {
        let Some(player_id) = self.player_id else {
            return;
        };
        let Some(predictor) = self.predictor.as_mut() else {
            return;
        };

        self.latency.observe_server_time(snapshot.server_time_ms, now_ms);
        if snapshot.full && snapshot.seed != predictor.seed() {
            // A new round: old inputs targeted the old world
            self.inputs.clear();
            self.reconciler.reset();
            self.smoother.clear();
            self.winner = None;
            predictor.remove_local();
        }
        if snapshot.phase != Phase::Ending && self.phase == Phase::Ending {
            self.winner = None;
        }
        predictor.apply_world(snapshot);
        self.phase = snapshot.phase;
        self.anchor_frame = snapshot.frame;
        self.anchor_server_ms = snapshot.server_time_ms;

        if let Some(&ack) = snapshot.last_processed_input.get(&player_id) {
            self.inputs.acknowledge(ack);
        }

        match snapshot.player(player_id) {
            Some(authoritative) if self.reconciliation_enabled => {
                let correction =
                    self.reconciler
                        .reconcile(predictor, authoritative, self.inputs.pending());
                if let Correction::Hard { error } = correction {
                    debug!("Frame {}: snapped {:.1}px", snapshot.frame, error);
                }
            }
            Some(authoritative) => predictor.set_local(authoritative.clone()),
            None => predictor.remove_local(),
        }

        for player in snapshot.players.iter().filter(|p| p.id != player_id) {
            self.smoother.push(
                player.id,
                Sample {
                    time_ms: snapshot.server_time_ms,
                    x: player.x,
                    y: player.y,
                    direction: player.direction,
                    moving: player.moving,
                },
            );
            let remote = self.remotes.entry(player.id).or_insert_with(|| RemotePlayer {
                state: player.clone(),
                position: (player.x, player.y),
                moving: player.moving,
                direction: player.direction,
            });
            remote.state = player.clone();
        }
        self.remotes.retain(|id, _| snapshot.player(*id).is_some());
        self.smoother.retain(|id| snapshot.player(id).is_some());
    }

    pub fn handle_event(&mut self, event: &GameEvent) {
        match event {
            GameEvent::PlayerJoined { player_id, name } => {
                info!("{} joined as player {}", name, player_id)
            }
            GameEvent::PlayerLeft { player_id } => info!("Player {} left", player_id),
            GameEvent::PlayerDied {
                player_id,
                killer,
                frame,
            } => match killer {
                Some(killer) if killer == player_id => {
                    info!("Player {} caught in their own blast at frame {}", player_id, frame)
                }
                Some(killer) => info!(
                    "Player {} blown up by player {} at frame {}",
                    player_id, killer, frame
                ),
                None => info!("Player {} died at frame {}", player_id, frame),
            },
            GameEvent::PhaseChanged { phase, frame } => {
                info!("Round is {} from frame {}", phase, frame);
                self.phase = *phase;
                if *phase != Phase::Ending {
                    self.winner = None;
                }
            }
            GameEvent::RoundOver { winner, frame } => {
                match winner {
                    Some(id) if Some(*id) == self.player_id => {
                        info!("You won at frame {}!", frame)
                    }
                    Some(id) => info!("Player {} won at frame {}", id, frame),
                    None => info!("Round over at frame {}, nobody made it", frame),
                }
                self.winner = Some(*winner);
            }
        }
    }

    pub fn set_input(&mut self, input: Input) {
        self.inputs.set_current(input);
    }

    /// The server frame we believe is being simulated right now
    pub fn estimated_server_frame(&self, now_ms: u64) -> u32 {
        let elapsed = self
            .latency
            .server_now_ms(now_ms)
            .saturating_sub(self.anchor_server_ms) as f64;
        self.anchor_frame + (elapsed / self.game.frame_duration_ms()).floor() as u32
    }

    /// Runs one local frame: stamps the current input for a future server frame and
    /// predicts it. Returns the record to send, or `None` while there is nothing to
    /// drive.
    pub fn step(&mut self, now_ms: u64) -> Option<FrameInput> {
        self.reconciler.ease();
        if self.phase != Phase::Running {
            return None;
        }
        let lead = self.latency.lead_frames(self.game.frame_duration_ms());
        let target = self.estimated_server_frame(now_ms) + lead;
        let predictor = self.predictor.as_mut()?;
        predictor.local_player().filter(|p| p.is_alive())?;

        let record = self.inputs.record(target);
        if self.prediction_enabled {
            predictor.predict(&record.input);
        }
        Some(record)
    }

    /// Input packet carrying the newest records
    pub fn input_packet(&self) -> Option<Packet> {
        self.inputs.batch_packet()
    }

    /// Server time remote players are drawn at
    pub fn render_time_ms(&self, now_ms: u64) -> u64 {
        self.latency
            .server_now_ms(now_ms)
            .saturating_sub(self.latency.interpolation_delay_ms())
    }

    pub fn view(&mut self, now_ms: u64) -> Option<RenderView> {
        let render_ms = self.render_time_ms(now_ms);
        let frame = self.estimated_server_frame(now_ms);

        for remote in self.remotes.values_mut() {
            let smoothed = if self.interpolation_enabled {
                self.smoother.sample(remote.state.id, render_ms)
            } else {
                None
            };
            match smoothed {
                Some(s) => {
                    remote.position = (s.x, s.y);
                    remote.moving = s.moving;
                    remote.direction = s.direction;
                }
                None => {
                    remote.position = (remote.state.x, remote.state.y);
                    remote.moving = remote.state.moving;
                    remote.direction = remote.state.direction;
                }
            }
        }
        self.smoother.prune(render_ms);

        let predictor = self.predictor.as_ref()?;
        let world = predictor.world();
        let map = world.map();

        let mut players: Vec<PlayerView> = self
            .remotes
            .values()
            .map(|r| PlayerView::of(r, &self.game))
            .collect();
        if let Some(state) = predictor.local_player() {
            let local = LocalPlayer {
                state: state.clone(),
                visual: self.reconciler.visual_position(state),
            };
            players.push(PlayerView::of(&local, &self.game));
        }

        Some(RenderView {
            frame,
            phase: self.phase,
            width: map.width(),
            height: map.height(),
            tile_size: self.game.tile_size,
            tiles: map.tiles().to_vec(),
            players,
            bombs: world
                .bombs()
                .iter()
                .filter(|b| !b.exploded)
                .map(|b| BombView {
                    x: b.x,
                    y: b.y,
                    fuse_ratio: b.fuse_ratio(frame),
                })
                .collect(),
            explosions: world
                .explosions()
                .iter()
                .map(|e| ExplosionView {
                    cells: e.cells.clone(),
                    age_ratio: e.age_ratio(frame),
                })
                .collect(),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn game_config(&self) -> &GameConfig {
        &self.game
    }

    /// Adopts the tick rate the server announced on join
    pub fn set_tick_rate(&mut self, tick_rate: u32) {
        self.game.tick_rate = tick_rate.max(1);
    }
}
