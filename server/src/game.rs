use log::{debug, info};
use shared::{GameConfig, Input, Map, Phase, Simulation, Snapshot, TileChange};
use std::collections::{BTreeMap, HashMap};

/// Incremental snapshots repeat tile changes from this many recent frames, so a
/// client on a lossy transport still converges after losing a few snapshots.
pub const TILE_CHANGE_REDUNDANCY: u32 = 30;

/// The room's authoritative world: the simulation plus what the room needs around
/// it to bring late joiners up to date.
#[derive(Debug)]
pub struct Game {
    seed: u64,
    sim: Simulation,
    spawn_cursor: usize,
    /// Every tile change since the map was generated, tagged with its frame
    tile_history: Vec<(u32, TileChange)>,
}

impl Game {
    pub fn new(config: GameConfig, seed: u64) -> Self {
        Self::from_simulation(Simulation::new(config, seed), seed)
    }

    /// Wraps a prepared simulation, e.g. one built from a hand-drawn map
    pub fn from_simulation(sim: Simulation, seed: u64) -> Self {
        Self {
            seed,
            sim,
            spawn_cursor: 0,
            tile_history: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn frame(&self) -> u32 {
        self.sim.frame()
    }

    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    /// Spawns a player in the next corner of the rotation
    pub fn add_player(&mut self, player_id: u32) -> (i32, i32) {
        let corners = self.sim.map().spawn_cells();
        let cell = corners[self.spawn_cursor % corners.len()];
        self.spawn_cursor += 1;
        self.sim.add_player(player_id, cell);
        info!("Spawned player {} at {:?}", player_id, cell);
        cell
    }

    pub fn remove_player(&mut self, player_id: u32) -> bool {
        self.sim.remove_player(player_id).is_some()
    }

    pub fn advance(&mut self, inputs: &BTreeMap<u32, Input>) {
        let frame = self.sim.frame();
        self.sim.advance(inputs);
        for change in self.sim.take_tile_changes() {
            debug!("Frame {}: tile ({}, {}) -> {:?}", frame, change.x, change.y, change.tile);
            self.tile_history.push((frame, change));
        }
    }

    /// Regenerates the world from `seed` and respawns `players` in rotation order
    pub fn reset(&mut self, seed: u64, players: &[u32]) {
        let config = *self.sim.config();
        self.reset_with_map(seed, Map::generate(&config, seed), players);
    }

    pub fn reset_with_map(&mut self, seed: u64, map: Map, players: &[u32]) {
        let config = *self.sim.config();
        self.seed = seed;
        self.sim = Simulation::with_map(config, map);
        self.spawn_cursor = 0;
        self.tile_history.clear();
        for &player_id in players {
            self.add_player(player_id);
        }
    }

    pub fn snapshot(
        &self,
        phase: Phase,
        last_processed_input: HashMap<u32, u32>,
        full: bool,
        server_time_ms: u64,
    ) -> Snapshot {
        let horizon = self.sim.frame().saturating_sub(TILE_CHANGE_REDUNDANCY);
        let tile_changes = self
            .tile_history
            .iter()
            .filter(|(frame, _)| full || *frame >= horizon)
            .map(|(_, change)| *change)
            .collect();

        Snapshot {
            frame: self.sim.frame(),
            phase,
            seed: self.seed,
            server_time_ms,
            players: self.sim.players().cloned().collect(),
            bombs: self.sim.bombs().to_vec(),
            explosions: self.sim.explosions().to_vec(),
            tile_changes,
            last_processed_input,
            full,
        }
    }
}
