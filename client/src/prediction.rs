//! Local mirror of the authoritative world used to predict the player's own motion.

use log::debug;
use shared::{GameConfig, Input, Player, Simulation, Snapshot};

/// Runs the shared simulation locally so the player's own movement shows up the
/// frame it is pressed instead of a round trip later.
///
/// Only movement is predicted. Bombs, explosions, tiles and other players are copied
/// from snapshots; they are authoritative-only.
pub struct ClientPredictor {
    player_id: u32,
    seed: u64,
    world: Simulation,
}

impl ClientPredictor {
    /// Regenerates the server's map from the seed it announced
    pub fn new(player_id: u32, config: GameConfig, seed: u64) -> Self {
        Self::from_simulation(player_id, Simulation::new(config, seed), seed)
    }

    pub fn from_simulation(player_id: u32, world: Simulation, seed: u64) -> Self {
        Self {
            player_id,
            seed,
            world,
        }
    }

    pub fn player_id(&self) -> u32 {
        self.player_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn world(&self) -> &Simulation {
        &self.world
    }

    pub fn local_player(&self) -> Option<&Player> {
        self.world.player(self.player_id)
    }

    /// Mirrors everything in `snapshot` except the local player, whose state goes
    /// through reconciliation. A full snapshot rebuilds the map from its seed first.
    pub fn apply_world(&mut self, snapshot: &Snapshot) {
        if snapshot.full {
            if snapshot.seed != self.seed {
                debug!("New round map from seed {}", snapshot.seed);
            }
            let config = *self.world.config();
            let local = self.local_player().cloned();
            self.world = Simulation::new(config, snapshot.seed);
            self.seed = snapshot.seed;
            if let Some(local) = local {
                self.world.upsert_player(local);
            }
        }

        self.world.apply_tile_changes(&snapshot.tile_changes);
        self.world.sync_world(
            snapshot.frame,
            snapshot.bombs.clone(),
            snapshot.explosions.clone(),
        );

        let me = self.player_id;
        for player in snapshot.players.iter().filter(|p| p.id != me) {
            self.world.upsert_player(player.clone());
        }
        self.world
            .retain_players(|id| id == me || snapshot.player(id).is_some());
    }

    /// Overwrites the local player with authoritative state
    pub fn set_local(&mut self, player: Player) {
        self.world.upsert_player(player);
    }

    pub fn remove_local(&mut self) {
        let me = self.player_id;
        self.world.retain_players(|id| id != me);
    }

    /// Applies one frame of the player's own input
    pub fn predict(&mut self, input: &Input) {
        self.world.step_player(self.player_id, input);
    }
}
