//! A small wandering AI that plugs into the same input path as a human.

use crate::entity::Direction;
use crate::input::{Input, InputProvider, WorldView};
use crate::map::TileType;
use crate::simulation::Simulation;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Walks in straight lines, drops bombs next to bricks and runs away from blasts.
///
/// Seeded, so a bot replays identically for the same world.
pub struct WanderBot {
    rng: StdRng,
    heading: Option<Direction>,
    frames_left: u32,
    bomb_chance: f32,
}

impl WanderBot {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            heading: None,
            frames_left: 0,
            bomb_chance: 0.05,
        }
    }

    pub fn with_bomb_chance(mut self, chance: f32) -> Self {
        self.bomb_chance = chance;
        self
    }

    fn walkable(sim: &Simulation, cell: (i32, i32)) -> bool {
        !sim.map().tile(cell.0, cell.1).blocks_movement()
            && sim.bomb_at(cell).is_none()
            && sim.explosion_at(cell).is_none()
    }

    fn in_danger(sim: &Simulation, cell: (i32, i32)) -> bool {
        sim.explosion_at(cell).is_some()
            || sim
                .bombs()
                .iter()
                .any(|b| sim.blast_cells(b.cell(), b.range).contains(&cell))
    }

    fn pick(&mut self, options: &[Direction]) -> Option<Direction> {
        if options.is_empty() {
            None
        } else {
            Some(options[self.rng.gen_range(0..options.len())])
        }
    }
}

impl InputProvider for WanderBot {
    fn decide(&mut self, view: &WorldView<'_>) -> Input {
        let sim = view.simulation;
        let player = match sim.player(view.player_id) {
            Some(p) if p.is_alive() => p,
            _ => return Input::idle(),
        };
        let cell = player.cell(sim.config());

        let open: Vec<Direction> = Direction::ALL
            .into_iter()
            .filter(|d| {
                let (dx, dy) = d.delta();
                Self::walkable(sim, (cell.0 + dx, cell.1 + dy))
            })
            .collect();

        if Self::in_danger(sim, cell) {
            let safe: Vec<Direction> = open
                .iter()
                .copied()
                .filter(|d| {
                    let (dx, dy) = d.delta();
                    !Self::in_danger(sim, (cell.0 + dx, cell.1 + dy))
                })
                .collect();
            let keep_going = self
                .heading
                .map(|h| open.contains(&h))
                .unwrap_or(false);
            if !keep_going || !safe.is_empty() {
                self.heading = self.pick(if safe.is_empty() { &open } else { &safe });
            }
            self.frames_left = 16;
            return self.heading.map(Input::moving).unwrap_or_default();
        }

        let next_to_brick = Direction::ALL.into_iter().any(|d| {
            let (dx, dy) = d.delta();
            sim.map().tile(cell.0 + dx, cell.1 + dy) == TileType::Brick
        });
        let owns_bomb = sim.bombs().iter().any(|b| b.owner == player.id);
        if next_to_brick && !owns_bomb && !open.is_empty() && self.rng.gen::<f32>() < self.bomb_chance
        {
            self.heading = self.pick(&open);
            self.frames_left = 16;
            return Input::idle().with_bomb();
        }

        let blocked = self.heading.map(|h| !open.contains(&h)).unwrap_or(true);
        if self.frames_left == 0 || (blocked && !player.moving) {
            self.heading = self.pick(&open);
            self.frames_left = self.rng.gen_range(16..64);
        }
        self.frames_left = self.frames_left.saturating_sub(1);

        self.heading.map(Input::moving).unwrap_or_default()
    }
}
