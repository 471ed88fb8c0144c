//! Deterministic, frame-stepped arena simulation.
//!
//! `Simulation::advance` is a pure function of the prior state and the inputs for the
//! frame: no clocks, no randomness after map generation. Players are kept in a
//! `BTreeMap` so every pass visits them in id order on every machine.

use crate::config::GameConfig;
use crate::entity::{Bomb, Direction, Explosion, Player};
use crate::input::Input;
use crate::map::{Map, TileChange, TileType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Result of a finished round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub winner: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Simulation {
    config: GameConfig,
    frame: u32,
    map: Map,
    players: BTreeMap<u32, Player>,
    bombs: Vec<Bomb>,
    explosions: Vec<Explosion>,
    /// Tile changes not yet handed out by `take_tile_changes`
    pending_changes: Vec<TileChange>,
}

impl Simulation {
    pub fn new(config: GameConfig, seed: u64) -> Self {
        Self::with_map(config, Map::generate(&config, seed))
    }

    pub fn with_map(config: GameConfig, map: Map) -> Self {
        Self {
            config,
            frame: 0,
            map,
            players: BTreeMap::new(),
            bombs: Vec::new(),
            explosions: Vec::new(),
            pending_changes: Vec::new(),
        }
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    /// The frame the next `advance` call will simulate
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn map(&self) -> &Map {
        &self.map
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn player(&self, id: u32) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn bombs(&self) -> &[Bomb] {
        &self.bombs
    }

    pub fn explosions(&self) -> &[Explosion] {
        &self.explosions
    }

    pub fn alive_players(&self) -> Vec<u32> {
        self.players
            .values()
            .filter(|p| p.is_alive())
            .map(|p| p.id)
            .collect()
    }

    /// Places a new player centred on `cell`. Returns false if the id is taken.
    pub fn add_player(&mut self, id: u32, cell: (i32, i32)) -> bool {
        if self.players.contains_key(&id) {
            return false;
        }
        let (x, y) = self.config.cell_origin(cell);
        self.players.insert(id, Player::new(id, x, y, &self.config));
        true
    }

    pub fn remove_player(&mut self, id: u32) -> Option<Player> {
        self.players.remove(&id)
    }

    /// Simulates exactly one frame.
    pub fn advance(&mut self, inputs: &BTreeMap<u32, Input>) {
        let ids: Vec<u32> = self.players.keys().copied().collect();
        for id in ids {
            let input = inputs.get(&id).copied().unwrap_or_default();
            self.move_player(id, &input);
            if input.bomb {
                self.try_place_bomb(id);
            }
        }

        self.resolve_explosions();
        self.apply_blast_damage();

        let frame = self.frame;
        self.explosions.retain(|e| e.expires_frame > frame);
        self.frame += 1;
    }

    /// Applies only the movement part of `input` to one player, leaving bombs,
    /// explosions and the frame counter untouched. Used to replay predicted input.
    pub fn step_player(&mut self, id: u32, input: &Input) {
        self.move_player(id, input);
    }

    pub fn is_game_over(&self) -> bool {
        self.outcome().is_some()
    }

    /// The round ends when nobody is alive, or when the last survivor stands on the
    /// door. A lone survivor away from the door keeps the round going.
    pub fn outcome(&self) -> Option<RoundOutcome> {
        let mut alive = self.players.values().filter(|p| p.is_alive());
        match (alive.next(), alive.next()) {
            (None, _) => Some(RoundOutcome { winner: None }),
            (Some(survivor), None) => {
                let (cx, cy) = survivor.cell(&self.config);
                if self.map.tile(cx, cy) == TileType::Door {
                    Some(RoundOutcome {
                        winner: Some(survivor.id),
                    })
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Tile changes since the previous call
    pub fn take_tile_changes(&mut self) -> Vec<TileChange> {
        std::mem::take(&mut self.pending_changes)
    }

    pub fn bomb_at(&self, cell: (i32, i32)) -> Option<&Bomb> {
        self.bombs.iter().find(|b| b.cell() == cell && !b.exploded)
    }

    /// Most recent explosion covering `cell`
    pub fn explosion_at(&self, cell: (i32, i32)) -> Option<&Explosion> {
        self.explosions.iter().rev().find(|e| e.covers(cell))
    }

    /// Cells a bomb of `range` at `center` would reach on the current map
    pub fn blast_cells(&self, center: (i32, i32), range: u32) -> Vec<(i32, i32)> {
        self.blast(center, range, &[]).0
    }

    // Client mirror maintenance

    /// Overwrites the world entities with authoritative data
    pub fn sync_world(&mut self, frame: u32, bombs: Vec<Bomb>, explosions: Vec<Explosion>) {
        self.frame = frame;
        self.bombs = bombs;
        self.explosions = explosions;
    }

    pub fn apply_tile_changes(&mut self, changes: &[TileChange]) {
        self.map.apply_changes(changes);
    }

    /// Inserts or replaces a player wholesale
    pub fn upsert_player(&mut self, player: Player) {
        self.players.insert(player.id, player);
    }

    pub fn retain_players<F>(&mut self, mut keep: F)
    where
        F: FnMut(u32) -> bool,
    {
        self.players.retain(|id, _| keep(*id));
    }

    // Movement

    fn move_player(&mut self, id: u32, input: &Input) {
        let mut player = match self.players.get(&id) {
            Some(p) if p.is_alive() => p.clone(),
            _ => return,
        };

        match input.direction() {
            None => player.moving = false,
            Some(direction) => {
                player.direction = direction;
                let speed = self.config.player_speed;
                let (dx, dy) = direction.delta();
                let nx = player.x + dx as f32 * speed;
                let ny = player.y + dy as f32 * speed;

                if self.is_free(&player, nx, ny) {
                    player.x = nx;
                    player.y = ny;
                    self.soft_align(&mut player, direction, speed);
                    player.moving = true;
                } else if let Some((cx, cy)) = self.corner_correction(&player, direction, speed)
                {
                    player.x = cx;
                    player.y = cy;
                    player.moving = true;
                } else {
                    player.moving = false;
                }
            }
        }

        let passes = std::mem::take(&mut player.bomb_passes);
        player.bomb_passes = passes
            .into_iter()
            .filter(|&cell| {
                self.bomb_at(cell).is_some() && self.overlaps_cell(player.x, player.y, cell)
            })
            .collect();

        self.players.insert(id, player);
    }

    /// Grid cells overlapped by a player box at `(x, y)`
    fn covered_cells(&self, x: f32, y: f32) -> impl Iterator<Item = (i32, i32)> {
        let t = self.config.tile_size;
        let s = self.config.player_size;
        let min_x = (x / t).floor() as i32;
        let max_x = ((x + s) / t).ceil() as i32 - 1;
        let min_y = (y / t).floor() as i32;
        let max_y = ((y + s) / t).ceil() as i32 - 1;
        (min_y..=max_y).flat_map(move |cy| (min_x..=max_x).map(move |cx| (cx, cy)))
    }

    fn overlaps_cell(&self, x: f32, y: f32, cell: (i32, i32)) -> bool {
        self.covered_cells(x, y).any(|c| c == cell)
    }

    fn is_free(&self, player: &Player, x: f32, y: f32) -> bool {
        self.covered_cells(x, y).all(|cell| {
            if self.map.tile(cell.0, cell.1).blocks_movement() {
                return false;
            }
            if self.bomb_at(cell).is_some() && !player.bomb_passes.contains(&cell) {
                return false;
            }
            !self.explosions.iter().any(|e| e.covers(cell))
        })
    }

    /// Grid-aligned coordinate on the axis perpendicular to `direction`
    fn aligned_perpendicular(&self, player: &Player, direction: Direction) -> f32 {
        let (cx, cy) = self.config.cell_at(player.x, player.y);
        let (ax, ay) = self.config.cell_origin((cx, cy));
        if direction.is_horizontal() {
            ay
        } else {
            ax
        }
    }

    /// When a single-axis move is blocked but the player is only slightly off the
    /// lane, slide the perpendicular axis toward the lane instead of stalling.
    fn corner_correction(
        &self,
        player: &Player,
        direction: Direction,
        speed: f32,
    ) -> Option<(f32, f32)> {
        let target = self.aligned_perpendicular(player, direction);
        let current = if direction.is_horizontal() {
            player.y
        } else {
            player.x
        };
        let offset = target - current;
        if offset == 0.0 || offset.abs() > self.config.corner_tolerance {
            return None;
        }

        // Only worth it when the aligned lane is actually open ahead
        let (dx, dy) = direction.delta();
        let (lane_x, lane_y) = if direction.is_horizontal() {
            (player.x + dx as f32 * speed, target)
        } else {
            (target, player.y + dy as f32 * speed)
        };
        if !self.is_free(player, lane_x, lane_y) {
            return None;
        }

        let step = offset.signum() * offset.abs().min(speed);
        let candidate = if direction.is_horizontal() {
            (player.x, player.y + step)
        } else {
            (player.x + step, player.y)
        };
        if self.is_free(player, candidate.0, candidate.1) {
            Some(candidate)
        } else {
            None
        }
    }

    /// Pulls the idle axis a fraction of the frame's travel toward the grid
    fn soft_align(&self, player: &mut Player, direction: Direction, speed: f32) {
        let target = self.aligned_perpendicular(player, direction);
        let current = if direction.is_horizontal() {
            player.y
        } else {
            player.x
        };
        let offset = target - current;
        if offset == 0.0 {
            return;
        }

        let nudge = speed * self.config.soft_align_fraction;
        let step = offset.signum() * offset.abs().min(nudge);
        let (x, y) = if direction.is_horizontal() {
            (player.x, player.y + step)
        } else {
            (player.x + step, player.y)
        };
        if self.is_free(player, x, y) {
            player.x = x;
            player.y = y;
        }
    }

    // Bombs and explosions

    fn try_place_bomb(&mut self, id: u32) -> bool {
        let frame = self.frame;
        let (cell, range) = match self.players.get(&id) {
            Some(p) if p.is_alive() => {
                if frame < p.next_bomb_frame {
                    return false;
                }
                let active = self
                    .bombs
                    .iter()
                    .filter(|b| b.owner == id && !b.exploded)
                    .count() as u32;
                if active >= p.max_bombs {
                    return false;
                }
                (p.cell(&self.config), p.bomb_range)
            }
            _ => return false,
        };

        if self.map.tile(cell.0, cell.1) != TileType::Empty || self.bomb_at(cell).is_some() {
            return false;
        }

        self.bombs.push(Bomb {
            x: cell.0,
            y: cell.1,
            owner: id,
            placed_frame: frame,
            explode_frame: frame + self.config.fuse_frames,
            range,
            exploded: false,
        });

        if let Some(player) = self.players.get_mut(&id) {
            player.next_bomb_frame = frame + self.config.bomb_cooldown_frames;
        }
        // Everyone caught on the cell, owner included, may still walk off it
        let standing: Vec<u32> = self
            .players
            .values()
            .filter(|p| p.is_alive() && self.overlaps_cell(p.x, p.y, cell))
            .map(|p| p.id)
            .collect();
        for standing_id in standing {
            if let Some(player) = self.players.get_mut(&standing_id) {
                player.bomb_passes.push(cell);
            }
        }
        true
    }

    /// Walks the four arms of a blast. Bricks listed in `crumbling` were destroyed
    /// earlier in the same frame and still stop the blast.
    fn blast(
        &self,
        center: (i32, i32),
        range: u32,
        crumbling: &[(i32, i32)],
    ) -> (Vec<(i32, i32)>, Vec<(i32, i32)>) {
        let mut cells = vec![center];
        let mut bricks = Vec::new();

        for direction in Direction::ALL {
            let (dx, dy) = direction.delta();
            for step in 1..=range as i32 {
                let cell = (center.0 + dx * step, center.1 + dy * step);
                let tile = if crumbling.contains(&cell) {
                    TileType::Brick
                } else {
                    self.map.tile(cell.0, cell.1)
                };
                match tile {
                    TileType::Wall | TileType::Door => break,
                    TileType::Brick => {
                        cells.push(cell);
                        bricks.push(cell);
                        break;
                    }
                    TileType::Empty => cells.push(cell),
                }
            }
        }

        (cells, bricks)
    }

    /// Detonates every due bomb and, transitively, every bomb caught in a blast, until
    /// nothing else changes. Chained bombs inherit the triggering bomb's frame.
    fn resolve_explosions(&mut self) {
        let frame = self.frame;
        let mut queue: VecDeque<usize> = self
            .bombs
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.exploded && b.explode_frame <= frame)
            .map(|(i, _)| i)
            .collect();
        let mut crumbling: Vec<(i32, i32)> = Vec::new();

        while let Some(index) = queue.pop_front() {
            if self.bombs[index].exploded {
                continue;
            }
            self.bombs[index].exploded = true;
            let bomb = self.bombs[index].clone();

            let (cells, bricks) = self.blast(bomb.cell(), bomb.range, &crumbling);

            let mut tile_changes = Vec::new();
            for (x, y) in bricks {
                if let Some(change) = self.map.destroy_brick(x, y) {
                    tile_changes.push(change);
                    crumbling.push((x, y));
                }
            }

            for (other_index, other) in self.bombs.iter_mut().enumerate() {
                if !other.exploded && cells.contains(&other.cell()) {
                    other.explode_frame = other.explode_frame.min(bomb.explode_frame);
                    queue.push_back(other_index);
                }
            }

            self.pending_changes.extend(tile_changes.iter().copied());
            self.explosions.push(Explosion {
                x: bomb.x,
                y: bomb.y,
                owner: bomb.owner,
                range: bomb.range,
                created_frame: frame,
                expires_frame: frame + self.config.explosion_frames,
                cells,
                tile_changes,
            });
        }

        self.bombs.retain(|b| !b.exploded);
    }

    fn apply_blast_damage(&mut self) {
        let config = self.config;
        let explosions = &self.explosions;
        for player in self.players.values_mut() {
            if player.dead {
                continue;
            }
            let cell = player.cell(&config);
            if explosions.iter().any(|e| e.covers(cell)) {
                player.dead = true;
                player.moving = false;
            }
        }
    }
}
