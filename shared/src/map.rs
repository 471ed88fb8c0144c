//! Tile grid with a single hidden door.

use crate::config::GameConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileType {
    Empty,
    Wall,
    Brick,
    Door,
}

impl TileType {
    /// Tiles that stop a walking player
    pub fn blocks_movement(self) -> bool {
        matches!(self, TileType::Wall | TileType::Brick)
    }
}

/// A single cell rewrite produced by an explosion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileChange {
    pub x: i32,
    pub y: i32,
    pub tile: TileType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Map {
    width: i32,
    height: i32,
    tiles: Vec<TileType>,
    hidden_door: Option<(i32, i32)>,
}

impl Map {
    /// Generates the arena for `seed`.
    ///
    /// Border and every even/even interior cell are walls, the four spawn corners are
    /// kept clear and the remaining cells receive bricks with `brick_density`. One
    /// brick is then picked as the hidden door. Identical seeds always produce
    /// identical maps, which is how clients rebuild the server's map.
    ///
    /// Even sizes are rounded up to the next odd one so that the far spawn corners
    /// never land on a pillar.
    pub fn generate(config: &GameConfig, seed: u64) -> Self {
        let width = config.map_width.max(5) | 1;
        let height = config.map_height.max(5) | 1;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tiles = vec![TileType::Empty; (width * height) as usize];

        let spawn_clearance = Self::spawn_clearance(width, height);

        for y in 0..height {
            for x in 0..width {
                let border = x == 0 || y == 0 || x == width - 1 || y == height - 1;
                let pillar = x % 2 == 0 && y % 2 == 0;
                let tile = if border || pillar {
                    TileType::Wall
                } else if spawn_clearance.contains(&(x, y)) {
                    TileType::Empty
                } else if rng.gen::<f32>() < config.brick_density {
                    TileType::Brick
                } else {
                    TileType::Empty
                };
                tiles[(y * width + x) as usize] = tile;
            }
        }

        let mut map = Self {
            width,
            height,
            tiles,
            hidden_door: None,
        };

        let mut bricks = map.cells_of(TileType::Brick);
        if bricks.is_empty() {
            // Guarantee a door candidate even on sparse maps
            let fallback = (1..height - 1)
                .flat_map(|y| (1..width - 1).map(move |x| (x, y)))
                .find(|cell| {
                    map.tile(cell.0, cell.1) == TileType::Empty
                        && !spawn_clearance.contains(cell)
                });
            if let Some((x, y)) = fallback {
                map.set_tile(x, y, TileType::Brick);
                bricks.push((x, y));
            }
        }

        if !bricks.is_empty() {
            let index = rng.gen_range(0..bricks.len());
            map.hidden_door = Some(bricks[index]);
        }

        map
    }

    /// Builds a map from explicit rows, mostly for tests and tools.
    ///
    /// `#` wall, `B` brick, `D` brick hiding the door, `O` open door, anything else
    /// is empty.
    pub fn from_rows(rows: &[&str]) -> Self {
        let height = rows.len() as i32;
        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0) as i32;
        let mut tiles = vec![TileType::Empty; (width * height) as usize];
        let mut hidden_door = None;

        for (y, row) in rows.iter().enumerate() {
            for (x, ch) in row.chars().enumerate() {
                let tile = match ch {
                    '#' => TileType::Wall,
                    'B' => TileType::Brick,
                    'D' => {
                        hidden_door = Some((x as i32, y as i32));
                        TileType::Brick
                    }
                    'O' => TileType::Door,
                    _ => TileType::Empty,
                };
                tiles[y * width as usize + x] = tile;
            }
        }

        Self {
            width,
            height,
            tiles,
            hidden_door,
        }
    }

    fn spawn_clearance(width: i32, height: i32) -> Vec<(i32, i32)> {
        let mut cells = Vec::new();
        for (cx, cy, dx, dy) in [
            (1, 1, 1, 1),
            (width - 2, 1, -1, 1),
            (1, height - 2, 1, -1),
            (width - 2, height - 2, -1, -1),
        ] {
            cells.push((cx, cy));
            cells.push((cx + dx, cy));
            cells.push((cx, cy + dy));
        }
        cells
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn in_bounds(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    /// Tile at `(x, y)`; anything outside the grid reads as wall
    pub fn tile(&self, x: i32, y: i32) -> TileType {
        if !self.in_bounds(x, y) {
            return TileType::Wall;
        }
        self.tiles[(y * self.width + x) as usize]
    }

    pub fn tiles(&self) -> &[TileType] {
        &self.tiles
    }

    pub fn hidden_door(&self) -> Option<(i32, i32)> {
        self.hidden_door
    }

    /// Writes a tile unless that would break a permanence rule
    /// (walls never change and doors never revert).
    pub fn set_tile(&mut self, x: i32, y: i32, tile: TileType) -> bool {
        if !self.in_bounds(x, y) {
            return false;
        }
        let index = (y * self.width + x) as usize;
        let current = self.tiles[index];
        match current {
            TileType::Wall | TileType::Door if current != tile => false,
            _ => {
                self.tiles[index] = tile;
                true
            }
        }
    }

    /// Destroys the brick at `(x, y)`, revealing the door if it was hiding there.
    pub fn destroy_brick(&mut self, x: i32, y: i32) -> Option<TileChange> {
        if self.tile(x, y) != TileType::Brick {
            return None;
        }
        let tile = if self.hidden_door == Some((x, y)) {
            TileType::Door
        } else {
            TileType::Empty
        };
        self.set_tile(x, y, tile);
        Some(TileChange { x, y, tile })
    }

    /// Replays tile changes received from the server
    pub fn apply_changes(&mut self, changes: &[TileChange]) {
        for change in changes {
            self.set_tile(change.x, change.y, change.tile);
        }
    }

    /// The four spawn cells, in corner-rotation order
    pub fn spawn_cells(&self) -> [(i32, i32); 4] {
        [
            (1, 1),
            (self.width - 2, self.height - 2),
            (self.width - 2, 1),
            (1, self.height - 2),
        ]
    }

    pub fn cells_of(&self, kind: TileType) -> Vec<(i32, i32)> {
        (0..self.height)
            .flat_map(|y| (0..self.width).map(move |x| (x, y)))
            .filter(|&(x, y)| self.tile(x, y) == kind)
            .collect()
    }
}
