use crate::config::GameConfig;
use crate::map::TileChange;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    Up,
    #[default]
    Down,
    Left,
    Right,
}

impl Direction {
    /// Unit step in grid coordinates
    pub fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }

    pub fn is_horizontal(self) -> bool {
        matches!(self, Direction::Left | Direction::Right)
    }

    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: u32,
    pub x: f32,
    pub y: f32,
    pub direction: Direction,
    pub moving: bool,
    pub dead: bool,
    /// First frame at which another bomb may be placed
    pub next_bomb_frame: u32,
    pub max_bombs: u32,
    pub bomb_range: u32,
    /// Cells of fresh bombs the player was standing on when they were placed. Each
    /// stays walkable for this player until the box has fully left it.
    pub bomb_passes: Vec<(i32, i32)>,
}

impl Player {
    pub fn new(id: u32, x: f32, y: f32, config: &GameConfig) -> Self {
        Self {
            id,
            x,
            y,
            direction: Direction::Down,
            moving: false,
            dead: false,
            next_bomb_frame: 0,
            max_bombs: config.default_max_bombs,
            bomb_range: config.default_bomb_range,
            bomb_passes: Vec::new(),
        }
    }

    pub fn cell(&self, config: &GameConfig) -> (i32, i32) {
        config.cell_at(self.x, self.y)
    }

    pub fn is_alive(&self) -> bool {
        !self.dead
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bomb {
    pub x: i32,
    pub y: i32,
    pub owner: u32,
    pub placed_frame: u32,
    pub explode_frame: u32,
    pub range: u32,
    pub exploded: bool,
}

impl Bomb {
    pub fn cell(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Remaining fuse as a fraction of the full fuse, 1.0 right after placement
    pub fn fuse_ratio(&self, frame: u32) -> f32 {
        let total = self.explode_frame.saturating_sub(self.placed_frame).max(1);
        let left = self.explode_frame.saturating_sub(frame);
        (left as f32 / total as f32).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Explosion {
    pub x: i32,
    pub y: i32,
    pub owner: u32,
    pub range: u32,
    pub created_frame: u32,
    pub expires_frame: u32,
    /// Cells the blast reached, centre first
    pub cells: Vec<(i32, i32)>,
    pub tile_changes: Vec<TileChange>,
}

impl Explosion {
    pub fn covers(&self, cell: (i32, i32)) -> bool {
        self.cells.contains(&cell)
    }

    /// Elapsed lifetime as a fraction, 0.0 on the creation frame
    pub fn age_ratio(&self, frame: u32) -> f32 {
        let total = self.expires_frame.saturating_sub(self.created_frame).max(1);
        let age = frame.saturating_sub(self.created_frame);
        (age as f32 / total as f32).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_player_creation() {
        let config = GameConfig::default();
        let player = Player::new(1, 36.0, 36.0, &config);
        assert_eq!(player.id, 1);
        assert_eq!(player.cell(&config), (1, 1));
        assert_eq!(player.max_bombs, config.default_max_bombs);
        assert!(player.is_alive());
        assert!(player.bomb_passes.is_empty());
    }

    #[test]
    fn test_bomb_fuse_ratio() {
        let bomb = Bomb {
            x: 1,
            y: 1,
            owner: 1,
            placed_frame: 100,
            explode_frame: 200,
            range: 2,
            exploded: false,
        };
        assert_approx_eq!(bomb.fuse_ratio(100), 1.0);
        assert_approx_eq!(bomb.fuse_ratio(150), 0.5);
        assert_approx_eq!(bomb.fuse_ratio(250), 0.0);
    }

    #[test]
    fn test_explosion_age_ratio() {
        let explosion = Explosion {
            x: 0,
            y: 0,
            owner: 1,
            range: 1,
            created_frame: 10,
            expires_frame: 20,
            cells: vec![(0, 0)],
            tile_changes: vec![],
        };
        assert!(explosion.covers((0, 0)));
        assert_approx_eq!(explosion.age_ratio(15), 0.5);
    }

    #[test]
    fn test_direction_delta() {
        assert_eq!(Direction::Left.delta(), (-1, 0));
        assert!(Direction::Right.is_horizontal());
        assert!(!Direction::Up.is_horizontal());
    }
}
