use serde::{Deserialize, Serialize};

/// Immutable rules of the arena, shared by server and client so that both run the
/// exact same simulation.
///
/// All distances are in pixels and all durations in frames. Built once at startup and
/// handed to every component by value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameConfig {
    /// Map width in tiles (including the border walls), rounded up to an odd size
    pub map_width: i32,
    /// Map height in tiles (including the border walls), rounded up to an odd size
    pub map_height: i32,
    pub tile_size: f32,
    /// Side of the player's collision box; smaller than a tile so corridors fit
    pub player_size: f32,
    /// Distance travelled per frame
    pub player_speed: f32,
    pub tick_rate: u32,
    pub fuse_frames: u32,
    pub explosion_frames: u32,
    pub bomb_cooldown_frames: u32,
    pub default_max_bombs: u32,
    pub default_bomb_range: u32,
    /// Probability that an open interior cell receives a brick
    pub brick_density: f32,
    /// Largest perpendicular misalignment that still rounds a corner
    pub corner_tolerance: f32,
    /// Share of the frame's travel used to pull the idle axis back onto the grid
    pub soft_align_fraction: f32,
    /// Frames spent in Countdown before Running; zero skips the phase
    pub countdown_frames: u32,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            map_width: 15,
            map_height: 13,
            tile_size: 32.0,
            player_size: 24.0,
            player_speed: 2.0,
            tick_rate: 60,
            fuse_frames: 180,
            explosion_frames: 30,
            bomb_cooldown_frames: 10,
            default_max_bombs: 1,
            default_bomb_range: 2,
            brick_density: 0.55,
            corner_tolerance: 10.0,
            soft_align_fraction: 0.5,
            countdown_frames: 0,
        }
    }
}

impl GameConfig {
    /// Wall-clock length of one frame in milliseconds
    pub fn frame_duration_ms(&self) -> f64 {
        1000.0 / self.tick_rate.max(1) as f64
    }

    /// Offset that centres the player box inside a tile
    pub fn inset(&self) -> f32 {
        (self.tile_size - self.player_size) / 2.0
    }

    /// Top-left pixel position of a player standing centred on `cell`
    pub fn cell_origin(&self, cell: (i32, i32)) -> (f32, f32) {
        (
            cell.0 as f32 * self.tile_size + self.inset(),
            cell.1 as f32 * self.tile_size + self.inset(),
        )
    }

    /// Grid cell that contains the centre of a player box at `(x, y)`
    pub fn cell_at(&self, x: f32, y: f32) -> (i32, i32) {
        let half = self.player_size / 2.0;
        (
            ((x + half) / self.tile_size).floor() as i32,
            ((y + half) / self.tile_size).floor() as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_cell_origin_is_centered() {
        let config = GameConfig::default();
        let (x, y) = config.cell_origin((2, 3));
        assert_eq!(x, 2.0 * 32.0 + 4.0);
        assert_eq!(y, 3.0 * 32.0 + 4.0);
        assert_eq!(config.cell_at(x, y), (2, 3));
    }

    #[test]
    fn test_cell_at_uses_box_center() {
        let config = GameConfig::default();
        // Centre sits just past the tile boundary
        assert_eq!(config.cell_at(21.0, 4.0), (1, 0));
        assert_eq!(config.cell_at(19.0, 4.0), (0, 0));
    }

    #[test]
    fn test_frame_duration() {
        let config = GameConfig::default();
        assert_approx_eq!(config.frame_duration_ms(), 16.666, 0.01);
    }
}
