use crate::game::RenderView;
use log::info;
use shared::{Phase, TileType};
use std::error::Error;

/// Presentation seam. The client hands a finished [`RenderView`] to whatever draws
/// it and never reads anything back.
pub trait Renderer {
    fn render(&mut self, view: &RenderView) -> Result<(), Box<dyn Error>>;

    /// `false` once the output has gone away and the client should stop
    fn is_open(&self) -> bool {
        true
    }
}

/// Text rendering of the arena, one character per tile.
///
/// `@` is the local player, remote players show the last digit of their id, `x` marks
/// the dead. Then bombs `o`, blasts `*`, and the grid: `#` wall, `+` brick, `D` door.
pub fn render_ascii(view: &RenderView) -> String {
    let mut rows = Vec::with_capacity(view.height as usize);
    for y in 0..view.height {
        let mut row = String::with_capacity(view.width as usize);
        for x in 0..view.width {
            row.push(cell_char(view, x, y));
        }
        rows.push(row);
    }
    rows.join("\n")
}

fn cell_char(view: &RenderView, x: i32, y: i32) -> char {
    let player = view
        .players
        .iter()
        .filter(|p| p.cell == (x, y))
        .max_by_key(|p| (!p.dead, p.local));
    if let Some(p) = player {
        return if p.dead {
            'x'
        } else if p.local {
            '@'
        } else {
            char::from_digit(p.id % 10, 10).unwrap_or('?')
        };
    }

    if view.bombs.iter().any(|b| (b.x, b.y) == (x, y)) {
        return 'o';
    }
    if view.explosions.iter().any(|e| e.cells.contains(&(x, y))) {
        return '*';
    }
    match view.tile(x, y) {
        TileType::Wall => '#',
        TileType::Brick => '+',
        TileType::Door => 'D',
        TileType::Empty => ' ',
    }
}

/// Headless renderer that writes the arena to the log every `every` frames.
pub struct LogRenderer {
    every: u32,
    rendered: u32,
    last_phase: Option<Phase>,
}

impl LogRenderer {
    pub fn new(every: u32) -> Self {
        Self {
            every: every.max(1),
            rendered: 0,
            last_phase: None,
        }
    }

    pub fn rendered(&self) -> u32 {
        self.rendered
    }
}

impl Renderer for LogRenderer {
    fn render(&mut self, view: &RenderView) -> Result<(), Box<dyn Error>> {
        let phase_changed = self.last_phase != Some(view.phase);
        if phase_changed || self.rendered % self.every == 0 {
            let alive = view.players.iter().filter(|p| !p.dead).count();
            info!(
                "Frame {} ({}, {} alive, {} bombs)\n{}",
                view.frame,
                view.phase,
                alive,
                view.bombs.len(),
                render_ascii(view)
            );
        }
        self.last_phase = Some(view.phase);
        self.rendered += 1;
        Ok(())
    }
}
