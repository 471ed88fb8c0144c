use crate::entity::Direction;
use crate::simulation::Simulation;
use serde::{Deserialize, Serialize};

/// One frame of player intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Input {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub bomb: bool,
}

impl Input {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn moving(direction: Direction) -> Self {
        let mut input = Self::default();
        match direction {
            Direction::Up => input.up = true,
            Direction::Down => input.down = true,
            Direction::Left => input.left = true,
            Direction::Right => input.right = true,
        }
        input
    }

    pub fn with_bomb(mut self) -> Self {
        self.bomb = true;
        self
    }

    /// Movement is single-axis: when several keys are held the first of
    /// up, down, left, right wins.
    pub fn direction(&self) -> Option<Direction> {
        if self.up {
            Some(Direction::Up)
        } else if self.down {
            Some(Direction::Down)
        } else if self.left {
            Some(Direction::Left)
        } else if self.right {
            Some(Direction::Right)
        } else {
            None
        }
    }

    /// Same input without the bomb flag
    pub fn movement_only(&self) -> Self {
        Self {
            bomb: false,
            ..*self
        }
    }
}

/// An input record scheduled for a specific server frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInput {
    /// Client sequence number of this record
    pub sequence: u32,
    /// Server frame the input should be applied on
    pub frame: u32,
    pub input: Input,
}

/// Read-only view handed to input providers each frame
pub struct WorldView<'a> {
    pub frame: u32,
    pub player_id: u32,
    pub simulation: &'a Simulation,
}

/// Anything that produces per-frame input: a human's keyboard, a scripted driver or
/// an AI. The simulation cannot tell them apart.
pub trait InputProvider: Send {
    fn decide(&mut self, view: &WorldView<'_>) -> Input;
}
