//! Per-player pending inputs, keyed by the frame they target.

use shared::{FrameInput, Input};
use std::collections::BTreeMap;

/// What a player does on a frame for which no input arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FallbackPolicy {
    /// Keep walking the last known direction, but never repeat a bomb drop
    #[default]
    RepeatMovement,
    /// Repeat the last known input verbatim
    RepeatLast,
    /// Stand still
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOutcome {
    Accepted,
    /// Targets a frame that already ran; acknowledged and remembered but not applied
    Late,
    /// Targets a frame beyond the lookback window
    TooFarAhead,
    /// A newer record for the same frame is already buffered
    Superseded,
}

#[derive(Debug)]
pub struct InputBuffer {
    /// target frame -> (record sequence, input)
    pending: BTreeMap<u32, (u32, Input)>,
    last_known: Input,
    last_known_frame: Option<u32>,
    ack: u32,
    lookback: u32,
}

impl InputBuffer {
    pub fn new(lookback: u32) -> Self {
        Self {
            pending: BTreeMap::new(),
            last_known: Input::idle(),
            last_known_frame: None,
            ack: 0,
            lookback,
        }
    }

    /// Highest record sequence applied or discarded as late. Never decreases.
    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn last_known(&self) -> Input {
        self.last_known
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, record: FrameInput, current_frame: u32) -> InputOutcome {
        if record.frame < current_frame {
            self.ack = self.ack.max(record.sequence);
            self.remember(record.frame, record.input);
            return InputOutcome::Late;
        }
        if record.frame > current_frame.saturating_add(self.lookback) {
            return InputOutcome::TooFarAhead;
        }

        match self.pending.get(&record.frame) {
            Some((sequence, _)) if *sequence >= record.sequence => InputOutcome::Superseded,
            _ => {
                self.pending
                    .insert(record.frame, (record.sequence, record.input));
                InputOutcome::Accepted
            }
        }
    }

    /// Pops the input for `frame`, falling back to `policy` when nothing arrived.
    /// Entries for earlier frames are evicted and count as acknowledged.
    pub fn take(&mut self, frame: u32, policy: FallbackPolicy) -> Input {
        let keep = self.pending.split_off(&frame);
        let evicted = std::mem::replace(&mut self.pending, keep);
        for (_, (sequence, _)) in evicted {
            self.ack = self.ack.max(sequence);
        }

        if let Some((sequence, input)) = self.pending.remove(&frame) {
            self.ack = self.ack.max(sequence);
            self.remember(frame, input);
            return input;
        }

        match policy {
            FallbackPolicy::RepeatMovement => self.last_known.movement_only(),
            FallbackPolicy::RepeatLast => self.last_known,
            FallbackPolicy::Idle => Input::idle(),
        }
    }

    /// Forgets buffered and remembered input for a new round. The ack survives.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.last_known = Input::idle();
        self.last_known_frame = None;
    }

    fn remember(&mut self, frame: u32, input: Input) {
        if self.last_known_frame.map_or(true, |known| frame >= known) {
            self.last_known = input;
            self.last_known_frame = Some(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Direction;

    fn record(sequence: u32, frame: u32, input: Input) -> FrameInput {
        FrameInput {
            sequence,
            frame,
            input,
        }
    }

    #[test]
    fn test_take_applies_buffered_input() {
        let mut buffer = InputBuffer::new(120);
        let right = Input::moving(Direction::Right);
        assert_eq!(buffer.push(record(1, 10, right), 5), InputOutcome::Accepted);
        assert_eq!(buffer.take(10, FallbackPolicy::Idle), right);
        assert_eq!(buffer.ack(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_newest_record_wins_per_frame() {
        let mut buffer = InputBuffer::new(120);
        let left = Input::moving(Direction::Left);
        let up = Input::moving(Direction::Up);
        buffer.push(record(2, 10, left), 0);
        assert_eq!(buffer.push(record(1, 10, up), 0), InputOutcome::Superseded);
        buffer.push(record(3, 10, up), 0);
        assert_eq!(buffer.take(10, FallbackPolicy::Idle), up);
        assert_eq!(buffer.ack(), 3);
    }

    #[test]
    fn test_late_input_is_acked_not_applied() {
        let mut buffer = InputBuffer::new(120);
        let down = Input::moving(Direction::Down);
        assert_eq!(buffer.push(record(4, 3, down), 10), InputOutcome::Late);
        assert_eq!(buffer.ack(), 4);
        // Remembered for the fallback
        assert_eq!(buffer.take(10, FallbackPolicy::RepeatMovement), down);
    }

    #[test]
    fn test_too_far_ahead_rejected() {
        let mut buffer = InputBuffer::new(10);
        let outcome = buffer.push(record(1, 50, Input::idle()), 0);
        assert_eq!(outcome, InputOutcome::TooFarAhead);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_fallback_policies() {
        let mut buffer = InputBuffer::new(120);
        let bombing = Input::moving(Direction::Left).with_bomb();
        buffer.push(record(1, 0, bombing), 0);
        buffer.take(0, FallbackPolicy::Idle);

        let repeat_movement = buffer.take(1, FallbackPolicy::RepeatMovement);
        assert!(repeat_movement.left);
        assert!(!repeat_movement.bomb);

        assert_eq!(buffer.take(2, FallbackPolicy::RepeatLast), bombing);
        assert_eq!(buffer.take(3, FallbackPolicy::Idle), Input::idle());
    }

    #[test]
    fn test_skipped_frames_are_evicted_and_acked() {
        let mut buffer = InputBuffer::new(120);
        buffer.push(record(1, 1, Input::idle()), 0);
        buffer.push(record(2, 2, Input::idle()), 0);
        buffer.push(record(3, 9, Input::idle()), 0);
        buffer.take(5, FallbackPolicy::Idle);
        assert_eq!(buffer.ack(), 2);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_ack_never_decreases() {
        let mut buffer = InputBuffer::new(120);
        buffer.push(record(9, 1, Input::idle()), 0);
        buffer.take(1, FallbackPolicy::Idle);
        buffer.push(record(3, 0, Input::idle()), 2);
        assert_eq!(buffer.ack(), 9);
        buffer.reset();
        assert_eq!(buffer.ack(), 9);
    }
}
