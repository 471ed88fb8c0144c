//! Client input management with sequencing and target frames

use shared::{FrameInput, Input, Packet};
use std::collections::VecDeque;

/// Keeps the player's recent inputs until the server acknowledges them.
///
/// Every recorded input gets the next sequence number and a target frame. Target
/// frames never go backwards, even when the estimated lead shrinks, so the server
/// never sees a later input aimed at an earlier frame.
pub struct InputManager {
    next_sequence: u32,
    current: Input,
    pending: VecDeque<FrameInput>,
    capacity: usize,
    batch: usize,
    last_target: Option<u32>,
}

impl InputManager {
    pub fn new(capacity: usize, batch: usize) -> Self {
        Self {
            next_sequence: 1,
            current: Input::idle(),
            pending: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            batch: batch.max(1),
            last_target: None,
        }
    }

    /// What the player is holding right now
    pub fn set_current(&mut self, input: Input) {
        self.current = input;
    }

    pub fn current(&self) -> Input {
        self.current
    }

    /// Stamps the current input for `target_frame` and keeps it for replay
    pub fn record(&mut self, target_frame: u32) -> FrameInput {
        let frame = match self.last_target {
            Some(last) => target_frame.max(last),
            None => target_frame,
        };
        self.last_target = Some(frame);

        let record = FrameInput {
            sequence: self.next_sequence,
            frame,
            input: self.current,
        };
        self.next_sequence = self.next_sequence.wrapping_add(1);

        self.pending.push_back(record);
        while self.pending.len() > self.capacity {
            self.pending.pop_front();
        }
        record
    }

    /// Drops everything the server has consumed or discarded
    pub fn acknowledge(&mut self, ack: u32) {
        self.pending.retain(|record| record.sequence > ack);
    }

    /// Unacknowledged inputs, oldest first
    pub fn pending(&self) -> impl Iterator<Item = &FrameInput> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The newest inputs as one packet, so a lost packet is covered by the next one
    pub fn batch_packet(&self) -> Option<Packet> {
        let newest = self.pending.back()?;
        let skip = self.pending.len().saturating_sub(self.batch);
        Some(Packet::Input {
            sequence: newest.sequence,
            inputs: self.pending.iter().skip(skip).copied().collect(),
        })
    }

    /// Forgets pending inputs after a round reset. Sequence numbers keep counting so
    /// the server's acknowledgment stays meaningful.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.last_target = None;
    }
}

impl Default for InputManager {
    fn default() -> Self {
        Self::new(120, 5)
    }
}
