//! Server reconciliation for the locally predicted player.

use crate::config::ClientConfig;
use crate::prediction::ClientPredictor;
use log::debug;
use shared::{FrameInput, Player};

/// Below this many pixels a visual offset counts as settled
const SETTLED: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Correction {
    /// Prediction matched the server
    None,
    /// Small error, eased in over the next frames
    Soft { error: f32 },
    /// Large error, applied at once
    Hard { error: f32 },
}

/// Rebases the predicted player on authoritative state and replays whatever the
/// server has not consumed yet.
///
/// The simulated position always jumps to the corrected value. What the player sees
/// is that position plus a visual offset which absorbs small corrections and decays
/// each frame, so minor mispredictions glide instead of popping.
pub struct ReconciliationEngine {
    threshold: f32,
    ease: f32,
    offset: (f32, f32),
    last: Correction,
    hard_corrections: u64,
    soft_corrections: u64,
}

impl ReconciliationEngine {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            threshold: config.correction_threshold,
            ease: config.correction_ease.clamp(0.0, 1.0),
            offset: (0.0, 0.0),
            last: Correction::None,
            hard_corrections: 0,
            soft_corrections: 0,
        }
    }

    pub fn reconcile<'a, I>(
        &mut self,
        predictor: &mut ClientPredictor,
        authoritative: &Player,
        pending: I,
    ) -> Correction
    where
        I: IntoIterator<Item = &'a FrameInput>,
    {
        let before = predictor.local_player().map(|p| (p.x, p.y));

        predictor.set_local(authoritative.clone());
        let mut replayed = 0;
        for record in pending {
            predictor.predict(&record.input);
            replayed += 1;
        }

        let Some(after) = predictor.local_player().map(|p| (p.x, p.y)) else {
            return Correction::None;
        };
        let Some(before) = before else {
            // First sighting of the local player: nothing on screen to correct
            self.offset = (0.0, 0.0);
            self.last = Correction::None;
            return self.last;
        };

        let dx = before.0 - after.0;
        let dy = before.1 - after.1;
        let error = (dx * dx + dy * dy).sqrt();

        self.last = if error <= SETTLED {
            Correction::None
        } else if error < self.threshold {
            // Keep the on-screen position where it was and let the offset decay
            self.offset.0 += dx;
            self.offset.1 += dy;
            self.soft_corrections += 1;
            Correction::Soft { error }
        } else {
            debug!(
                "Hard correction of {:.2}px after replaying {} inputs",
                error, replayed
            );
            self.offset = (0.0, 0.0);
            self.hard_corrections += 1;
            Correction::Hard { error }
        };
        self.last
    }

    /// Decays the visual offset by one frame
    pub fn ease(&mut self) {
        let keep = 1.0 - self.ease;
        self.offset.0 *= keep;
        self.offset.1 *= keep;
        if self.offset.0.abs() < SETTLED && self.offset.1.abs() < SETTLED {
            self.offset = (0.0, 0.0);
        }
    }

    pub fn offset(&self) -> (f32, f32) {
        self.offset
    }

    /// Where to draw `player`
    pub fn visual_position(&self, player: &Player) -> (f32, f32) {
        (player.x + self.offset.0, player.y + self.offset.1)
    }

    pub fn last_correction(&self) -> Correction {
        self.last
    }

    /// (soft, hard) corrections so far
    pub fn correction_counts(&self) -> (u64, u64) {
        (self.soft_corrections, self.hard_corrections)
    }

    pub fn reset(&mut self) {
        self.offset = (0.0, 0.0);
        self.last = Correction::None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::{Direction, GameConfig, Input, Map, Simulation};

    fn predictor_at(cell: (i32, i32)) -> (ClientPredictor, Player) {
        let config = GameConfig::default();
        let map = Map::from_rows(&[
            "###########",
            "#         #",
            "#         #",
            "#         #",
            "###########",
        ]);
        let mut predictor =
            ClientPredictor::from_simulation(1, Simulation::with_map(config, map), 0);
        let (x, y) = config.cell_origin(cell);
        let player = Player::new(1, x, y, &config);
        predictor.set_local(player.clone());
        (predictor, player)
    }

    fn inputs(direction: Direction, count: u32, first_sequence: u32) -> Vec<FrameInput> {
        (0..count)
            .map(|i| FrameInput {
                sequence: first_sequence + i,
                frame: i,
                input: Input::moving(direction),
            })
            .collect()
    }

    #[test]
    fn test_matching_prediction_needs_no_correction() {
        let (mut predictor, start) = predictor_at((1, 2));
        let pending = inputs(Direction::Right, 4, 1);
        for record in &pending {
            predictor.predict(&record.input);
        }

        let mut engine = ReconciliationEngine::new(&ClientConfig::default());
        let correction = engine.reconcile(&mut predictor, &start, &pending);
        assert_eq!(correction, Correction::None);
        assert_eq!(engine.offset(), (0.0, 0.0));
    }

    #[test]
    fn test_small_error_is_eased() {
        let (mut predictor, start) = predictor_at((1, 2));
        let pending = inputs(Direction::Right, 2, 1);
        for record in &pending {
            predictor.predict(&record.input);
        }

        // The server had us 4px further left than we started
        let mut authoritative = start.clone();
        authoritative.x -= 4.0;
        let mut engine = ReconciliationEngine::new(&ClientConfig::default());
        let correction = engine.reconcile(&mut predictor, &authoritative, &pending);

        match correction {
            Correction::Soft { error } => assert_approx_eq!(error, 4.0),
            other => panic!("expected soft correction, got {:?}", other),
        }
        let player = predictor.local_player().unwrap().clone();
        assert_approx_eq!(player.x, authoritative.x + 4.0);
        let (vx, _) = engine.visual_position(&player);
        assert_approx_eq!(vx, start.x + 4.0);

        engine.ease();
        assert_approx_eq!(engine.offset().0, 4.0 * 0.8);
        for _ in 0..200 {
            engine.ease();
        }
        assert_eq!(engine.offset(), (0.0, 0.0));
    }

    #[test]
    fn test_large_error_snaps() {
        let (mut predictor, start) = predictor_at((1, 2));
        let mut authoritative = start.clone();
        authoritative.x += 64.0;
        let mut engine = ReconciliationEngine::new(&ClientConfig::default());
        let correction = engine.reconcile(&mut predictor, &authoritative, &[] as &[FrameInput]);
        assert!(matches!(correction, Correction::Hard { .. }));
        assert_eq!(engine.offset(), (0.0, 0.0));
        assert_eq!(predictor.local_player().unwrap().x, authoritative.x);
        assert_eq!(engine.correction_counts(), (0, 1));
    }

    #[test]
    fn test_replay_is_idempotent() {
        let (mut predictor, start) = predictor_at((2, 1));
        let pending: Vec<FrameInput> = inputs(Direction::Right, 5, 1)
            .into_iter()
            .chain(inputs(Direction::Down, 5, 6))
            .collect();
        let mut engine = ReconciliationEngine::new(&ClientConfig::default());

        engine.reconcile(&mut predictor, &start, &pending);
        let first = predictor.local_player().unwrap().clone();
        engine.reconcile(&mut predictor, &start, &pending);
        let second = predictor.local_player().unwrap().clone();

        assert_eq!(first, second);
        assert_eq!(engine.last_correction(), Correction::None);
    }

    #[test]
    fn test_first_sighting_has_no_offset() {
        let config = GameConfig::default();
        let mut predictor = ClientPredictor::new(9, config, 3);
        let (x, y) = config.cell_origin((1, 1));
        let mut engine = ReconciliationEngine::new(&ClientConfig::default());
        let correction =
            engine.reconcile(&mut predictor, &Player::new(9, x, y, &config), &[] as &[FrameInput]);
        assert_eq!(correction, Correction::None);
        assert!(predictor.local_player().is_some());
    }
}
