//! Snapshot interpolation and dead reckoning for remote players.

use shared::Direction;
use std::collections::{HashMap, VecDeque};

/// One authoritative observation of a remote player, stamped with server time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time_ms: u64,
    pub x: f32,
    pub y: f32,
    pub direction: Direction,
    pub moving: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothMode {
    /// Render time at or before the oldest buffered sample
    Anchored,
    /// Between two samples
    Interpolated,
    /// Past the newest sample, within the dead-reckoning window
    Extrapolated,
    /// Past the dead-reckoning window
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothed {
    pub x: f32,
    pub y: f32,
    pub direction: Direction,
    pub moving: bool,
    pub mode: SmoothMode,
}

#[derive(Debug, Default)]
struct Track {
    samples: VecDeque<Sample>,
    /// Pixels per millisecond, from the two newest samples
    velocity: (f32, f32),
}

impl Track {
    fn push(&mut self, sample: Sample, capacity: usize) -> bool {
        if let Some(newest) = self.samples.back() {
            if sample.time_ms <= newest.time_ms {
                return false;
            }
            let dt = (sample.time_ms - newest.time_ms) as f32;
            self.velocity = ((sample.x - newest.x) / dt, (sample.y - newest.y) / dt);
        }
        self.samples.push_back(sample);
        while self.samples.len() > capacity {
            self.samples.pop_front();
        }
        true
    }

    fn sample(&self, render_ms: u64, window_ms: u64) -> Option<Smoothed> {
        let oldest = self.samples.front()?;
        let newest = self.samples.back()?;

        if render_ms <= oldest.time_ms {
            return Some(Self::at(oldest, SmoothMode::Anchored));
        }

        if render_ms < newest.time_ms {
            let (a, b) = self
                .samples
                .iter()
                .zip(self.samples.iter().skip(1))
                .find(|(a, b)| a.time_ms <= render_ms && render_ms < b.time_ms)?;
            let alpha = (render_ms - a.time_ms) as f32 / (b.time_ms - a.time_ms) as f32;
            return Some(Smoothed {
                x: a.x + (b.x - a.x) * alpha,
                y: a.y + (b.y - a.y) * alpha,
                direction: b.direction,
                moving: a.moving || b.moving,
                mode: SmoothMode::Interpolated,
            });
        }

        let elapsed = render_ms - newest.time_ms;
        if elapsed == 0 {
            return Some(Self::at(newest, SmoothMode::Interpolated));
        }
        if elapsed <= window_ms && newest.moving {
            let t = elapsed as f32;
            return Some(Smoothed {
                x: newest.x + self.velocity.0 * t,
                y: newest.y + self.velocity.1 * t,
                direction: newest.direction,
                moving: true,
                mode: SmoothMode::Extrapolated,
            });
        }
        if elapsed <= window_ms {
            return Some(Self::at(newest, SmoothMode::Extrapolated));
        }
        Some(Smoothed {
            moving: false,
            ..Self::at(newest, SmoothMode::Frozen)
        })
    }

    fn at(sample: &Sample, mode: SmoothMode) -> Smoothed {
        Smoothed {
            x: sample.x,
            y: sample.y,
            direction: sample.direction,
            moving: sample.moving,
            mode,
        }
    }

    /// Drops samples that can no longer bracket `render_ms`, keeping one anchor at
    /// or before it
    fn prune(&mut self, render_ms: u64) {
        while self.samples.len() >= 2 && self.samples[1].time_ms <= render_ms {
            self.samples.pop_front();
        }
    }
}

/// Per-entity sample buffers rendered at a point slightly in the past.
pub struct RemoteSmoother {
    tracks: HashMap<u32, Track>,
    capacity: usize,
    dead_reckoning_ms: u64,
}

impl RemoteSmoother {
    pub fn new(capacity: usize, dead_reckoning_ms: u64) -> Self {
        Self {
            tracks: HashMap::new(),
            capacity: capacity.max(2),
            dead_reckoning_ms,
        }
    }

    /// Buffers a sample. Samples not newer than the entity's latest are ignored.
    pub fn push(&mut self, id: u32, sample: Sample) -> bool {
        self.tracks
            .entry(id)
            .or_default()
            .push(sample, self.capacity)
    }

    pub fn sample(&self, id: u32, render_ms: u64) -> Option<Smoothed> {
        self.tracks.get(&id)?.sample(render_ms, self.dead_reckoning_ms)
    }

    pub fn prune(&mut self, render_ms: u64) {
        for track in self.tracks.values_mut() {
            track.prune(render_ms);
        }
    }

    pub fn velocity(&self, id: u32) -> Option<(f32, f32)> {
        self.tracks.get(&id).map(|t| t.velocity)
    }

    pub fn buffered(&self, id: u32) -> usize {
        self.tracks.get(&id).map_or(0, |t| t.samples.len())
    }

    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(u32) -> bool,
    {
        self.tracks.retain(|id, _| keep(*id));
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }
}
