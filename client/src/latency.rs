//! Round-trip tracking and the adaptive timing derived from it

use crate::config::ClientConfig;
use std::collections::VecDeque;

/// Weight of a new round-trip sample in the smoothed estimate
const RTT_GAIN: f32 = 0.125;
/// Weight of a new deviation sample in the jitter estimate
const JITTER_GAIN: f32 = 0.25;
const OFFSET_GAIN: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttSample {
    pub rtt_ms: f32,
    pub at_ms: u64,
}

/// Measures round-trip time and jitter from heartbeat replies, estimates the
/// server's clock, and turns both into a prediction lead and an interpolation delay.
///
/// Higher latency means a larger lead and a larger delay, both kept within the
/// configured floors and ceilings.
pub struct LatencyTracker {
    history: VecDeque<RttSample>,
    max_samples: usize,
    srtt: Option<f32>,
    jitter: f32,
    /// Estimated server clock minus local clock
    clock_offset: Option<f64>,
    peak_rtt: f32,

    min_lead: u32,
    max_lead: u32,
    min_delay_ms: u64,
    max_delay_ms: u64,
}

impl LatencyTracker {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            history: VecDeque::new(),
            max_samples: config.latency_samples.max(1),
            srtt: None,
            jitter: 0.0,
            clock_offset: None,
            peak_rtt: 0.0,
            min_lead: config.min_lead_frames,
            max_lead: config.max_lead_frames.max(config.min_lead_frames),
            min_delay_ms: config.min_interp_delay_ms,
            max_delay_ms: config.max_interp_delay_ms.max(config.min_interp_delay_ms),
        }
    }

    /// Records a heartbeat reply. `echo_ms` is our own send time echoed back,
    /// `peer_time_ms` the server clock when it answered.
    pub fn record_pong(&mut self, echo_ms: u64, peer_time_ms: u64, now_ms: u64) {
        let rtt = now_ms.saturating_sub(echo_ms) as f32;

        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.jitter = rtt / 2.0;
            }
            Some(srtt) => {
                self.jitter += JITTER_GAIN * ((rtt - srtt).abs() - self.jitter);
                self.srtt = Some(srtt + RTT_GAIN * (rtt - srtt));
            }
        }

        // The server answered roughly half a round trip ago
        let offset = peer_time_ms as f64 + rtt as f64 / 2.0 - now_ms as f64;
        self.clock_offset = Some(match self.clock_offset {
            None => offset,
            Some(previous) => previous + OFFSET_GAIN * (offset - previous),
        });

        self.history.push_back(RttSample {
            rtt_ms: rtt,
            at_ms: now_ms,
        });
        while self.history.len() > self.max_samples {
            self.history.pop_front();
        }
        self.peak_rtt = self.history.iter().map(|s| s.rtt_ms).fold(0.0f32, f32::max);
    }

    /// Seeds the clock estimate from a snapshot until the first heartbeat reply
    pub fn observe_server_time(&mut self, server_time_ms: u64, now_ms: u64) {
        if self.clock_offset.is_none() {
            self.clock_offset = Some(server_time_ms as f64 - now_ms as f64);
        }
    }

    pub fn rtt_ms(&self) -> f32 {
        self.srtt.unwrap_or(0.0)
    }

    pub fn jitter_ms(&self) -> f32 {
        self.jitter
    }

    pub fn peak_rtt_ms(&self) -> f32 {
        self.peak_rtt
    }

    pub fn samples(&self) -> impl Iterator<Item = &RttSample> {
        self.history.iter()
    }

    pub fn server_now_ms(&self, now_ms: u64) -> u64 {
        let offset = self.clock_offset.unwrap_or(0.0);
        (now_ms as f64 + offset).max(0.0) as u64
    }

    /// Frames to run ahead of the server's current frame so inputs arrive in time
    pub fn lead_frames(&self, frame_ms: f64) -> u32 {
        let one_way = self.rtt_ms() as f64 / 2.0 + self.jitter as f64;
        let frames = (one_way / frame_ms.max(1.0)).ceil() as u32 + 1;
        frames.clamp(self.min_lead, self.max_lead)
    }

    /// How far behind the estimated server time remote players are drawn
    pub fn interpolation_delay_ms(&self) -> u64 {
        let delay = (self.rtt_ms() / 2.0 + 2.0 * self.jitter).round() as u64;
        delay.clamp(self.min_delay_ms, self.max_delay_ms)
    }
}
