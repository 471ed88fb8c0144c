use std::time::Duration;

/// Client feel constants. None of these change simulation results; they only decide
/// how the client hides latency.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    /// Corrections smaller than this many pixels are eased in, larger ones snap
    pub correction_threshold: f32,
    /// Fraction of the remaining visual offset removed per frame
    pub correction_ease: f32,
    /// Most recent inputs resent with every input packet
    pub input_batch: usize,
    /// Unacknowledged inputs kept for replay
    pub input_ring: usize,
    pub min_lead_frames: u32,
    pub max_lead_frames: u32,
    pub min_interp_delay_ms: u64,
    pub max_interp_delay_ms: u64,
    /// How long a remote entity is extrapolated past its newest sample
    pub dead_reckoning_ms: u64,
    /// Samples buffered per remote entity
    pub smoother_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Round-trip samples kept for the latency readout
    pub latency_samples: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            correction_threshold: 16.0,
            correction_ease: 0.2,
            input_batch: 5,
            input_ring: 120,
            min_lead_frames: 2,
            max_lead_frames: 10,
            min_interp_delay_ms: 50,
            max_interp_delay_ms: 250,
            dead_reckoning_ms: 250,
            smoother_capacity: 32,
            heartbeat_interval: Duration::from_secs(1),
            latency_samples: 100,
        }
    }
}
