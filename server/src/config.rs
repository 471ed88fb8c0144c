use crate::input_buffer::FallbackPolicy;
use shared::GameConfig;
use std::time::Duration;

/// Server-side knobs layered on top of the shared game rules.
///
/// Built once in `main` and cloned into every room and connection.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub game: GameConfig,
    /// Seats per room, bots included
    pub room_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Silence longer than `heartbeat_interval * heartbeat_misses` closes a connection
    pub heartbeat_misses: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Outbound frames buffered per connection
    pub outbound_queue: usize,
    /// How long a connection may stay saturated before it is considered dead
    pub backpressure_grace: Duration,
    /// How long a disconnected player's seat is held for a reconnect
    pub reconnect_grace: Duration,
    /// Frames spent in Ending before the world resets
    pub ending_grace_frames: u32,
    pub reap_interval: Duration,
    /// Input frames kept behind and accepted ahead of the current frame
    pub input_lookback: u32,
    pub fallback: FallbackPolicy,
    pub token_ttl: Duration,
    pub token_secret: [u8; 32],
    /// Fill rooms with bots up to `ai_fill_target` seats when a round starts
    pub ai_fill: bool,
    pub ai_fill_target: usize,
    pub mailbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            game: GameConfig::default(),
            room_capacity: 4,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_misses: 3,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            outbound_queue: 256,
            backpressure_grace: Duration::from_secs(2),
            reconnect_grace: Duration::from_secs(30),
            ending_grace_frames: 180,
            reap_interval: Duration::from_secs(10),
            input_lookback: 120,
            fallback: FallbackPolicy::RepeatMovement,
            token_ttl: Duration::from_secs(600),
            token_secret: rand::random(),
            ai_fill: false,
            ai_fill_target: 2,
            mailbox_capacity: 1024,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_misses.max(1)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(self.game.frame_duration_ms() / 1000.0)
    }

    /// Derives the token key from an operator-supplied passphrase
    pub fn with_secret(mut self, passphrase: &str) -> Self {
        self.token_secret = blake3::derive_key("bomber-arena session token v1", passphrase.as_bytes());
        self
    }
}
