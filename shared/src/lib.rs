//! # Shared arena core
//!
//! Everything the server and its clients must agree on bit-for-bit:
//!
//! - **Rules**: [`GameConfig`], the single immutable set of constants
//! - **SimulationCore**: [`Map`], [`Player`], [`Bomb`], [`Explosion`] and the
//!   frame-stepped [`Simulation`]
//! - **Input**: [`Input`] records and the [`InputProvider`] contract shared by humans
//!   and bots ([`WanderBot`])
//! - **Wire**: the [`Packet`] enum, length-prefixed [`framing`] and the ordered,
//!   lossy [`datagram`] session
//!
//! The simulation never reads a clock and only uses randomness while generating the
//! map, so the same seed and the same per-frame inputs always yield the same world.

pub mod bot;
pub mod config;
pub mod datagram;
pub mod entity;
pub mod error;
pub mod framing;
pub mod input;
pub mod map;
pub mod protocol;
pub mod simulation;

pub use bot::WanderBot;
pub use config::GameConfig;
pub use entity::{Bomb, Direction, Explosion, Player};
pub use error::ProtocolError;
pub use input::{FrameInput, Input, InputProvider, WorldView};
pub use map::{Map, TileChange, TileType};
pub use protocol::{GameEvent, Packet, Phase, RoomAction, RoomInfo, Snapshot};
pub use simulation::{RoundOutcome, Simulation};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
