//! # Arena Server Library
//!
//! The authoritative side of the arena. The server owns the canonical world of every
//! room, consumes client inputs by frame number and streams snapshots back so clients
//! can reconcile their predictions.
//!
//! ## Layout
//!
//! - [`network`]: TCP accept loop or UDP peer demultiplexing
//! - [`connection`]: per-connection read loop, writer and heartbeat
//! - [`session`]: the non-blocking send interface rooms use to reach a connection
//! - [`room_manager`]: room registry, matchmaking and idle-room reaping
//! - [`room`]: the single-owner room actor running the fixed-rate tick
//! - [`client_manager`]: the seat roster of a room, humans and bots alike
//! - [`input_buffer`]: per-seat input queue, fallback policy and acknowledgments
//! - [`game`]: the simulation wrapped with spawn rotation and tile history
//! - [`token`]: signed reconnection tokens
//!
//! ## Concurrency model
//!
//! Each room is one task. Connections never touch room state; they post events to
//! the room's mailbox and receive encoded frames through their session queue. A slow
//! or stalled peer therefore only ever fills its own queue.

pub mod client_manager;
pub mod config;
pub mod connection;
pub mod error;
pub mod game;
pub mod input_buffer;
pub mod network;
pub mod room;
pub mod room_manager;
pub mod session;
pub mod token;

pub use config::ServerConfig;
pub use error::{RoomError, SessionError, TokenError};
pub use network::{Server, ShutdownTrigger, Transport};
pub use room_manager::RoomManager;
pub use token::{SessionTokenService, TokenClaims};
