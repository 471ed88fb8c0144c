//! # Arena client library
//!
//! Everything a player's process needs to stay responsive against an authoritative
//! server that is a round trip away.
//!
//! ## Pipeline
//!
//! Each local frame the client:
//!
//! 1. Drains the [`network::Inbox`]: events in order, then the newest snapshot only
//! 2. Rebases the predicted player on the snapshot and replays unacknowledged inputs
//!    ([`reconciliation`])
//! 3. Stamps the current input for a frame slightly ahead of the server's and applies
//!    it locally ([`input`], [`prediction`])
//! 4. Sends the newest inputs as one batch
//! 5. Builds a [`game::RenderView`] with remote players drawn a little in the past
//!    ([`smoothing`]) and hands it to a [`rendering::Renderer`]
//!
//! How far ahead inputs are aimed and how far behind remote players are drawn both
//! follow the measured round trip ([`latency`]).
//!
//! ## Prediction scope
//!
//! Only the local player's movement is predicted. Bombs, blasts, tiles and deaths
//! appear when the server says so.

pub mod config;
pub mod error;
pub mod game;
pub mod input;
pub mod latency;
pub mod network;
pub mod prediction;
pub mod reconciliation;
pub mod rendering;
pub mod smoothing;

pub use config::ClientConfig;
pub use error::ClientError;
pub use game::ClientGameState;
pub use network::{Client, Transport};
