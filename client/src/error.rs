use shared::ProtocolError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("server refused: {0}")]
    Rejected(String),
    #[error("no answer from server within {0:?}")]
    Timeout(Duration),
    #[error("no reconnection token; join a room first")]
    NoToken,
    #[error("connection closed")]
    Closed,
    #[error("renderer failed: {0}")]
    Render(String),
}
