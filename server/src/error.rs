use shared::ProtocolError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature does not match")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("outbound queue full, frame dropped")]
    QueueFull,
    #[error("peer has not drained its queue for {0:?}")]
    Backpressure(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Reasons a room refuses a request. The `Display` text is sent to the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("room is full")]
    Full,
    #[error("round is ending, try again shortly")]
    Ending,
    #[error("room is closed")]
    Closed,
    #[error("player {0} is not in this room")]
    UnknownPlayer(u32),
    #[error("player {0} is already connected")]
    AlreadySeated(u32),
    #[error("token was not issued by room {0}")]
    WrongRoom(String),
    #[error("{0}")]
    Token(#[from] TokenError),
}
