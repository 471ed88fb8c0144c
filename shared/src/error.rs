use thiserror::Error;

/// Failures of the wire layer. Any of these closes the connection that produced it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
