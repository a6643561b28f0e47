use thiserror::Error;

/// Crate-level error type.
///
/// These are failures of the *server process*, not protocol-level
/// command failures — a malformed or rejected XCP command produces an
/// `ERR` response (see [`crate::protocol::ErrorCode`]), not an
/// `XcpError`.
#[derive(Error, Debug)]
pub enum XcpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("xcp already initialized")]
    AlreadyInitialized,

    #[error("xcp not initialized")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("descriptor arena exhausted")]
    ArenaOverflow,

    #[error("event id {0} out of range")]
    InvalidEvent(u16),

    #[error("calibration segment {0} not found")]
    UnknownCalSeg(&'static str),

    #[error("transport already running")]
    TransportRunning,
}

pub type Result<T> = std::result::Result<T, XcpError>;
