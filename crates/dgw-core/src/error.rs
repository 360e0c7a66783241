use thiserror::Error;

/// Errors produced by the gateway protocol layer.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The frame was well-formed but its type byte is outside the known set.
    /// The full frame has been consumed, so the stream remains aligned and
    /// the connection may keep reading.
    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("session closed")]
    SessionClosed,

    #[error("device offline: {0}")]
    DeviceOffline(String),

    #[error("ack timeout for command {0}")]
    AckTimeout(String),

    #[error("ack wait cancelled for command {0}")]
    AckCancelled(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Codec(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
