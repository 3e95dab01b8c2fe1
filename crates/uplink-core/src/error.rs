use thiserror::Error;

/// Errors produced by the uplink protocol and agent layers.
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid pattern: {0}")]
    Validation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session expired")]
    SessionExpired,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for UplinkError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        UplinkError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for UplinkError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        UplinkError::Codec(e.to_string())
    }
}

pub type UplinkResult<T> = Result<T, UplinkError>;
