//! Error types and handling for BitChat

use thiserror::Error;

/// Result type alias for BitChat operations
pub type Result<T> = std::result::Result<T, Error>;

/// BitChat error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Size limit exceeded: {0}")]
    SizeExceeded(String),

    #[error("Compression failure: {0}")]
    CompressionFailure(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Unverified peer: {0}")]
    Unverified(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No established session with peer {0}")]
    NotEstablished(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Session exhausted: {0}")]
    SessionExhausted(String),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Handshake timed out with peer {0}")]
    HandshakeTimeout(String),

    #[error("Fragment group timed out: {0}")]
    FragmentTimeout(String),

    #[error("Link failure: {0}")]
    LinkFailure(String),

    #[error("Permission missing: {0}")]
    PermissionMissing(String),

    #[error("Radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not initialized")]
    NotInitialized,

    #[error("Not started")]
    NotStarted,

    #[error("Missing payload")]
    MissingPayload,

    #[error("Missing peer ID")]
    MissingPeerId,

    #[error("Cryptographic error: {0}")]
    Crypto(String),

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Storage(format!("JSON error: {}", err))
    }
}
