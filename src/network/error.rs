//! Network error types

use std::sync::Arc;

use thiserror::Error;

/// Key ring configuration failures.
///
/// These indicate a caller bug (wrong key length, sealing with a key id that
/// was never installed) rather than a network condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },

    #[error("Unknown key id {0}")]
    UnknownKeyId(u8),

    #[error("Nonce counter exhausted for key {key_id} ssrc {ssrc}; rotate the key")]
    CounterExhausted { key_id: u8, ssrc: u32 },

    #[error("Encryption failed")]
    Encryption,
}

/// Errors that can occur in the network subsystem
///
/// Cloneable so a single connect failure can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Session closed")]
    SessionClosed,

    #[error("Disconnected before the handshake completed")]
    Cancelled,

    #[error("No {0} stream assigned by the server")]
    NoStream(&'static str),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        NetworkError::Json(Arc::new(err))
    }
}
