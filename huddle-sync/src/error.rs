use thiserror::Error;

use crate::transport::TransportError;

/// Errors reported synchronously to callers of the engine.
///
/// Incomplete chunk sets are not errors: reads simply return `None`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Entry '{key}' needs {size} bytes but a delta holds at most {limit}")]
    OversizedEntry { key: String, size: usize, limit: usize },

    #[error("Malformed key '{key}': {reason}")]
    MalformedKey { key: String, reason: &'static str },

    #[error("Transport rejected delta: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type SyncResult<T> = Result<T, SyncError>;
