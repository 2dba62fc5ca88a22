//! Binary frames carried on the hub broadcast channel.
//!
//! Wire format (bincode, standard config):
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ variant │ payload                                      │
//! │ varint  │ Notification { added: [(key, value, ts)],    │
//! │         │                removed: [key] } | (empty)    │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Frames are encoded once by the hub and shared by every subscriber.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Notification;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubFrame {
    /// One committed delta, as seen by every participant.
    Notification(Notification),
    /// The hub stopped accepting deltas; no further frames follow.
    Shutdown,
}

impl HubFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
