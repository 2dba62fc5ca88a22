//! Contract between the engine and the broadcast key-value store it runs on.
//!
//! The host owns the actual channel. It hands the engine a snapshot once at
//! startup, accepts size-bounded deltas, and feeds every change notification
//! (including the echo of this participant's own writes) back through
//! [`SyncEngine::on_notification`](crate::engine::SyncEngine::on_notification).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::Delta;

/// A transport-level entry added by some participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddedEntry {
    pub key: String,
    pub value: String,
    /// Commit time assigned by the transport (ms since the Unix epoch).
    pub timestamp: i64,
}

impl AddedEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>, timestamp: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            timestamp,
        }
    }
}

/// One change notification as delivered by the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub added: Vec<AddedEntry>,
    pub removed: Vec<String>,
}

impl Notification {
    pub fn new(added: Vec<AddedEntry>, removed: Vec<String>) -> Self {
        Self { added, removed }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Number of transport entries carried.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len()
    }
}

/// Synchronous submission failures.
///
/// Asynchronous delivery loss is invisible at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Delta of {size} bytes exceeds transport limit of {limit}")]
    DeltaTooLarge { size: usize, limit: usize },

    #[error("Transport is closed")]
    Closed,

    #[error("Transport failure: {0}")]
    Other(String),
}

/// The environment the engine synchronizes through.
pub trait Transport {
    /// Full current document, read once when the engine starts.
    fn snapshot(&self) -> BTreeMap<String, String>;

    /// Fire-and-forget submission of one delta.
    fn submit(&self, delta: &Delta) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn snapshot(&self) -> BTreeMap<String, String> {
        (**self).snapshot()
    }

    fn submit(&self, delta: &Delta) -> Result<(), TransportError> {
        (**self).submit(delta)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn snapshot(&self) -> BTreeMap<String, String> {
        (**self).snapshot()
    }

    fn submit(&self, delta: &Delta) -> Result<(), TransportError> {
        (**self).submit(delta)
    }
}
