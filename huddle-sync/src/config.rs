//! Engine tuning knobs.
//!
//! The transport's real limits are rarely documented, so every size and
//! latency constant lives here instead of being baked into the algorithms.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Size accounting used to decide whether a delta fits the transport.
///
/// A delta costs `delta_overhead`, plus `len(key) + len(value) +
/// entry_overhead` per update and `len(key) + entry_overhead` per remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaLimits {
    /// Upper bound for a single submission.
    pub max_delta_size: usize,
    /// Fixed cost of any delta.
    pub delta_overhead: usize,
    /// Fixed cost of every entry in a delta.
    pub entry_overhead: usize,
}

impl DeltaLimits {
    /// Computed cost of one update entry.
    pub fn update_cost(&self, key: &str, value: &str) -> usize {
        key.len() + value.len() + self.entry_overhead
    }

    /// Computed cost of one remove entry.
    pub fn remove_cost(&self, key: &str) -> usize {
        key.len() + self.entry_overhead
    }

    /// Room left for entries in an otherwise empty delta.
    pub fn entry_budget(&self) -> usize {
        self.max_delta_size.saturating_sub(self.delta_overhead)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of characters stored in one chunk entry.
    pub max_part_size: usize,
    /// Maximum computed size of one transport submission.
    pub max_delta_size: usize,
    /// Fixed per-delta cost used by the batcher.
    pub delta_overhead: usize,
    /// Fixed per-entry cost used by the batcher.
    pub entry_overhead: usize,
    /// Assumed one-way latency between commit and local delivery (ms).
    pub assumed_latency_ms: i64,
    /// How long an echo marker may wait for its notification.
    #[serde(with = "duration_ms")]
    pub echo_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_part_size: 8192,
            max_delta_size: 10_000,
            delta_overhead: 500,
            entry_overhead: 100,
            assumed_latency_ms: 50,
            echo_ttl: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Config for testing (tiny limits so chunking and batching kick in
    /// with short values).
    pub fn for_testing() -> Self {
        Self {
            max_part_size: 16,
            max_delta_size: 400,
            delta_overhead: 50,
            entry_overhead: 10,
            assumed_latency_ms: 50,
            echo_ttl: Duration::from_millis(500),
        }
    }

    /// Limits handed to the batcher.
    pub fn limits(&self) -> DeltaLimits {
        DeltaLimits {
            max_delta_size: self.max_delta_size,
            delta_overhead: self.delta_overhead,
            entry_overhead: self.entry_overhead,
        }
    }

    /// Reject configurations in which a full chunk entry can never fit
    /// into a delta on its own.
    ///
    /// Chunk keys carry the logical key, a 64-char version tag and a part
    /// index, so the check reserves `key_headroom` bytes for them.
    pub fn validate(&self, key_headroom: usize) -> Result<(), SyncError> {
        if self.max_part_size == 0 {
            return Err(SyncError::InvalidConfig("max_part_size must be positive".into()));
        }
        let needed = self.delta_overhead + self.entry_overhead + key_headroom + self.max_part_size;
        if needed > self.max_delta_size {
            return Err(SyncError::InvalidConfig(format!(
                "a {}-char part needs {needed} bytes but max_delta_size is {}",
                self.max_part_size, self.max_delta_size
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
