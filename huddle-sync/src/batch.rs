//! Delta batching: packing transport-level entries into bounded submissions.
//!
//! ```text
//! updates: u1 u2 u3 u4 u5      removes: r1 r2 r3
//!          └──┬──┘ └─┬─┘                └─┬─┘ └┬┘
//! deltas:  [u1 u2 u3] [u4 u5 r1 r2] [r3]
//! ```
//! Greedy fill in input order, updates before removes. Later deltas may remove
//! keys written by earlier ones, so the output order is the submission order.

use serde::{Deserialize, Serialize};

use crate::chunk::{chunk_key, VersionTag};
use crate::config::DeltaLimits;
use crate::error::{SyncError, SyncResult};

/// One transport submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Key/value writes, applied in order.
    pub updates: Vec<(String, String)>,
    /// Keys to delete.
    pub removes: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.removes.is_empty()
    }

    /// Number of entries carried.
    pub fn len(&self) -> usize {
        self.updates.len() + self.removes.len()
    }

    /// Computed transport size under `limits`.
    pub fn size(&self, limits: &DeltaLimits) -> usize {
        let updates: usize = self
            .updates
            .iter()
            .map(|(k, v)| limits.update_cost(k, v))
            .sum();
        let removes: usize = self.removes.iter().map(|k| limits.remove_cost(k)).sum();
        limits.delta_overhead + updates + removes
    }

    /// Every key this delta touches, updates first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.updates
            .iter()
            .map(|(k, _)| k.as_str())
            .chain(self.removes.iter().map(String::as_str))
    }
}

/// Accumulates entries into deltas while tracking the running size.
struct Packer<'a> {
    limits: &'a DeltaLimits,
    deltas: Vec<Delta>,
    current: Delta,
    current_size: usize,
}

impl<'a> Packer<'a> {
    fn new(limits: &'a DeltaLimits) -> Self {
        Self {
            limits,
            deltas: Vec::new(),
            current: Delta::default(),
            current_size: limits.delta_overhead,
        }
    }

    /// Make room for an entry of `cost`, starting a new delta if needed.
    fn reserve(&mut self, key: &str, cost: usize) -> SyncResult<()> {
        if self.limits.delta_overhead + cost > self.limits.max_delta_size {
            return Err(SyncError::OversizedEntry {
                key: key.to_string(),
                size: self.limits.delta_overhead + cost,
                limit: self.limits.max_delta_size,
            });
        }
        if self.current_size + cost > self.limits.max_delta_size {
            let full = std::mem::take(&mut self.current);
            self.deltas.push(full);
            self.current_size = self.limits.delta_overhead;
        }
        self.current_size += cost;
        Ok(())
    }

    fn push_update(&mut self, key: String, value: String) -> SyncResult<()> {
        let cost = self.limits.update_cost(&key, &value);
        self.reserve(&key, cost)?;
        self.current.updates.push((key, value));
        Ok(())
    }

    fn push_remove(&mut self, key: String) -> SyncResult<()> {
        let cost = self.limits.remove_cost(&key);
        self.reserve(&key, cost)?;
        self.current.removes.push(key);
        Ok(())
    }

    fn finish(mut self) -> Vec<Delta> {
        if !self.current.is_empty() {
            self.deltas.push(self.current);
        }
        self.deltas
    }
}

/// Group `updates` and `removes` into deltas no larger than
/// `limits.max_delta_size`.
///
/// Fails with [`SyncError::OversizedEntry`] if a single entry cannot fit even
/// in an empty delta. No input yields no deltas.
pub fn batch(
    updates: Vec<(String, String)>,
    removes: Vec<String>,
    limits: &DeltaLimits,
) -> SyncResult<Vec<Delta>> {
    let mut packer = Packer::new(limits);
    for (key, value) in updates {
        packer.push_update(key, value)?;
    }
    for key in removes {
        packer.push_remove(key)?;
    }
    Ok(packer.finish())
}

/// Largest part size for which a delta holding a single chunk entry of `key`
/// still fits. Zero when the key alone is too long.
pub fn max_part_size_for(key: &str, limits: &DeltaLimits) -> usize {
    let widest = chunk_key(key, &VersionTag::of(""), 999_999);
    limits
        .entry_budget()
        .saturating_sub(limits.update_cost(&widest, ""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeltaLimits {
        DeltaLimits {
            max_delta_size: 100,
            delta_overhead: 10,
            entry_overhead: 5,
        }
    }

    fn entry(key: &str, len: usize) -> (String, String) {
        (key.to_string(), "v".repeat(len))
    }

    #[test]
    fn test_empty_input_yields_no_deltas() {
        assert!(batch(Vec::new(), Vec::new(), &limits()).unwrap().is_empty());
    }

    #[test]
    fn test_single_delta_when_everything_fits() {
        let deltas = batch(
            vec![entry("a", 10), entry("b", 10)],
            vec!["c".into()],
            &limits(),
        )
        .unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].len(), 3);
        assert_eq!(deltas[0].size(&limits()), 10 + 16 + 16 + 6);
    }

    #[test]
    fn test_overflow_starts_new_delta() {
        // each update costs 1 + 40 + 5 = 46 and two would need 10 + 92
        let deltas = batch(
            vec![entry("a", 40), entry("b", 40), entry("c", 40)],
            Vec::new(),
            &limits(),
        )
        .unwrap();
        assert_eq!(deltas.len(), 3);
        for delta in &deltas {
            assert!(delta.size(&limits()) <= 100);
        }
    }

    #[test]
    fn test_removes_follow_updates_and_continue() {
        let removes: Vec<String> = (0..20).map(|i| format!("key{i:02}")).collect();
        let deltas = batch(vec![entry("a", 60)], removes.clone(), &limits()).unwrap();

        assert_eq!(deltas[0].updates.len(), 1);
        let flattened: Vec<String> = deltas.iter().flat_map(|d| d.removes.clone()).collect();
        assert_eq!(flattened, removes);
        for delta in &deltas {
            assert!(delta.size(&limits()) <= 100);
        }
    }

    #[test]
    fn test_oversized_entry_is_rejected() {
        let err = batch(vec![entry("a", 90)], Vec::new(), &limits()).unwrap_err();
        match err {
            SyncError::OversizedEntry { key, size, limit } => {
                assert_eq!(key, "a");
                assert_eq!(size, 106);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_entry_exactly_at_limit_fits() {
        // 10 + 1 + 84 + 5 = 100
        let deltas = batch(vec![entry("a", 84)], Vec::new(), &limits()).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].size(&limits()), 100);
    }

    #[test]
    fn test_delta_keys_order() {
        let delta = Delta {
            updates: vec![entry("u1", 1), entry("u2", 1)],
            removes: vec!["r1".into()],
        };
        let keys: Vec<&str> = delta.keys().collect();
        assert_eq!(keys, vec!["u1", "u2", "r1"]);
    }

    #[test]
    fn test_max_part_size_for_leaves_room_for_chunk_key() {
        let limits = DeltaLimits {
            max_delta_size: 10_000,
            delta_overhead: 500,
            entry_overhead: 100,
        };
        let part = max_part_size_for("a/photo", &limits);
        let widest = chunk_key("a/photo", &VersionTag::of(""), 999_999);
        assert_eq!(part, 10_000 - 500 - 100 - widest.len());

        let deltas = batch(vec![(widest, "x".repeat(part))], Vec::new(), &limits).unwrap();
        assert_eq!(deltas[0].size(&limits), 10_000);
    }

    #[test]
    fn test_max_part_size_for_huge_key_is_zero() {
        let key = "k".repeat(200);
        assert_eq!(max_part_size_for(&key, &limits()), 0);
    }
}
