//! Echo suppression for self-originated writes.
//!
//! The transport broadcasts every delta to all participants, the sender
//! included. Each transport key this participant writes or removes is marked
//! here before submission; when the notification for that key comes back the
//! marker is consumed and the entry is skipped instead of being treated as a
//! change made by someone else.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EchoKind {
    Update,
    Removal,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    /// Outstanding notifications for this key.
    count: usize,
    /// Time of the most recent mark.
    marked_at: Instant,
}

#[derive(Debug, Default)]
pub struct EchoTracker {
    updates: HashMap<String, Pending>,
    removals: HashMap<String, Pending>,
}

impl EchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expect one update notification for `key`.
    pub fn mark_pending(&mut self, key: &str) {
        Self::mark(&mut self.updates, key);
    }

    /// Expect one removal notification for `key`.
    pub fn mark_pending_removal(&mut self, key: &str) {
        Self::mark(&mut self.removals, key);
    }

    /// Consume one marker for `key`. Returns `true` if the entry originated
    /// here and must not be processed as an external change.
    pub fn consume_if_pending(&mut self, key: &str, kind: EchoKind) -> bool {
        let map = match kind {
            EchoKind::Update => &mut self.updates,
            EchoKind::Removal => &mut self.removals,
        };
        let Some(pending) = map.get_mut(key) else {
            return false;
        };
        pending.count -= 1;
        if pending.count == 0 {
            map.remove(key);
        }
        true
    }

    /// Whether a marker of `kind` is outstanding for `key`.
    pub fn is_pending(&self, key: &str, kind: EchoKind) -> bool {
        match kind {
            EchoKind::Update => self.updates.contains_key(key),
            EchoKind::Removal => self.removals.contains_key(key),
        }
    }

    /// Drop markers that have waited at least `ttl` for their echo.
    /// Returns the number of keys dropped.
    pub fn expire(&mut self, ttl: Duration) -> usize {
        let before = self.pending_len();
        self.updates.retain(|_, p| p.marked_at.elapsed() < ttl);
        self.removals.retain(|_, p| p.marked_at.elapsed() < ttl);
        before - self.pending_len()
    }

    /// Number of keys with outstanding markers.
    pub fn pending_len(&self) -> usize {
        self.updates.len() + self.removals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_len() == 0
    }

    fn mark(map: &mut HashMap<String, Pending>, key: &str) {
        let now = Instant::now();
        map.entry(key.to_string())
            .and_modify(|p| {
                p.count += 1;
                p.marked_at = now;
            })
            .or_insert(Pending {
                count: 1,
                marked_at: now,
            });
    }
}
