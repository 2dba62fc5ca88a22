//! Session time estimated from transport commit timestamps.
//!
//! Each notification carries the commit time of its entries on the
//! transport's clock. The newest one plus an assumed delivery latency is
//! taken as "now" on that clock, and the difference to the local clock
//! becomes the offset:
//!
//! ```text
//! offset = max(timestamp) + assumed_latency - local_now
//! now()  = local_now + offset
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::transport::AddedEntry;

/// Source of local wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as i64)
    }
}

/// Hand-driven clock for simulations and tests. Clones share one time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub struct ClockSync {
    clock: Arc<dyn Clock>,
    assumed_latency_ms: i64,
    offset_ms: i64,
}

impl ClockSync {
    pub fn new(clock: Arc<dyn Clock>, assumed_latency_ms: i64) -> Self {
        Self {
            clock,
            assumed_latency_ms,
            offset_ms: 0,
        }
    }

    /// Recompute the offset from the newest entry in a notification.
    /// Without entries the offset is left as it was.
    pub fn observe<'a, I>(&mut self, added: I)
    where
        I: IntoIterator<Item = &'a AddedEntry>,
    {
        let Some(latest) = added.into_iter().map(|e| e.timestamp).max() else {
            return;
        };
        let offset = latest
            .checked_add(self.assumed_latency_ms)
            .and_then(|reference| reference.checked_sub(self.clock.now_ms()));
        match offset {
            Some(offset) => {
                self.offset_ms = offset;
                log::trace!("Clock offset now {offset}ms");
            }
            None => log::warn!("Ignoring out-of-range timestamp {latest}"),
        }
    }

    /// Estimated session time in milliseconds.
    pub fn now(&self) -> i64 {
        self.clock.now_ms().saturating_add(self.offset_ms)
    }

    /// Current offset from the local clock in milliseconds.
    pub fn offset(&self) -> i64 {
        self.offset_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: i64 = 1_700_000_000_000;

    #[test]
    fn test_offset_from_single_entry() {
        let clock = ManualClock::new(T + 200);
        let mut sync = ClockSync::new(Arc::new(clock.clone()), 50);

        sync.observe(&[AddedEntry::new("a/x", "v", T)]);
        assert_eq!(sync.offset(), -150);
        assert_eq!(sync.now(), T + 200 - 150);

        clock.advance(1_000);
        assert_eq!(sync.now(), T + 1_200 - 150);
    }

    #[test]
    fn test_uses_newest_timestamp() {
        let clock = ManualClock::new(T);
        let mut sync = ClockSync::new(Arc::new(clock), 50);
        sync.observe(&[
            AddedEntry::new("a/x", "v", T - 500),
            AddedEntry::new("a/y", "v", T + 300),
            AddedEntry::new("a/z", "v", T - 10),
        ]);
        assert_eq!(sync.offset(), 350);
    }

    #[test]
    fn test_empty_batch_keeps_offset() {
        let clock = ManualClock::new(T + 200);
        let mut sync = ClockSync::new(Arc::new(clock), 50);
        sync.observe(&[AddedEntry::new("a/x", "v", T)]);
        sync.observe(&[]);
        assert_eq!(sync.offset(), -150);
    }

    #[test]
    fn test_extreme_timestamps_keep_previous_offset() {
        let clock = ManualClock::new(T + 200);
        let mut sync = ClockSync::new(Arc::new(clock.clone()), 50);
        sync.observe(&[AddedEntry::new("a/x", "v", T)]);

        sync.observe(&[AddedEntry::new("a/x", "v", i64::MAX)]);
        assert_eq!(sync.offset(), -150);

        clock.set(i64::MIN);
        sync.observe(&[AddedEntry::new("a/x", "v", T)]);
        assert_eq!(sync.offset(), -150);
        assert_eq!(sync.now(), i64::MIN);
    }

    #[test]
    fn test_manual_clock_set_moves_now() {
        let clock = ManualClock::new(T);
        let mut sync = ClockSync::new(Arc::new(clock.clone()), 50);
        sync.observe(&[AddedEntry::new("a/x", "v", T)]);
        assert_eq!(sync.now(), T + 50);

        clock.set(T + 10_000);
        assert_eq!(sync.now(), T + 10_050);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_ms() > 1_577_836_800_000);
    }
}
