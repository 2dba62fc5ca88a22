//! The synchronization engine: one per participant.
//!
//! ```text
//!  write/remove                                 on_notification
//!       │                                              │
//!       ▼                                              ▼
//!  LocalMirror ──► batch ──► EchoTracker ──►   EchoTracker (drop own echo)
//!  (immediate)     (deltas)   (mark keys)              │
//!                                 │                    ▼
//!                                 ▼            LocalMirror::apply_external
//!                           Transport::submit          │
//!                                                      ▼
//!                                         ClockSync::observe ──► ExternalChange
//! ```
//!
//! All operations take `&mut self`; the engine is meant to be driven from a
//! single event queue (see [`crate::session`]).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::batch::{self, Delta};
use crate::chunk::CHUNK_KEY_HEADROOM;
use crate::clock::{Clock, ClockSync, SystemClock};
use crate::config::SyncConfig;
use crate::echo::{EchoKind, EchoTracker};
use crate::error::{SyncError, SyncResult};
use crate::key::{self, ParticipantId, ResourceKey, ResourceKind};
use crate::mirror::{LocalMirror, RawChange};
use crate::transport::{Notification, Transport};

/// Logical changes made by other participants, as seen by one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalChange {
    /// Keys that became readable or changed value, with their new value.
    pub added: BTreeMap<String, String>,
    /// Keys that are no longer present.
    pub removed: BTreeSet<String>,
}

impl ExternalChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Deserialize the new value of an added key.
    pub fn value_as<V: DeserializeOwned>(&self, key: &str) -> Option<SyncResult<V>> {
        self.added
            .get(key)
            .map(|raw| serde_json::from_str(raw).map_err(SyncError::from))
    }

    /// The subset of this change touching resources of `kind`.
    pub fn for_resource(&self, kind: ResourceKind) -> ExternalChange {
        let matches = |k: &str| ResourceKey::parse(k).is_some_and(|rk| rk.resource.kind() == kind);
        ExternalChange {
            added: self
                .added
                .iter()
                .filter(|(k, _)| matches(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            removed: self.removed.iter().filter(|k| matches(k.as_str())).cloned().collect(),
        }
    }
}

/// Counters for monitoring engine health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub deltas_submitted: u64,
    pub entries_submitted: u64,
    pub notifications_received: u64,
    pub echoes_suppressed: u64,
    pub echoes_expired: u64,
    pub changes_emitted: u64,
}

type ChangeHandler = Box<dyn FnMut(&ExternalChange) + Send>;

pub struct SyncEngine<T: Transport> {
    transport: T,
    config: SyncConfig,
    mirror: LocalMirror,
    echo: EchoTracker,
    clock: ClockSync,
    handlers: Vec<ChangeHandler>,
    stats: EngineStats,
}

impl<T: Transport> SyncEngine<T> {
    /// Start an engine on `transport`, seeding the mirror from its snapshot.
    pub fn new(transport: T, config: SyncConfig) -> SyncResult<Self> {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    /// Like [`SyncEngine::new`] with an explicit local clock.
    pub fn with_clock(transport: T, config: SyncConfig, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        config.validate(CHUNK_KEY_HEADROOM)?;
        let mirror = LocalMirror::from_snapshot(transport.snapshot());
        log::info!(
            "Sync engine started with {} raw entries ({} readable keys)",
            mirror.raw_len(),
            mirror.keys().len()
        );
        Ok(Self {
            clock: ClockSync::new(clock, config.assumed_latency_ms),
            transport,
            config,
            mirror,
            echo: EchoTracker::new(),
            handlers: Vec::new(),
            stats: EngineStats::default(),
        })
    }

    /// Serialize `value` as JSON and store it under `key`.
    pub fn write<V: Serialize + ?Sized>(&mut self, key: &str, value: &V) -> SyncResult<()> {
        let serialized = serde_json::to_string(value)?;
        self.write_raw(key, &serialized)
    }

    /// Store an already serialized value under `key`.
    ///
    /// The value is readable locally as soon as this returns; the deltas are
    /// submitted without waiting for the transport.
    pub fn write_raw(&mut self, key: &str, value: &str) -> SyncResult<()> {
        key::validate_key(key)?;
        let limits = self.config.limits();
        let part_size = self
            .config
            .max_part_size
            .min(batch::max_part_size_for(key, &limits));
        if part_size == 0 {
            return Err(SyncError::OversizedEntry {
                key: key.to_string(),
                size: limits.delta_overhead + limits.remove_cost(key) + CHUNK_KEY_HEADROOM,
                limit: limits.max_delta_size,
            });
        }

        let change = self.mirror.write(key, value, part_size);
        log::debug!(
            "Writing '{key}' ({} bytes, {} entries, {} stale)",
            value.len(),
            change.updates.len(),
            change.removes.len()
        );
        self.submit_change(change)
    }

    /// Remove `key` and all of its chunk entries. Removing an absent key is a
    /// no-op.
    ///
    /// Entries too large for any delta are rejected before the mirror is
    /// touched. If the transport then rejects a delta the key stays removed
    /// locally, as with [`SyncEngine::write_raw`].
    pub fn remove(&mut self, key: &str) -> SyncResult<()> {
        key::validate_key(key)?;
        let doomed = self.mirror.raw_keys_of(key);
        if doomed.is_empty() {
            return Ok(());
        }
        let deltas = batch::batch(Vec::new(), doomed, &self.config.limits())?;
        let removed = self.mirror.remove(key);
        log::debug!("Removing '{key}' ({} entries)", removed.removes.len());
        self.submit_deltas(&deltas)
    }

    /// Current value of `key`, or `None` when absent or still incomplete.
    pub fn read(&self, key: &str) -> Option<String> {
        self.mirror.read(key)
    }

    /// Current value of `key` deserialized from JSON.
    pub fn read_as<V: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<V>> {
        self.read(key)
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(SyncError::from)
    }

    /// Readable logical keys, sorted.
    pub fn keys(&self) -> BTreeSet<String> {
        self.mirror.keys()
    }

    /// Every readable logical key and value.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.mirror.snapshot()
    }

    /// Estimated session time (ms since the Unix epoch).
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Current correction applied to the local clock (ms).
    pub fn clock_offset(&self) -> i64 {
        self.clock.offset()
    }

    /// Subscribe to changes made by other participants.
    pub fn on_external_change<F>(&mut self, handler: F)
    where
        F: FnMut(&ExternalChange) + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Process one transport notification.
    ///
    /// Entries echoing this participant's own writes are dropped; the rest
    /// are applied to the mirror. Handlers run once if anything observable
    /// changed. Never fails: entries that cannot be reassembled yet are kept
    /// and picked up by a later notification.
    pub fn on_notification(&mut self, notification: Notification) -> ExternalChange {
        self.stats.notifications_received += 1;

        let echo = &mut self.echo;
        let mut suppressed = 0u64;
        let added: Vec<(&str, &str)> = notification
            .added
            .iter()
            .filter(|e| {
                let own = echo.consume_if_pending(&e.key, EchoKind::Update);
                suppressed += own as u64;
                !own
            })
            .map(|e| (e.key.as_str(), e.value.as_str()))
            .collect();
        let removed: Vec<&str> = notification
            .removed
            .iter()
            .filter(|k| {
                let own = echo.consume_if_pending(k, EchoKind::Removal);
                suppressed += own as u64;
                !own
            })
            .map(String::as_str)
            .collect();
        self.stats.echoes_suppressed += suppressed;

        let logical = self.mirror.apply_external(added, removed);
        self.clock.observe(&notification.added);

        let change = ExternalChange {
            added: logical.added,
            removed: logical.removed,
        };
        log::debug!(
            "Notification with {} entries: {suppressed} echoed, {} added, {} removed",
            notification.len(),
            change.added.len(),
            change.removed.len()
        );
        if !change.is_empty() {
            self.stats.changes_emitted += 1;
            for handler in &mut self.handlers {
                handler(&change);
            }
        }
        change
    }

    /// Remove every key owned by `owner`, e.g. when that participant leaves.
    /// Returns the number of logical keys removed.
    pub fn remove_owned(&mut self, owner: &ParticipantId) -> SyncResult<usize> {
        self.remove_where(|k| key::is_owned_by(k, owner.as_str()))
    }

    /// Remove state left behind by participants that are no longer in the
    /// session. Only keys following the `<owner>/<resource>` schema are
    /// considered; shared scopes must be listed in `active` to be kept.
    pub fn prune_departed<'a, I>(&mut self, active: I) -> SyncResult<usize>
    where
        I: IntoIterator<Item = &'a ParticipantId>,
    {
        let active: BTreeSet<&str> = active.into_iter().map(ParticipantId::as_str).collect();
        self.remove_where(|k| {
            ResourceKey::parse(k).is_some_and(|rk| !active.contains(rk.owner.as_str()))
        })
    }

    /// Drop echo markers that never saw their notification.
    pub fn expire_echoes(&mut self) -> usize {
        let expired = self.echo.expire(self.config.echo_ttl);
        if expired > 0 {
            log::warn!("Dropped {expired} echo markers after {:?}", self.config.echo_ttl);
            self.stats.echoes_expired += expired as u64;
        }
        expired
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Number of transport keys still waiting for their echo.
    pub fn pending_echoes(&self) -> usize {
        self.echo.pending_len()
    }

    /// Shut the engine down, returning its final counters.
    pub fn close(self) -> EngineStats {
        log::info!(
            "Sync engine closed: {} deltas submitted, {} changes emitted",
            self.stats.deltas_submitted,
            self.stats.changes_emitted
        );
        self.stats
    }

    fn remove_where<F>(&mut self, mut doomed: F) -> SyncResult<usize>
    where
        F: FnMut(&str) -> bool,
    {
        let keys: Vec<String> = self
            .mirror
            .all_logical_keys()
            .into_iter()
            .filter(|k| doomed(k.as_str()))
            .collect();
        let raw_keys: Vec<String> = keys
            .iter()
            .flat_map(|k| self.mirror.raw_keys_of(k))
            .collect();
        if raw_keys.is_empty() {
            return Ok(0);
        }
        let entries = raw_keys.len();
        let deltas = batch::batch(Vec::new(), raw_keys, &self.config.limits())?;
        for key in &keys {
            self.mirror.remove(key);
        }
        log::info!("Removing {} keys ({entries} entries)", keys.len());
        self.submit_deltas(&deltas)?;
        Ok(keys.len())
    }

    /// Batch a raw change and hand the deltas to the transport in order.
    fn submit_change(&mut self, change: RawChange) -> SyncResult<()> {
        let deltas = batch::batch(change.updates, change.removes, &self.config.limits())?;
        self.submit_deltas(&deltas)
    }

    fn submit_deltas(&mut self, deltas: &[Delta]) -> SyncResult<()> {
        for delta in deltas {
            self.submit_delta(delta)?;
        }
        Ok(())
    }

    fn submit_delta(&mut self, delta: &Delta) -> SyncResult<()> {
        for (k, _) in &delta.updates {
            self.echo.mark_pending(k);
        }
        for k in &delta.removes {
            self.echo.mark_pending_removal(k);
        }
        if let Err(e) = self.transport.submit(delta) {
            // nothing will echo back for a rejected delta
            for (k, _) in &delta.updates {
                self.echo.consume_if_pending(k, EchoKind::Update);
            }
            for k in &delta.removes {
                self.echo.consume_if_pending(k, EchoKind::Removal);
            }
            log::warn!("Transport rejected delta of {} entries: {e}", delta.len());
            return Err(e.into());
        }
        self.stats.deltas_submitted += 1;
        self.stats.entries_submitted += delta.len() as u64;
        Ok(())
    }
}
