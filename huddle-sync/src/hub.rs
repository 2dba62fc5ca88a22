//! In-memory broadcast key-value store for running participants together.
//!
//! ```text
//!  HubTransport::submit ──► Hub (document + clock) ──► broadcast::Sender
//!                                                        │   │   │
//!                                        NotificationStream ... (one per participant,
//!                                                                 submitter included)
//! ```
//!
//! Each accepted delta is applied to the document (removes, then updates),
//! stamped with the hub clock and encoded once as a [`HubFrame`]. Every
//! subscriber receives the same `Arc`'d bytes. Stats are tracked with atomics
//! so submission never waits on a stats lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::batch::Delta;
use crate::clock::{Clock, SystemClock};
use crate::config::{DeltaLimits, SyncConfig};
use crate::protocol::HubFrame;
use crate::transport::{AddedEntry, Notification, Transport, TransportError};

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per subscriber before it starts lagging.
    pub channel_capacity: usize,
    /// Size accounting applied to every submitted delta.
    pub limits: DeltaLimits,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            limits: SyncConfig::default().limits(),
        }
    }
}

impl HubConfig {
    pub fn for_testing() -> Self {
        Self {
            channel_capacity: 64,
            limits: SyncConfig::for_testing().limits(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub deltas_accepted: u64,
    pub deltas_rejected: u64,
    /// Frame deliveries, counted once per subscriber.
    pub notifications_sent: u64,
    /// Frames subscribers skipped because they fell behind.
    pub frames_lagged: u64,
    pub entries_stored: usize,
    pub subscribers: usize,
}

#[derive(Default)]
struct AtomicHubStats {
    deltas_accepted: AtomicU64,
    deltas_rejected: AtomicU64,
    notifications_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

struct HubInner {
    document: Mutex<BTreeMap<String, String>>,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    config: HubConfig,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
    stats: AtomicHubStats,
}

impl HubInner {
    fn document(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reject(&self, err: TransportError) -> Result<(), TransportError> {
        self.stats.deltas_rejected.fetch_add(1, Ordering::Relaxed);
        log::warn!("Hub rejected delta: {err}");
        Err(err)
    }

    fn submit(&self, delta: &Delta) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return self.reject(TransportError::Closed);
        }
        let size = delta.size(&self.config.limits);
        if size > self.config.limits.max_delta_size {
            return self.reject(TransportError::DeltaTooLarge {
                size,
                limit: self.config.limits.max_delta_size,
            });
        }

        // Held across the send so frames go out in commit order.
        let mut document = self.document();
        let timestamp = self.clock.now_ms();
        for key in &delta.removes {
            document.remove(key);
        }
        for (key, value) in &delta.updates {
            document.insert(key.clone(), value.clone());
        }

        let notification = Notification::new(
            delta
                .updates
                .iter()
                .map(|(k, v)| AddedEntry::new(k.clone(), v.clone(), timestamp))
                .collect(),
            delta.removes.clone(),
        );
        let encoded = HubFrame::Notification(notification)
            .encode()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let receivers = self.sender.send(Arc::new(encoded)).unwrap_or(0);

        self.stats.deltas_accepted.fetch_add(1, Ordering::Relaxed);
        self.stats
            .notifications_sent
            .fetch_add(receivers as u64, Ordering::Relaxed);
        log::trace!(
            "Hub committed {} entries at {timestamp} to {receivers} subscribers",
            delta.len()
        );
        Ok(())
    }
}

/// Shared handle to one hub. Clones refer to the same document.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Hub whose commit timestamps come from `clock`.
    pub fn with_clock(config: HubConfig, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                document: Mutex::new(BTreeMap::new()),
                sender,
                config,
                clock,
                closed: AtomicBool::new(false),
                stats: AtomicHubStats::default(),
            }),
        }
    }

    /// Join the hub.
    ///
    /// The stream subscribes before the transport can take its snapshot, so
    /// nothing committed in between is missed. Frames already reflected in
    /// the snapshot may be delivered again; applying them is idempotent.
    pub fn connect(&self) -> (HubTransport, NotificationStream) {
        let rx = {
            let _document = self.inner.document();
            self.inner.sender.subscribe()
        };
        (
            HubTransport {
                inner: self.inner.clone(),
            },
            NotificationStream {
                rx,
                inner: self.inner.clone(),
            },
        )
    }

    /// Current raw document.
    pub fn document(&self) -> BTreeMap<String, String> {
        self.inner.document().clone()
    }

    /// Stop accepting deltas and tell every subscriber.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _document = self.inner.document();
        match HubFrame::Shutdown.encode() {
            Ok(encoded) => {
                let receivers = self.inner.sender.send(Arc::new(encoded)).unwrap_or(0);
                log::info!("Hub shut down, notified {receivers} subscribers");
            }
            Err(e) => log::error!("Failed to encode shutdown frame: {e}"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> HubStats {
        let stats = &self.inner.stats;
        HubStats {
            deltas_accepted: stats.deltas_accepted.load(Ordering::Relaxed),
            deltas_rejected: stats.deltas_rejected.load(Ordering::Relaxed),
            notifications_sent: stats.notifications_sent.load(Ordering::Relaxed),
            frames_lagged: stats.frames_lagged.load(Ordering::Relaxed),
            entries_stored: self.inner.document().len(),
            subscribers: self.inner.sender.receiver_count(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// A participant's submission side of the hub.
#[derive(Clone)]
pub struct HubTransport {
    inner: Arc<HubInner>,
}

impl Transport for HubTransport {
    fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.document().clone()
    }

    fn submit(&self, delta: &Delta) -> Result<(), TransportError> {
        self.inner.submit(delta)
    }
}

/// A participant's notification side of the hub.
pub struct NotificationStream {
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    inner: Arc<HubInner>,
}

impl NotificationStream {
    /// Next notification, or `None` once the hub has shut down.
    pub async fn recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.recv().await {
                Ok(bytes) => match self.decode(&bytes) {
                    Some(HubFrame::Notification(n)) => return Some(n),
                    Some(HubFrame::Shutdown) => return None,
                    None => continue,
                },
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`NotificationStream::recv`]. Returns `None`
    /// when nothing is buffered or the hub has shut down.
    pub fn try_recv(&mut self) -> Option<Notification> {
        loop {
            match self.rx.try_recv() {
                Ok(bytes) => match self.decode(&bytes) {
                    Some(HubFrame::Notification(n)) => return Some(n),
                    Some(HubFrame::Shutdown) => return None,
                    None => continue,
                },
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Option<HubFrame> {
        match HubFrame::decode(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::warn!("Dropping undecodable hub frame: {e}");
                None
            }
        }
    }

    fn lagged(&self, skipped: u64) {
        self.inner
            .stats
            .frames_lagged
            .fetch_add(skipped, Ordering::Relaxed);
        log::warn!("Notification stream lagged, {skipped} frames skipped");
    }
}
