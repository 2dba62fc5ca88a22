//! Session actor: one tokio task owning a [`SyncEngine`].
//!
//! ```text
//!  SessionHandle ──mpsc<Command>──┐
//!  (cloneable, async)             ▼
//!                           ┌───────────┐   ExternalChange
//!  NotificationStream ─────►│  actor    │──────mpsc──────► application
//!                           │ (engine)  │
//!  interval (echo expiry) ─►└───────────┘
//! ```
//!
//! The engine is never shared: local commands and hub notifications are
//! serialized by a single `select!` loop, so the engine keeps its plain
//! `&mut self` API.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::{EngineStats, ExternalChange, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::hub::NotificationStream;
use crate::key::ParticipantId;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Commands buffered before handles wait.
    pub command_capacity: usize,
    /// External changes buffered for the application; extra ones are dropped.
    pub event_capacity: usize,
    /// How often stale echo markers are expired.
    pub expiry_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            event_capacity: 256,
            expiry_interval: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            command_capacity: 8,
            event_capacity: 32,
            expiry_interval: Duration::from_millis(50),
        }
    }
}

enum Command {
    Write {
        key: String,
        value: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Read {
        key: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Keys {
        reply: oneshot::Sender<BTreeSet<String>>,
    },
    Now {
        reply: oneshot::Sender<i64>,
    },
    Prune {
        active: Vec<ParticipantId>,
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Leave {
        owner: ParticipantId,
        reply: oneshot::Sender<SyncResult<usize>>,
    },
    Close {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Cloneable front end to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub async fn write<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> SyncResult<()> {
        let value = serde_json::to_string(value)?;
        self.request(|reply| Command::Write {
            key: key.to_string(),
            value,
            reply,
        })
        .await?
    }

    pub async fn remove(&self, key: &str) -> SyncResult<()> {
        self.request(|reply| Command::Remove {
            key: key.to_string(),
            reply,
        })
        .await?
    }

    pub async fn read(&self, key: &str) -> SyncResult<Option<String>> {
        self.request(|reply| Command::Read {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn read_as<V: DeserializeOwned>(&self, key: &str) -> SyncResult<Option<V>> {
        match self.read(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn keys(&self) -> SyncResult<BTreeSet<String>> {
        self.request(|reply| Command::Keys { reply }).await
    }

    /// Estimated session time in milliseconds.
    pub async fn now(&self) -> SyncResult<i64> {
        self.request(|reply| Command::Now { reply }).await
    }

    /// Remove state of participants not listed in `active`.
    pub async fn prune_departed(&self, active: Vec<ParticipantId>) -> SyncResult<usize> {
        self.request(|reply| Command::Prune { active, reply }).await?
    }

    pub async fn stats(&self) -> SyncResult<EngineStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Remove every key owned by `owner` and stop the session.
    pub async fn leave(&self, owner: ParticipantId) -> SyncResult<usize> {
        self.request(|reply| Command::Leave { owner, reply }).await?
    }

    /// Stop the session, keeping shared state in place.
    pub async fn close(&self) -> SyncResult<EngineStats> {
        self.request(|reply| Command::Close { reply }).await
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> SyncResult<R> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SyncError::Transport(TransportError::Closed))?;
        response
            .await
            .map_err(|_| SyncError::Transport(TransportError::Closed))
    }
}

/// A spawned session.
pub struct Session {
    handle: SessionHandle,
    event_rx: Option<mpsc::Receiver<ExternalChange>>,
    task: JoinHandle<EngineStats>,
}

impl Session {
    /// Move `engine` into a new task fed by `stream`. Must be called from
    /// within a tokio runtime.
    pub fn spawn<T>(engine: SyncEngine<T>, stream: NotificationStream, config: SessionConfig) -> Self
    where
        T: Transport + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let actor = Actor {
            engine,
            stream,
            commands: command_rx,
            events: event_tx,
            stream_open: true,
        };
        let task = tokio::spawn(actor.run(config.expiry_interval));
        Self {
            handle: SessionHandle {
                commands: command_tx,
            },
            event_rx: Some(event_rx),
            task,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Take the external change receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ExternalChange>> {
        self.event_rx.take()
    }

    /// Wait for the actor to stop and return its final stats. `None` if the
    /// task panicked or was aborted.
    pub async fn join(self) -> Option<EngineStats> {
        drop(self.handle);
        match self.task.await {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::error!("Session task failed: {e}");
                None
            }
        }
    }
}

struct Actor<T: Transport> {
    engine: SyncEngine<T>,
    stream: NotificationStream,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ExternalChange>,
    stream_open: bool,
}

enum Flow {
    Continue,
    Stop(Option<oneshot::Sender<EngineStats>>),
}

impl<T: Transport> Actor<T> {
    async fn run(mut self, expiry_interval: Duration) -> EngineStats {
        let mut expiry = tokio::time::interval(expiry_interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let close_reply = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => match self.handle(command) {
                        Flow::Continue => {}
                        Flow::Stop(reply) => break reply,
                    },
                    // every handle dropped
                    None => break None,
                },
                notification = self.stream.recv(), if self.stream_open => match notification {
                    Some(notification) => self.dispatch(notification),
                    None => {
                        log::info!("Hub closed, session continues locally");
                        self.stream_open = false;
                    }
                },
                _ = expiry.tick() => {
                    self.engine.expire_echoes();
                }
            }
        };

        let stats = self.engine.close();
        if let Some(reply) = close_reply {
            let _ = reply.send(stats.clone());
        }
        stats
    }

    fn handle(&mut self, command: Command) -> Flow {
        // a dropped reply receiver means the caller stopped waiting
        match command {
            Command::Write { key, value, reply } => {
                let _ = reply.send(self.engine.write_raw(&key, &value));
            }
            Command::Remove { key, reply } => {
                let _ = reply.send(self.engine.remove(&key));
            }
            Command::Read { key, reply } => {
                let _ = reply.send(self.engine.read(&key));
            }
            Command::Keys { reply } => {
                let _ = reply.send(self.engine.keys());
            }
            Command::Now { reply } => {
                let _ = reply.send(self.engine.now());
            }
            Command::Prune { active, reply } => {
                let _ = reply.send(self.engine.prune_departed(&active));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.engine.stats().clone());
            }
            Command::Leave { owner, reply } => {
                let result = self.engine.remove_owned(&owner);
                log::info!("Participant {owner} leaving: {result:?}");
                let _ = reply.send(result);
                return Flow::Stop(None);
            }
            Command::Close { reply } => return Flow::Stop(Some(reply)),
        }
        Flow::Continue
    }

    fn dispatch(&mut self, notification: crate::transport::Notification) {
        let change = self.engine.on_notification(notification);
        if change.is_empty() {
            return;
        }
        match self.events.try_send(change) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Event channel full, dropping external change");
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("No event receiver, external change not forwarded");
            }
        }
    }
}
