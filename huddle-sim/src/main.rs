//! Huddle simulator: a few participants sharing one in-memory hub.
//!
//! Each participant publishes its availability and a snapshot photo large
//! enough to be chunked, one asks another to talk, and one leaves. Every
//! external change a participant observes is logged.
//!
//! Set `HUDDLE_CONFIG` to a JSON file to override [`SyncConfig`] fields and
//! `RUST_LOG=debug` to watch chunking and echo suppression.

use std::error::Error;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use huddle_sync::{
    ExternalChange, Hub, HubConfig, ParticipantId, Resource, ResourceKey, ResourceKind, Session,
    SessionConfig, SessionHandle, SyncConfig, SyncEngine,
};

const PARTICIPANTS: usize = 3;
const PHOTO_BYTES: usize = 20_000;

struct Participant {
    id: ParticipantId,
    session: Session,
    watcher: JoinHandle<usize>,
}

impl Participant {
    fn handle(&self) -> SessionHandle {
        self.session.handle()
    }

    fn key(&self, resource: Resource) -> String {
        ResourceKey::new(self.id.clone(), resource).encode()
    }
}

fn load_config() -> Result<SyncConfig, Box<dyn Error>> {
    let Ok(path) = std::env::var("HUDDLE_CONFIG") else {
        return Ok(SyncConfig::default());
    };
    let config: SyncConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    info!("Loaded config from {path}");
    Ok(config)
}

fn join(hub: &Hub, config: &SyncConfig) -> Result<Participant, Box<dyn Error>> {
    let id = ParticipantId::random();
    let (transport, stream) = hub.connect();
    let engine = SyncEngine::new(transport, config.clone())?;
    let mut session = Session::spawn(engine, stream, SessionConfig::default());
    let events = session
        .take_event_rx()
        .ok_or("event receiver already taken")?;
    let watcher = tokio::spawn(watch(id.clone(), events));
    info!("Participant {id} joined");
    Ok(Participant {
        id,
        session,
        watcher,
    })
}

/// Log every external change until the session stops.
async fn watch(id: ParticipantId, mut events: mpsc::Receiver<ExternalChange>) -> usize {
    let mut seen = 0;
    while let Some(change) = events.recv().await {
        seen += 1;
        for (key, value) in &change.added {
            info!("[{id}] {key} = {} bytes", value.len());
        }
        for key in &change.removed {
            info!("[{id}] {key} removed");
        }
        let requests = change.for_resource(ResourceKind::Request);
        for key in requests.added.keys() {
            if let Some(ResourceKey {
                owner,
                resource: Resource::Request { target },
            }) = ResourceKey::parse(key)
            {
                if target == id.as_str() {
                    info!("[{id}] {owner} wants to talk");
                }
            }
        }
    }
    seen
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config()?;
    let hub = Hub::new(HubConfig {
        limits: config.limits(),
        ..HubConfig::default()
    });

    let mut participants = Vec::with_capacity(PARTICIPANTS);
    for _ in 0..PARTICIPANTS {
        participants.push(join(&hub, &config)?);
    }

    for (i, p) in participants.iter().enumerate() {
        let handle = p.handle();
        handle.write(&p.key(Resource::Available), &true).await?;
        handle.write(&p.key(Resource::Present), &(i % 2 == 0)).await?;
        let photo = format!("data:image/jpeg;base64,{}", "A".repeat(PHOTO_BYTES));
        handle.write(&p.key(Resource::Photo), &photo).await?;
    }

    let (first, second) = (&participants[0], &participants[1]);
    let request = first.key(Resource::Request {
        target: second.id.to_string(),
    });
    first.handle().write(&request, &true).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let now = second.handle().now().await?;
    info!("Session time at {}: {now}", second.id);

    let Some(leaving) = participants.pop() else {
        return Ok(());
    };
    let removed = leaving.handle().leave(leaving.id.clone()).await?;
    info!("Participant {} left, removed {removed} keys", leaving.id);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let active: Vec<ParticipantId> = participants.iter().map(|p| p.id.clone()).collect();
    let pruned = participants[0].handle().prune_departed(active).await?;
    info!("Pruned {pruned} stale keys");

    for p in participants {
        let keys = p.handle().keys().await?;
        let stats = p.handle().close().await?;
        info!(
            "{}: {} keys, {} deltas sent, {} echoes suppressed",
            p.id,
            keys.len(),
            stats.deltas_submitted,
            stats.echoes_suppressed
        );
        drop(p.session);
        let seen = p.watcher.await?;
        info!("{} observed {seen} external changes", p.id);
    }
    drop(leaving.session);
    leaving.watcher.await?;

    hub.shutdown();
    let stats = hub.stats();
    info!(
        "Hub: {} deltas accepted, {} rejected, {} entries stored",
        stats.deltas_accepted, stats.deltas_rejected, stats.entries_stored
    );
    Ok(())
}
