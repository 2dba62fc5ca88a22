//! End-to-end synchronization between participants sharing one hub.
//!
//! Engines are driven by hand here: notifications are pumped with
//! `try_recv`, so every interleaving is deterministic.

use std::sync::{Arc, Mutex};

use huddle_sync::chunk::VersionTag;
use huddle_sync::{
    AddedEntry, ExternalChange, Hub, HubConfig, HubTransport, ManualClock, Notification,
    NotificationStream, ParticipantId, ResourceKind, Session, SessionConfig, SyncConfig,
    SyncEngine, SyncError, TransportError,
};
use tokio::time::{timeout, Duration};

struct Peer {
    engine: SyncEngine<HubTransport>,
    stream: NotificationStream,
}

impl Peer {
    fn join(hub: &Hub, config: SyncConfig) -> Self {
        let (transport, stream) = hub.connect();
        Self {
            engine: SyncEngine::new(transport, config).unwrap(),
            stream,
        }
    }

    /// Feed every buffered notification to the engine.
    fn pump(&mut self) -> Vec<ExternalChange> {
        let mut changes = Vec::new();
        while let Some(n) = self.stream.try_recv() {
            let change = self.engine.on_notification(n);
            if !change.is_empty() {
                changes.push(change);
            }
        }
        changes
    }

    /// Buffered notifications, without applying them.
    fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.stream.try_recv()).collect()
    }
}

#[test]
fn test_large_value_reconstructed_by_peer() {
    let hub = Hub::new(HubConfig::default());
    let mut alice = Peer::join(&hub, SyncConfig::default());
    let mut bob = Peer::join(&hub, SyncConfig::default());

    let photo = "p".repeat(20_000);
    alice.engine.write_raw("alice/photo", &photo).unwrap();

    // 8192 + 8192 + 3616 byte parts and one pointer
    let doc = hub.document();
    let mut sizes: Vec<usize> = doc
        .iter()
        .filter(|(k, _)| k.starts_with("alice/photo/_/"))
        .map(|(_, v)| v.len())
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![3616, 8192, 8192]);
    assert_eq!(doc.len(), 4);

    let notifications = bob.drain();
    assert!(notifications.len() > 1, "value should span several deltas");
    let (last, earlier) = notifications.split_last().unwrap();
    for n in earlier {
        assert!(bob.engine.on_notification(n.clone()).is_empty());
        assert_eq!(bob.engine.read("alice/photo"), None);
    }
    let change = bob.engine.on_notification(last.clone());
    assert_eq!(change.added.get("alice/photo"), Some(&photo));
    assert_eq!(bob.engine.read("alice/photo"), Some(photo));
}

#[test]
fn test_parts_in_any_order() {
    let hub = Hub::new(HubConfig::default());
    let mut alice = Peer::join(&hub, SyncConfig::default());
    let mut bob = Peer::join(&hub, SyncConfig::default());

    let value = "q".repeat(20_000);
    alice.engine.write_raw("alice/photo", &value).unwrap();

    let mut entries: Vec<AddedEntry> = bob.drain().into_iter().flat_map(|n| n.added).collect();
    assert_eq!(entries.len(), 4);
    // pointer first, parts reversed
    entries.reverse();
    let mut reported = 0;
    for entry in entries {
        let change = bob.engine.on_notification(Notification::new(vec![entry], vec![]));
        reported += change.added.len();
    }
    assert_eq!(reported, 1);
    assert_eq!(bob.engine.read("alice/photo"), Some(value));
}

#[test]
fn test_removal_reaches_peer() {
    let hub = Hub::new(HubConfig::default());
    let mut alice = Peer::join(&hub, SyncConfig::default());
    let mut bob = Peer::join(&hub, SyncConfig::default());

    alice.engine.write_raw("alice/photo", &"r".repeat(20_000)).unwrap();
    bob.pump();
    alice.pump();

    alice.engine.remove("alice/photo").unwrap();
    let removal = bob.drain();
    let removed: Vec<&String> = removal.iter().flat_map(|n| &n.removed).collect();
    assert_eq!(removed.len(), 4);
    assert_eq!(removed[0], "alice/photo");

    for n in removal {
        let change = bob.engine.on_notification(n);
        if !change.is_empty() {
            assert!(change.removed.contains("alice/photo"));
        }
    }
    assert_eq!(bob.engine.read("alice/photo"), None);
    assert!(hub.document().is_empty());
}

#[test]
fn test_own_writes_never_reported() {
    let hub = Hub::new(HubConfig::for_testing());
    let mut alice = Peer::join(&hub, SyncConfig::for_testing());
    let seen = Arc::new(Mutex::new(0usize));
    let counter = seen.clone();
    alice.engine.on_external_change(move |_| *counter.lock().unwrap() += 1);

    alice.engine.write("alice/available", &true).unwrap();
    assert_eq!(alice.engine.read_as::<bool>("alice/available").unwrap(), Some(true));
    alice.engine.write("alice/photo", &"s".repeat(200)).unwrap();
    alice.engine.remove("alice/available").unwrap();

    assert!(alice.pump().is_empty());
    assert_eq!(*seen.lock().unwrap(), 0);
    assert_eq!(alice.engine.pending_echoes(), 0);
    assert!(alice.engine.stats().echoes_suppressed > 0);
}

#[test]
fn test_duplicate_notifications_are_idempotent() {
    let hub = Hub::new(HubConfig::for_testing());
    let mut alice = Peer::join(&hub, SyncConfig::for_testing());
    let mut bob = Peer::join(&hub, SyncConfig::for_testing());
    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    bob.engine
        .on_external_change(move |c| sink.lock().unwrap().extend(c.added.keys().cloned()));

    alice.engine.write("alice/hanging_with", &["bob", "carol"]).unwrap();
    let notifications = bob.drain();
    for n in notifications.iter().chain(notifications.iter()) {
        bob.engine.on_notification(n.clone());
    }

    assert_eq!(*fired.lock().unwrap(), vec!["alice/hanging_with".to_string()]);
    assert_eq!(
        bob.engine.read_as::<Vec<String>>("alice/hanging_with").unwrap(),
        Some(vec!["bob".to_string(), "carol".to_string()])
    );
}

#[test]
fn test_rewrite_collects_old_parts() {
    let hub = Hub::new(HubConfig::for_testing());
    let mut alice = Peer::join(&hub, SyncConfig::for_testing());
    let mut bob = Peer::join(&hub, SyncConfig::for_testing());

    alice.engine.write_raw("alice/photo", "first version of the photo").unwrap();
    alice.engine.write_raw("alice/photo", "second").unwrap();

    let version = VersionTag::of("second");
    let doc = hub.document();
    assert!(doc
        .keys()
        .filter(|k| k.starts_with("alice/photo/_/"))
        .all(|k| k.contains(version.as_str())));

    let changes = bob.pump();
    assert_eq!(changes.last().unwrap().added.get("alice/photo").unwrap(), "second");
    assert_eq!(bob.engine.read("alice/photo").as_deref(), Some("second"));
}

#[test]
fn test_clock_offset_from_hub_timestamps() {
    const T: i64 = 1_700_000_000_000;
    let hub = Hub::with_clock(HubConfig::default(), Arc::new(ManualClock::new(T)));
    let mut alice = Peer::join(&hub, SyncConfig::default());

    let (transport, stream) = hub.connect();
    let bob_clock = ManualClock::new(T + 200);
    let mut bob = Peer {
        engine: SyncEngine::with_clock(transport, SyncConfig::default(), Arc::new(bob_clock.clone()))
            .unwrap(),
        stream,
    };

    alice.engine.write("alice/present", &true).unwrap();
    bob.pump();
    assert_eq!(bob.engine.clock_offset(), -150);
    assert_eq!(bob.engine.now(), T + 50);

    bob_clock.advance(1_000);
    assert_eq!(bob.engine.now(), T + 1_050);
}

#[test]
fn test_late_joiner_reads_snapshot() {
    let hub = Hub::new(HubConfig::for_testing());
    let mut alice = Peer::join(&hub, SyncConfig::for_testing());
    alice.engine.write("alice/available", &true).unwrap();
    alice.engine.write("alice/photo", &"t".repeat(150)).unwrap();

    let carol = Peer::join(&hub, SyncConfig::for_testing());
    assert_eq!(carol.engine.keys(), alice.engine.keys());
    assert_eq!(carol.engine.snapshot(), alice.engine.snapshot());
}

#[test]
fn test_departed_participant_is_pruned() {
    let hub = Hub::new(HubConfig::for_testing());
    let mut alice = Peer::join(&hub, SyncConfig::for_testing());
    let mut bob = Peer::join(&hub, SyncConfig::for_testing());

    alice.engine.write("alice/photo", "me").unwrap();
    alice.engine.write("alice/requests/bob", &true).unwrap();
    bob.engine.write("bob/available", &true).unwrap();
    bob.pump();
    alice.pump();

    let bob_id = ParticipantId::new("bob");
    assert_eq!(bob.engine.prune_departed([&bob_id]).unwrap(), 2);
    assert!(hub.document().keys().all(|k| !k.starts_with("alice/")));

    // alice sees her state removed by someone else
    let changes = alice.pump();
    let removed: Vec<&String> = changes.iter().flat_map(|c| &c.removed).collect();
    assert_eq!(removed.len(), 2);
    assert!(changes
        .iter()
        .all(|c| c.for_resource(ResourceKind::Available).is_empty()));
}

#[test]
fn test_transport_limit_smaller_than_config() {
    let hub = Hub::new(HubConfig::for_testing());
    let mut alice = Peer::join(&hub, SyncConfig::default());
    let err = alice.engine.write_raw("alice/photo", &"u".repeat(5_000)).unwrap_err();
    assert!(matches!(
        err,
        SyncError::Transport(TransportError::DeltaTooLarge { .. })
    ));
    assert_eq!(alice.engine.pending_echoes(), 0);
}

#[tokio::test]
async fn test_sessions_exchange_state() {
    let hub = Hub::new(HubConfig::for_testing());
    let spawn = |hub: &Hub| {
        let (transport, stream) = hub.connect();
        let engine = SyncEngine::new(transport, SyncConfig::for_testing()).unwrap();
        Session::spawn(engine, stream, SessionConfig::for_testing())
    };
    let alice = spawn(&hub);
    let mut bob = spawn(&hub);
    let mut bob_events = bob.take_event_rx().unwrap();

    let alice_handle = alice.handle();
    alice_handle
        .write("alice/requests/bob", &"want to chat?")
        .await
        .unwrap();
    let change = timeout(Duration::from_secs(2), bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    let requests = change.for_resource(ResourceKind::Request);
    assert_eq!(requests.added.len(), 1);

    alice_handle.leave(ParticipantId::new("alice")).await.unwrap();
    let change = timeout(Duration::from_secs(2), bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(change.removed.contains("alice/requests/bob"));
    assert!(bob.handle().keys().await.unwrap().is_empty());

    let stats = bob.handle().close().await.unwrap();
    assert_eq!(stats.changes_emitted, 2);
}
