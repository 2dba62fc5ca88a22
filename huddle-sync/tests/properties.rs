//! Property tests for chunking, batching and mirror convergence.

use huddle_sync::batch::batch;
use huddle_sync::chunk::{join, split};
use huddle_sync::mirror::LocalMirror;
use huddle_sync::DeltaLimits;
use proptest::prelude::*;

fn limits() -> DeltaLimits {
    DeltaLimits {
        max_delta_size: 200,
        delta_overhead: 10,
        entry_overhead: 5,
    }
}

#[derive(Debug, Clone)]
enum Op {
    Write(String, String),
    Remove(String),
}

fn op() -> impl Strategy<Value = Op> {
    let key = prop::sample::select(vec!["a/photo", "a/available", "b/photo", "room"]);
    prop_oneof![
        (key.clone(), "\\PC{0,60}").prop_map(|(k, v)| Op::Write(k.to_string(), v)),
        key.prop_map(|k| Op::Remove(k.to_string())),
    ]
}

proptest! {
    #[test]
    fn test_split_join_roundtrips(value in "\\PC{0,300}", part_size in 1usize..64) {
        let parts = split(&value, part_size);
        prop_assert!(!parts.is_empty());
        for part in &parts {
            // a char wider than the limit gets a part of its own
            prop_assert!(part.len() <= part_size.max(4));
        }
        let joined = join(parts.iter().map(String::as_str), parts.len()).unwrap();
        prop_assert_eq!(joined, value);
    }

    #[test]
    fn test_missing_part_is_incomplete(value in "[a-z]{2,200}", part_size in 1usize..16, pick in any::<prop::sample::Index>()) {
        let parts = split(&value, part_size);
        prop_assume!(parts.len() > 1);
        let gap = pick.index(parts.len());
        // parts are found from index 0 until the first gap
        let err = join(parts[..gap].iter().map(String::as_str), parts.len()).unwrap_err();
        prop_assert_eq!(err.available, gap);
        prop_assert_eq!(err.expected, parts.len());
    }

    #[test]
    fn test_batches_respect_limit_and_preserve_entries(
        updates in prop::collection::vec(("[a-z/]{1,20}", "[ -~]{0,40}"), 0..40),
        removes in prop::collection::vec("[a-z/]{1,20}", 0..40),
    ) {
        let limits = limits();
        let deltas = batch(updates.clone(), removes.clone(), &limits).unwrap();

        for delta in &deltas {
            prop_assert!(!delta.is_empty());
            prop_assert!(delta.size(&limits) <= limits.max_delta_size);
        }
        let out_updates: Vec<(String, String)> =
            deltas.iter().flat_map(|d| d.updates.clone()).collect();
        let out_removes: Vec<String> = deltas.iter().flat_map(|d| d.removes.clone()).collect();
        prop_assert_eq!(out_updates, updates);
        prop_assert_eq!(out_removes, removes);
    }

    #[test]
    fn test_replayed_changes_converge(ops in prop::collection::vec(op(), 1..30), part_size in 1usize..12) {
        let mut source = LocalMirror::new();
        let mut peer = LocalMirror::new();
        for op in ops {
            let change = match op {
                Op::Write(k, v) => source.write(&k, &v, part_size),
                Op::Remove(k) => source.remove(&k),
            };
            peer.apply_external(
                change.updates.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                change.removes.iter().map(String::as_str),
            );
        }
        prop_assert_eq!(peer.snapshot(), source.snapshot());
        prop_assert_eq!(peer.raw_len(), source.raw_len());
    }
}
