//! Integration tests for store history, isolation and maintenance
//!
//! - Version monotonicity and deterministic history
//! - Snapshot isolation for readers at older versions
//! - Commit atomicity under injected failures
//! - Concurrent writers serializing on the write lock

use std::sync::{Arc, Barrier};
use std::thread;

use itemdb_core::{
    CommitRecord, ItemChange, ItemDbError, ItemId, ItemRecord, ItemStatus, Value, Version,
};
use itemdb_storage::{FailPoint, Store};
use proptest::prelude::*;

// ============================================================================
// Helper Functions
// ============================================================================

fn write_value(store: &Store, item: ItemId, name: &str, value: Value) -> Result<Version, ItemDbError> {
    let mut txn = store.begin("tests")?;
    let batch = txn.stage();
    batch.items.push((
        item,
        ItemRecord {
            values: vec![name.to_string()],
            ..Default::default()
        },
    ));
    batch.values.push((item, name.to_string(), Some(value)));
    batch.record.items.push(ItemChange {
        item,
        kind: None,
        status: ItemStatus::VDIRTY,
        values: vec![name.to_string()],
        refs: vec![],
    });
    txn.commit(|_| Ok(()))
}

fn strip_timestamps(history: Vec<CommitRecord>) -> Vec<(Version, Vec<ItemChange>)> {
    history.into_iter().map(|c| (c.version, c.items)).collect()
}

// ============================================================================
// History
// ============================================================================

mod history {
    use super::*;

    #[test]
    fn test_versions_strictly_increase() {
        let store = Store::default();
        let item = ItemId::new();
        let mut last = store.version();
        for i in 0..20 {
            let v = write_value(&store, item, "n", Value::Int(i)).unwrap();
            assert!(v > last);
            last = v;
        }
    }

    #[test]
    fn test_history_is_idempotent() {
        let store = Store::default();
        let item = ItemId::new();
        for i in 0..5 {
            write_value(&store, item, "n", Value::Int(i)).unwrap();
        }
        let first = strip_timestamps(store.iter_history(1, 5).unwrap());
        let second = strip_timestamps(store.iter_history(1, 5).unwrap());
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
    }

    proptest! {
        #[test]
        fn prop_history_covers_every_version(writes in 1usize..20, from in 0u64..20) {
            let store = Store::default();
            let item = ItemId::new();
            for i in 0..writes {
                write_value(&store, item, "n", Value::Int(i as i64)).unwrap();
            }
            let to = store.version();
            let history = store.iter_history(from, to).unwrap();
            let expected: Vec<Version> = ((from + 1)..=to).collect();
            let got: Vec<Version> = history.iter().map(|c| c.version).collect();
            prop_assert_eq!(got, expected);
        }
    }
}

// ============================================================================
// Isolation
// ============================================================================

mod isolation {
    use super::*;

    #[test]
    fn test_old_readers_see_old_values() {
        let store = Store::default();
        let item = ItemId::new();
        write_value(&store, item, "title", Value::from("x")).unwrap();
        let reader_version = store.version();
        write_value(&store, item, "title", Value::from("y")).unwrap();
        assert_eq!(store.load_value(item, "title", reader_version), Some(Value::from("x")));
        assert_eq!(store.load_value(item, "title", store.version()), Some(Value::from("y")));
    }

    #[test]
    fn test_concurrent_writers_serialize() {
        let store = Arc::new(Store::default());
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let item = ItemId::new();
                    let mut committed = Vec::new();
                    for i in 0..10 {
                        loop {
                            match write_value(&store, item, "n", Value::Int(t * 100 + i)) {
                                Ok(v) => {
                                    committed.push(v);
                                    break;
                                }
                                Err(e) if e.is_retryable() => continue,
                                Err(e) => panic!("unexpected error: {}", e),
                            }
                        }
                    }
                    committed
                })
            })
            .collect();
        let mut all: Vec<Version> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (1..=40).collect::<Vec<_>>());
        assert_eq!(store.commit_log_len(), 40);
    }
}

// ============================================================================
// Atomicity
// ============================================================================

mod atomicity {
    use super::*;

    #[test]
    fn test_failure_mid_commit_leaves_previous_version() {
        let store = Store::default();
        let item = ItemId::new();
        write_value(&store, item, "title", Value::from("before")).unwrap();
        for point in [FailPoint::BeforeLog, FailPoint::AfterLog] {
            store.faults().fail_next_commit(point);
            assert!(write_value(&store, item, "title", Value::from("after")).is_err());
            assert_eq!(store.version(), 1);
            assert_eq!(store.load_value(item, "title", u64::MAX), Some(Value::from("before")));
            assert_eq!(store.iter_history(0, u64::MAX).unwrap().len(), 1);
        }
        write_value(&store, item, "title", Value::from("after")).unwrap();
        assert_eq!(store.version(), 2);
    }
}
