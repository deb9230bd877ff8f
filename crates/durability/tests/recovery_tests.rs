//! Recovery tests against a small in-memory model
//!
//! - Recovery is deterministic and never invents versions
//! - Snapshot plus log covers every committed version exactly once
//! - Torn log tails are dropped, damaged snapshots fall back to older ones

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;

use itemdb_core::{CommitBatch, ItemDbError, ItemId, Value, Version};
use itemdb_durability::wal::segment_path;
use itemdb_durability::{
    recover, write_snapshot, DurabilityMode, RecoveryStats, RepoLayout, WalWriter,
};
use proptest::prelude::*;
use tempfile::TempDir;

// ============================================================================
// Helper Functions
// ============================================================================

type Model = BTreeMap<Version, i64>;

fn batch(version: Version) -> CommitBatch {
    let mut b = CommitBatch::new(version, "tests");
    b.values
        .push((ItemId::new(), "n".into(), Some(Value::Int(version as i64 * 10))));
    b
}

fn setup() -> (TempDir, RepoLayout) {
    let dir = TempDir::new().unwrap();
    let layout = RepoLayout::new(dir.path());
    layout.create_dirs().unwrap();
    (dir, layout)
}

fn rebuild(layout: &RepoLayout) -> Result<(Model, RecoveryStats), ItemDbError> {
    let model = RefCell::new(Model::new());
    let stats = recover::<Model, _, _>(
        layout,
        |image| {
            *model.borrow_mut() = image;
            Ok(())
        },
        |b| {
            let mut model = model.borrow_mut();
            let top = model.keys().next_back().copied().unwrap_or(0);
            if b.version() <= top {
                return Ok(false);
            }
            if b.version() != top + 1 {
                return Err(ItemDbError::Corruption(format!("gap before {}", b.version())));
            }
            model.insert(b.version(), b.version() as i64 * 10);
            Ok(true)
        },
    )?;
    Ok((model.into_inner(), stats))
}

fn model_upto(version: Version) -> Model {
    (1..=version).map(|v| (v, v as i64 * 10)).collect()
}

// ============================================================================
// Replay
// ============================================================================

mod replay {
    use super::*;

    #[test]
    fn test_log_only_recovery() {
        let (_dir, layout) = setup();
        let mut wal = WalWriter::open(&layout.log_dir(), DurabilityMode::Always).unwrap();
        for v in 1..=5 {
            wal.append(&batch(v)).unwrap();
        }
        let (model, stats) = rebuild(&layout).unwrap();
        assert_eq!(model, model_upto(5));
        assert_eq!(stats.batches_replayed, 5);
        assert_eq!(stats.snapshot_version, None);
    }

    #[test]
    fn test_recovery_is_deterministic() {
        let (_dir, layout) = setup();
        let mut wal = WalWriter::open(&layout.log_dir(), DurabilityMode::Always).unwrap();
        for v in 1..=8 {
            wal.append(&batch(v)).unwrap();
        }
        let first = rebuild(&layout).unwrap();
        let second = rebuild(&layout).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_snapshot_then_newer_log_records() {
        let (_dir, layout) = setup();
        let mut wal = WalWriter::open(&layout.log_dir(), DurabilityMode::Always).unwrap();
        for v in 1..=4 {
            wal.append(&batch(v)).unwrap();
        }
        write_snapshot(&layout.snapshot_dir(), 4, &model_upto(4)).unwrap();
        wal.rotate().unwrap();
        wal.archive_closed(&layout.archive_dir()).unwrap();
        for v in 5..=6 {
            wal.append(&batch(v)).unwrap();
        }
        let (model, stats) = rebuild(&layout).unwrap();
        assert_eq!(model, model_upto(6));
        assert_eq!(stats.snapshot_version, Some(4));
        assert_eq!(stats.batches_replayed, 2);
    }

    proptest! {
        #[test]
        fn prop_snapshot_position_does_not_change_result(total in 1u64..15, cut in 0u64..15) {
            let (_dir, layout) = setup();
            let cut = cut.min(total);
            let mut wal = WalWriter::open(&layout.log_dir(), DurabilityMode::Always).unwrap();
            for v in 1..=total {
                wal.append(&batch(v)).unwrap();
                if v == cut {
                    write_snapshot(&layout.snapshot_dir(), v, &model_upto(v)).unwrap();
                }
            }
            let (model, _) = rebuild(&layout).unwrap();
            prop_assert_eq!(model, model_upto(total));
        }
    }
}

// ============================================================================
// Damage
// ============================================================================

mod damage {
    use super::*;

    #[test]
    fn test_torn_tail_drops_last_commit_only() {
        let (_dir, layout) = setup();
        {
            let mut wal = WalWriter::open(&layout.log_dir(), DurabilityMode::Always).unwrap();
            for v in 1..=3 {
                wal.append(&batch(v)).unwrap();
            }
        }
        let path = segment_path(&layout.log_dir(), 1);
        let len = fs::metadata(&path).unwrap().len();
        fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let (model, stats) = rebuild(&layout).unwrap();
        assert!(stats.torn_tail);
        assert_eq!(model, model_upto(2));
    }

    #[test]
    fn test_damaged_snapshot_falls_back_to_archive() {
        let (_dir, layout) = setup();
        let mut wal = WalWriter::open(&layout.log_dir(), DurabilityMode::Always).unwrap();
        wal.append(&batch(1)).unwrap();
        write_snapshot(&layout.snapshot_dir(), 1, &model_upto(1)).unwrap();
        wal.rotate().unwrap();
        wal.archive_closed(&layout.archive_dir()).unwrap();
        wal.append(&batch(2)).unwrap();
        let newest = write_snapshot(&layout.snapshot_dir(), 2, &model_upto(2)).unwrap();
        wal.rotate().unwrap();
        wal.archive_closed(&layout.archive_dir()).unwrap();
        wal.append(&batch(3)).unwrap();

        let mut bytes = fs::read(&newest).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&newest, bytes).unwrap();

        let (model, stats) = rebuild(&layout).unwrap();
        assert_eq!(stats.snapshots_rejected, 1);
        assert_eq!(stats.snapshot_version, Some(1));
        assert_eq!(model, model_upto(3));
    }

    #[test]
    fn test_no_readable_snapshot_is_corruption() {
        let (_dir, layout) = setup();
        let path = write_snapshot(&layout.snapshot_dir(), 1, &model_upto(1)).unwrap();
        fs::write(&path, b"not a snapshot").unwrap();
        let err = rebuild(&layout).unwrap_err();
        assert!(matches!(err, ItemDbError::Corruption(_)));
    }
}
