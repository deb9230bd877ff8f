//! Startup recovery: newest readable snapshot, then the commit log
//!
//! The caller supplies two closures, one installing a snapshot image and
//! one applying a single logged batch. Batches at or below the restored
//! version are skipped by the replay closure returning `false`.
//!
//! When the newest snapshot fails verification the next older one is used
//! and archived segments are replayed before the active log.

use crate::layout::RepoLayout;
use crate::snapshot::{list_snapshots, read_snapshot};
use crate::wal::read_log;
use crate::DurabilityError;
use itemdb_core::{CommitBatch, ItemDbError, Result, Version};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

/// What recovery did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Snapshot the store was seeded from
    pub snapshot_version: Option<Version>,
    /// Snapshots that failed verification
    pub snapshots_rejected: usize,
    /// Log records applied
    pub batches_replayed: usize,
    /// Log records already covered by the snapshot
    pub batches_skipped: usize,
    /// A torn record was dropped from the log tail
    pub torn_tail: bool,
}

/// Rebuild state from `layout`.
pub fn recover<T, R, P>(layout: &RepoLayout, mut restore: R, mut replay: P) -> Result<RecoveryStats>
where
    T: DeserializeOwned,
    R: FnMut(T) -> Result<()>,
    P: FnMut(CommitBatch) -> Result<bool>,
{
    let mut stats = RecoveryStats::default();
    let snapshot_dir = layout.snapshot_dir();

    let candidates = list_snapshots(&snapshot_dir)?;
    for version in candidates.iter().rev() {
        match read_snapshot::<T>(&snapshot_dir, *version) {
            Ok(image) => {
                restore(image)?;
                stats.snapshot_version = Some(*version);
                break;
            }
            Err(DurabilityError::Corrupt { path, reason }) => {
                warn!(
                    target: "itemdb::checkpoint",
                    path = %path.display(),
                    %reason,
                    "Rejecting damaged snapshot"
                );
                stats.snapshots_rejected += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    if !candidates.is_empty() && stats.snapshot_version.is_none() {
        return Err(ItemDbError::Corruption(
            "no readable snapshot in repository".to_string(),
        ));
    }

    let mut batches = Vec::new();
    if stats.snapshots_rejected > 0 {
        batches.extend(read_log(&layout.archive_dir())?.batches);
    }
    let log = read_log(&layout.log_dir())?;
    stats.torn_tail = log.torn_tail;
    batches.extend(log.batches);

    for batch in batches {
        if replay(batch)? {
            stats.batches_replayed += 1;
        } else {
            stats.batches_skipped += 1;
        }
    }

    info!(
        target: "itemdb::repo",
        snapshot = ?stats.snapshot_version,
        replayed = stats.batches_replayed,
        skipped = stats.batches_skipped,
        torn_tail = stats.torn_tail,
        "Recovery complete"
    );
    Ok(stats)
}
