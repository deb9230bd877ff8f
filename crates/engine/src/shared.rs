//! State shared by a repository and every view opened on it

use crate::config::RepositoryConfig;
use crate::item::Item;
use dashmap::DashMap;
use itemdb_concurrency::{retry_on_deadlock, MergeRegistry};
use itemdb_core::{CommitBatch, ItemDbError, Result, Schema, TypeCatalog, Version};
use itemdb_durability::snapshot::snapshot_path;
use itemdb_durability::wal::{list_segments, segment_path};
use itemdb_durability::{
    list_snapshots, prune_snapshots, write_snapshot, RepoLayout, WalWriter,
};
use itemdb_storage::Store;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Comparison method for comparator-sorted indexes
pub type Comparator = Arc<dyn Fn(&Item, &Item) -> Ordering + Send + Sync>;

pub(crate) struct Shared {
    pub(crate) store: Arc<Store>,
    pub(crate) schema: Schema,
    pub(crate) catalog: TypeCatalog,
    pub(crate) comparators: HashMap<String, Comparator>,
    pub(crate) merges: MergeRegistry,
    pub(crate) config: RepositoryConfig,
    pub(crate) layout: Option<RepoLayout>,
    pub(crate) wal: Mutex<Option<WalWriter>>,
    views: DashMap<u64, String>,
    next_view: AtomicU64,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<Store>,
        schema: Schema,
        catalog: TypeCatalog,
        comparators: HashMap<String, Comparator>,
        merges: MergeRegistry,
        config: RepositoryConfig,
        layout: Option<RepoLayout>,
        wal: Option<WalWriter>,
    ) -> Self {
        Self {
            store,
            schema,
            catalog,
            comparators,
            merges,
            config,
            layout,
            wal: Mutex::new(wal),
            views: DashMap::new(),
            next_view: AtomicU64::new(1),
        }
    }

    pub(crate) fn comparator(&self, method: &str) -> Result<Comparator> {
        self.comparators.get(method).cloned().ok_or_else(|| {
            ItemDbError::InvalidOperation(format!("no comparator '{}' registered", method))
        })
    }

    /// Commit sink: append the batch to the write-ahead log
    pub(crate) fn log(&self, batch: &CommitBatch) -> Result<()> {
        if let Some(wal) = self.wal.lock().as_mut() {
            wal.append(batch)?;
        }
        Ok(())
    }

    /// Drop the record of a commit that failed after logging
    pub(crate) fn discard_logged(&self) {
        if let Some(wal) = self.wal.lock().as_mut() {
            if let Err(e) = wal.discard_last() {
                warn!(target: "itemdb::wal", error = %e, "Failed to discard record of aborted commit");
            }
        }
    }

    /// Snapshot every container at the current version, then archive the
    /// log segments it covers. Returns `None` without a repository directory.
    pub(crate) fn checkpoint(&self) -> Result<Option<Version>> {
        let Some(layout) = &self.layout else {
            return Ok(None);
        };
        let start = Instant::now();
        let version = retry_on_deadlock(&self.config.retry, "checkpoint", |_| {
            let _lock = self.store.lock_for_write()?;
            let image = self.store.image();
            write_snapshot(&layout.snapshot_dir(), image.version, &image)?;
            if let Some(wal) = self.wal.lock().as_mut() {
                wal.rotate()?;
                wal.archive_closed(&layout.archive_dir())?;
            }
            Ok(image.version)
        })?;
        let pruned = prune_snapshots(&layout.snapshot_dir(), self.config.snapshots_kept)?;
        info!(
            target: "itemdb::checkpoint",
            version,
            pruned,
            duration_ms = start.elapsed().as_millis() as u64,
            "Checkpoint complete"
        );
        Ok(Some(version))
    }

    /// Make a rollback durable: snapshot the rolled-back state and forget
    /// every snapshot and log segment that still holds undone versions.
    pub(crate) fn persist_undo(&self) -> Result<Option<Version>> {
        let Some(layout) = &self.layout else {
            return Ok(None);
        };
        let snapshot_dir = layout.snapshot_dir();
        let archive_dir = layout.archive_dir();
        let version = retry_on_deadlock(&self.config.retry, "persist undo", |_| {
            let _lock = self.store.lock_for_write()?;
            let image = self.store.image();
            write_snapshot(&snapshot_dir, image.version, &image)?;
            if let Some(wal) = self.wal.lock().as_mut() {
                wal.rotate()?;
                wal.discard_closed()?;
            }
            Ok(image.version)
        })?;
        for stale in list_snapshots(&snapshot_dir)? {
            if stale > version {
                std::fs::remove_file(snapshot_path(&snapshot_dir, stale))?;
            }
        }
        let archived = list_segments(&archive_dir)?;
        for number in &archived {
            std::fs::remove_file(segment_path(&archive_dir, *number))?;
        }
        info!(
            target: "itemdb::checkpoint",
            version,
            archived = archived.len(),
            "Rollback persisted"
        );
        Ok(Some(version))
    }

    pub(crate) fn register_view(&self, name: &str) -> u64 {
        let id = self.next_view.fetch_add(1, AtomicOrdering::Relaxed);
        self.views.insert(id, name.to_string());
        id
    }

    pub(crate) fn unregister_view(&self, id: u64) {
        self.views.remove(&id);
    }

    pub(crate) fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.iter().map(|e| e.value().clone()).collect();
        names.sort();
        names
    }
}
