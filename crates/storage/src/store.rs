//! The transactional item store
//!
//! [`Store`] owns one [`Container`] per record family plus the commit log
//! and the global version counter.
//!
//! # Concurrency
//!
//! - Readers never block each other; every read names a version.
//! - Writers serialize on one write lock, taken with a timeout. A timeout is
//!   reported as [`ItemDbError::Deadlock`] and callers retry.
//! - A batch becomes visible only when the version counter moves, after every
//!   record of the batch has landed.
//!
//! # Readers
//!
//! Open views register the version they read at. Compaction never collects
//! below the oldest registered reader and undo never moves below it.

use crate::container::Container;
use crate::faults::{FailPoint, FaultInjector};
use crate::text::{TextImage, TextIndex};
use crate::txn::{Transaction, WriteLock};
use crate::chain::VersionChain;
use itemdb_core::{
    Acl, CommitBatch, CommitRecord, IndexRecord, ItemDbError, ItemId, ItemRecord, LinkRecord,
    RefRecord, Result, Value, Version,
};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Key of a literal value
pub type ValueKey = (ItemId, String);
/// Key of a collection entry: owner, attribute, member
pub type LinkKey = (ItemId, String, ItemId);
/// Key of a secondary index: owner, attribute, index name
pub type IndexKey = (ItemId, String, String);
/// Key of a name registration: parent, name
pub type NameKey = (Option<ItemId>, String);

const MIN_ID: [u8; 16] = [0u8; 16];

/// Store settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a writer waits for the write lock before reporting a deadlock
    pub lock_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(1000),
        }
    }
}

/// Handle of a registered reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

/// Result of a compaction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Version everything at or below was collapsed to
    pub compacted_to: Version,
    /// Record versions dropped
    pub records_removed: usize,
    /// Commit log entries dropped
    pub commits_removed: usize,
}

/// Full serializable contents of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreImage {
    /// Version counter
    pub version: Version,
    /// Oldest version with complete history
    pub history_floor: Version,
    /// Items container
    pub items: Vec<(ItemId, VersionChain<ItemRecord>)>,
    /// Values container
    pub values: Vec<(ValueKey, VersionChain<Value>)>,
    /// References container
    pub refs: Vec<(ValueKey, VersionChain<RefRecord>)>,
    /// Collection entries container
    pub links: Vec<(LinkKey, VersionChain<LinkRecord>)>,
    /// Indexes container
    pub indexes: Vec<(IndexKey, VersionChain<IndexRecord>)>,
    /// Names container
    pub names: Vec<(NameKey, VersionChain<ItemId>)>,
    /// ACL container
    pub acls: Vec<(ValueKey, VersionChain<Acl>)>,
    /// Commit log
    pub commits: Vec<CommitRecord>,
    /// Full-text index
    pub text: TextImage,
}

/// Versioned item store
#[derive(Debug)]
pub struct Store {
    items: Container<ItemId, ItemRecord>,
    values: Container<ValueKey, Value>,
    refs: Container<ValueKey, RefRecord>,
    links: Container<LinkKey, LinkRecord>,
    indexes: Container<IndexKey, IndexRecord>,
    names: Container<NameKey, ItemId>,
    acls: Container<ValueKey, Acl>,
    commits: RwLock<BTreeMap<Version, CommitRecord>>,
    version: AtomicU64,
    history_floor: AtomicU64,
    write_lock: Mutex<()>,
    readers: Mutex<FxHashMap<u64, Version>>,
    next_reader: AtomicU64,
    text: TextIndex,
    faults: FaultInjector,
    config: StoreConfig,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl Store {
    /// Empty store at version 0
    pub fn new(config: StoreConfig) -> Self {
        Self {
            items: Container::new("items"),
            values: Container::new("values"),
            refs: Container::new("refs"),
            links: Container::new("links"),
            indexes: Container::new("indexes"),
            names: Container::new("names"),
            acls: Container::new("acls"),
            commits: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            history_floor: AtomicU64::new(0),
            write_lock: Mutex::new(()),
            readers: Mutex::new(FxHashMap::default()),
            next_reader: AtomicU64::new(1),
            text: TextIndex::new(),
            faults: FaultInjector::new(),
            config,
        }
    }

    // ========================================================================
    // Versions
    // ========================================================================

    /// Latest committed version
    pub fn version(&self) -> Version {
        self.version.load(Ordering::Acquire)
    }

    /// Version the next commit will receive
    pub fn next_version(&self) -> Version {
        self.version() + 1
    }

    /// Oldest version whose successors are all still in the commit log
    pub fn history_floor(&self) -> Version {
        self.history_floor.load(Ordering::Acquire)
    }

    // ========================================================================
    // Point reads
    // ========================================================================

    /// Item header visible at `version`, with the version it was written at.
    /// Deletion tombstones are returned; check [`ItemRecord::is_deleted`].
    pub fn load_item(&self, item: ItemId, version: Version) -> Option<(Version, ItemRecord)> {
        self.items
            .entry(&item, version)
            .and_then(|(v, record)| record.map(|r| (v, r)))
    }

    /// Literal value at `version`
    pub fn load_value(&self, item: ItemId, name: &str, version: Version) -> Option<Value> {
        self.values.get(&(item, name.to_string()), version)
    }

    /// Several literal values at `version`; missing names are skipped
    pub fn load_values(&self, item: ItemId, names: &[String], version: Version) -> Vec<(String, Value)> {
        names
            .iter()
            .filter_map(|n| self.load_value(item, n, version).map(|v| (n.clone(), v)))
            .collect()
    }

    /// Reference record at `version`
    pub fn load_ref(&self, item: ItemId, name: &str, version: Version) -> Option<RefRecord> {
        self.refs.get(&(item, name.to_string()), version)
    }

    /// Several reference records at `version`
    pub fn load_refs(&self, item: ItemId, names: &[String], version: Version) -> Vec<(String, RefRecord)> {
        names
            .iter()
            .filter_map(|n| self.load_ref(item, n, version).map(|r| (n.clone(), r)))
            .collect()
    }

    /// One collection entry
    pub fn load_link(&self, owner: ItemId, name: &str, member: ItemId, version: Version) -> Option<LinkRecord> {
        self.links.get(&(owner, name.to_string(), member), version)
    }

    /// Every entry of a collection, in key order
    pub fn load_links(&self, owner: ItemId, name: &str, version: Version) -> Vec<(ItemId, LinkRecord)> {
        let start = (owner, name.to_string(), ItemId::from_bytes(MIN_ID));
        self.links
            .scan_from(&start, version, |k| k.0 == owner && k.1 == name)
            .into_iter()
            .map(|((_, _, member), record)| (member, record))
            .collect()
    }

    /// Secondary index record
    pub fn load_index(&self, owner: ItemId, name: &str, index: &str, version: Version) -> Option<IndexRecord> {
        self.indexes
            .get(&(owner, name.to_string(), index.to_string()), version)
    }

    /// ACL record
    pub fn load_acl(&self, item: ItemId, name: &str, version: Version) -> Option<Acl> {
        self.acls.get(&(item, name.to_string()), version)
    }

    /// Item registered under `(parent, name)`
    pub fn resolve_name(&self, parent: Option<ItemId>, name: &str, version: Version) -> Option<ItemId> {
        self.names.get(&(parent, name.to_string()), version)
    }

    /// Named children of `parent` (roots for `None`), in name order
    pub fn children(&self, parent: Option<ItemId>, version: Version) -> Vec<(String, ItemId)> {
        let start = (parent, String::new());
        self.names
            .scan_from(&start, version, |k| k.0 == parent)
            .into_iter()
            .map(|((_, name), id)| (name, id))
            .collect()
    }

    /// Version the item was last written at, if visible and not deleted
    pub fn item_version(&self, item: ItemId, version: Version) -> Option<Version> {
        self.load_item(item, version)
            .filter(|(_, r)| !r.is_deleted())
            .map(|(v, _)| v)
    }

    // ========================================================================
    // Range queries
    // ========================================================================

    /// Commit records in `(from, to]`, oldest first.
    ///
    /// Fails when `from` lies below the compacted history floor.
    pub fn iter_history(&self, from: Version, to: Version) -> Result<Vec<CommitRecord>> {
        let floor = self.history_floor();
        if from < floor {
            return Err(ItemDbError::HistoryCompacted {
                requested: from,
                oldest: floor,
            });
        }
        if to <= from {
            return Ok(Vec::new());
        }
        Ok(self
            .commits
            .read()
            .range(from + 1..=to)
            .map(|(_, record)| record.clone())
            .collect())
    }

    /// Live items of `kind` (every live item for `None`) at `version`
    pub fn query_items(&self, kind: Option<&str>, version: Version) -> Vec<ItemId> {
        self.items
            .filter(version, |_, record| {
                !record.is_deleted() && kind.map(|k| record.kind.as_deref() == Some(k)).unwrap_or(true)
            })
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Full-text index
    pub fn text(&self) -> &TextIndex {
        &self.text
    }

    /// Failure injection hooks
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    // ========================================================================
    // Readers
    // ========================================================================

    /// Register a reader at `version`
    pub fn register_reader(&self, version: Version) -> ReaderId {
        let id = self.next_reader.fetch_add(1, Ordering::Relaxed);
        self.readers.lock().insert(id, version);
        ReaderId(id)
    }

    /// Move a reader to a new version
    pub fn move_reader(&self, reader: ReaderId, version: Version) {
        if let Some(v) = self.readers.lock().get_mut(&reader.0) {
            *v = version;
        }
    }

    /// Forget a reader
    pub fn release_reader(&self, reader: ReaderId) {
        self.readers.lock().remove(&reader.0);
    }

    /// Oldest registered reader version
    pub fn oldest_reader(&self) -> Option<Version> {
        self.readers.lock().values().copied().min()
    }

    /// Newest registered reader version
    pub fn newest_reader(&self) -> Option<Version> {
        self.readers.lock().values().copied().max()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Take the write lock, waiting at most the configured timeout
    pub fn lock_for_write(&self) -> Result<WriteLock<'_>> {
        if self.faults.take_deadlock() {
            debug!(target: "itemdb::store", "injected deadlock");
            return Err(ItemDbError::Deadlock);
        }
        match self.write_lock.try_lock_for(self.config.lock_timeout) {
            Some(guard) => Ok(WriteLock::new(self, guard)),
            None => Err(ItemDbError::Deadlock),
        }
    }

    /// Take the write lock and open a transaction for the next version
    pub fn begin(&self, view: &str) -> Result<Transaction<'_>> {
        let lock = self.lock_for_write()?;
        Ok(Transaction::new(lock, view))
    }

    /// Publish a batch built under `lock`.
    ///
    /// The sink (normally the write-ahead log) sees the batch first. If the
    /// sink or an injected failure errors, nothing is applied.
    pub(crate) fn publish<F>(&self, _lock: &WriteLock<'_>, batch: CommitBatch, sink: F) -> Result<Version>
    where
        F: FnOnce(&CommitBatch) -> Result<()>,
    {
        let expected = self.next_version();
        if batch.version() != expected {
            return Err(ItemDbError::InvalidOperation(format!(
                "batch version {} does not follow store version {}",
                batch.version(),
                expected - 1
            )));
        }
        if self.faults.take_commit_failure(FailPoint::BeforeLog) {
            return Err(ItemDbError::Storage("injected failure before log".into()));
        }
        sink(&batch)?;
        if self.faults.take_commit_failure(FailPoint::AfterLog) {
            return Err(ItemDbError::Storage("injected failure after log".into()));
        }
        self.apply(batch);
        Ok(expected)
    }

    /// Apply a logged batch during recovery
    pub fn replay(&self, batch: CommitBatch) -> Result<bool> {
        let current = self.version();
        if batch.version() <= current {
            return Ok(false);
        }
        if batch.version() != current + 1 {
            return Err(ItemDbError::Corruption(format!(
                "log gap: store at {}, record at {}",
                current,
                batch.version()
            )));
        }
        self.apply(batch);
        Ok(true)
    }

    fn apply(&self, batch: CommitBatch) {
        let version = batch.version();
        let CommitBatch {
            record,
            items,
            values,
            refs,
            links,
            indexes,
            names,
            acls,
        } = batch;
        self.items.write_all(version, items.into_iter().map(|(k, v)| (k, Some(v))));
        self.values
            .write_all(version, values.into_iter().map(|(i, n, v)| ((i, n), v)));
        self.refs
            .write_all(version, refs.into_iter().map(|(i, n, v)| ((i, n), v)));
        self.links
            .write_all(version, links.into_iter().map(|(o, n, m, v)| ((o, n, m), v)));
        self.indexes
            .write_all(version, indexes.into_iter().map(|(o, n, x, v)| ((o, n, x), v)));
        self.names
            .write_all(version, names.into_iter().map(|(p, n, v)| ((p, n), v)));
        self.acls
            .write_all(version, acls.into_iter().map(|(i, n, v)| ((i, n), v)));
        self.commits.write().insert(version, record);
        // visibility point
        self.version.store(version, Ordering::Release);
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Collapse history at or below `min_version`.
    ///
    /// The effective floor is clamped to the oldest registered reader, so no
    /// version an open view reads at is touched.
    pub fn compact(&self, min_version: Version) -> Result<CompactionStats> {
        let _lock = self.lock_for_write()?;
        let mut floor = min_version.min(self.version());
        if let Some(oldest) = self.oldest_reader() {
            floor = floor.min(oldest);
        }
        if floor <= self.history_floor() {
            return Ok(CompactionStats {
                compacted_to: self.history_floor(),
                ..Default::default()
            });
        }
        let records_removed = self.items.gc(floor)
            + self.values.gc(floor)
            + self.refs.gc(floor)
            + self.links.gc(floor)
            + self.indexes.gc(floor)
            + self.names.gc(floor)
            + self.acls.gc(floor);
        let commits_removed = {
            let mut commits = self.commits.write();
            let keep = commits.split_off(&(floor + 1));
            let removed = commits.len();
            *commits = keep;
            removed
        };
        self.history_floor.store(floor, Ordering::Release);
        info!(
            target: "itemdb::store",
            floor,
            records_removed,
            commits_removed,
            "Compacted store"
        );
        Ok(CompactionStats {
            compacted_to: floor,
            records_removed,
            commits_removed,
        })
    }

    /// Roll the store back to `version`.
    ///
    /// Refused when an open reader sits above `version` or when the history
    /// needed has been compacted.
    pub fn undo(&self, version: Version) -> Result<usize> {
        let _lock = self.lock_for_write()?;
        let current = self.version();
        if version >= current {
            return Ok(0);
        }
        if version < self.history_floor() {
            return Err(ItemDbError::HistoryCompacted {
                requested: version,
                oldest: self.history_floor(),
            });
        }
        if let Some(newest) = self.newest_reader() {
            if newest > version {
                return Err(ItemDbError::InvalidOperation(format!(
                    "cannot undo to {}: a view is open at {}",
                    version, newest
                )));
            }
        }
        let removed = self.items.truncate_after(version)
            + self.values.truncate_after(version)
            + self.refs.truncate_after(version)
            + self.links.truncate_after(version)
            + self.indexes.truncate_after(version)
            + self.names.truncate_after(version)
            + self.acls.truncate_after(version);
        self.commits.write().retain(|v, _| *v <= version);
        self.text.truncate_after(version);
        self.version.store(version, Ordering::Release);
        info!(target: "itemdb::store", from = current, to = version, removed, "Undid versions");
        Ok(removed)
    }

    /// Serializable copy of every container.
    ///
    /// Callers wanting a consistent image hold the write lock.
    pub fn image(&self) -> StoreImage {
        StoreImage {
            version: self.version(),
            history_floor: self.history_floor(),
            items: self.items.export(),
            values: self.values.export(),
            refs: self.refs.export(),
            links: self.links.export(),
            indexes: self.indexes.export(),
            names: self.names.export(),
            acls: self.acls.export(),
            commits: self.commits.read().values().cloned().collect(),
            text: self.text.export(),
        }
    }

    /// Replace every container from an image
    pub fn restore_image(&self, image: StoreImage) {
        self.items.import(image.items);
        self.values.import(image.values);
        self.refs.import(image.refs);
        self.links.import(image.links);
        self.indexes.import(image.indexes);
        self.names.import(image.names);
        self.acls.import(image.acls);
        *self.commits.write() = image.commits.into_iter().map(|c| (c.version, c)).collect();
        self.text.import(image.text);
        self.history_floor.store(image.history_floor, Ordering::Release);
        self.version.store(image.version, Ordering::Release);
    }

    /// Number of commit log entries retained
    pub fn commit_log_len(&self) -> usize {
        self.commits.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itemdb_core::{ItemChange, ItemStatus};

    fn commit_title(store: &Store, item: ItemId, title: &str) -> Version {
        let mut txn = store.begin("test").unwrap();
        let batch = txn.stage();
        batch.items.push((
            item,
            ItemRecord {
                kind: Some("Note".into()),
                values: vec!["title".into()],
                ..Default::default()
            },
        ));
        batch.values.push((item, "title".into(), Some(Value::from(title))));
        batch.record.items.push(ItemChange {
            item,
            kind: Some("Note".into()),
            status: ItemStatus::VDIRTY,
            values: vec!["title".into()],
            refs: vec![],
        });
        txn.commit(|_| Ok(())).unwrap()
    }

    #[test]
    fn test_commit_advances_version() {
        let store = Store::default();
        let a = ItemId::new();
        assert_eq!(commit_title(&store, a, "x"), 1);
        assert_eq!(commit_title(&store, a, "y"), 2);
        assert_eq!(store.version(), 2);
        assert_eq!(store.load_value(a, "title", 1), Some(Value::from("x")));
        assert_eq!(store.load_value(a, "title", 2), Some(Value::from("y")));
        assert_eq!(store.item_version(a, 2), Some(2));
    }

    #[test]
    fn test_history_range() {
        let store = Store::default();
        let a = ItemId::new();
        for t in ["a", "b", "c"] {
            commit_title(&store, a, t);
        }
        let history = store.iter_history(1, 3).unwrap();
        assert_eq!(history.iter().map(|c| c.version).collect::<Vec<_>>(), vec![2, 3]);
        assert!(store.iter_history(3, 3).unwrap().is_empty());
    }

    #[test]
    fn test_query_items_by_kind() {
        let store = Store::default();
        let a = ItemId::new();
        commit_title(&store, a, "x");
        assert_eq!(store.query_items(Some("Note"), 1), vec![a]);
        assert!(store.query_items(Some("Folder"), 1).is_empty());
        assert!(store.query_items(None, 0).is_empty());
    }

    #[test]
    fn test_compaction_respects_readers() {
        let store = Store::default();
        let a = ItemId::new();
        for t in ["a", "b", "c", "d"] {
            commit_title(&store, a, t);
        }
        let reader = store.register_reader(2);
        let stats = store.compact(4).unwrap();
        assert_eq!(stats.compacted_to, 2);
        assert_eq!(store.load_value(a, "title", 2), Some(Value::from("b")));
        assert!(matches!(
            store.iter_history(1, 4),
            Err(ItemDbError::HistoryCompacted { .. })
        ));
        store.release_reader(reader);
    }

    #[test]
    fn test_undo_refused_above_reader() {
        let store = Store::default();
        let a = ItemId::new();
        commit_title(&store, a, "a");
        commit_title(&store, a, "b");
        let reader = store.register_reader(2);
        assert!(store.undo(1).is_err());
        store.move_reader(reader, 1);
        store.undo(1).unwrap();
        assert_eq!(store.version(), 1);
        assert_eq!(store.load_value(a, "title", 9), Some(Value::from("a")));
    }

    #[test]
    fn test_children_scan() {
        let store = Store::default();
        let parent = ItemId::new();
        let (x, y) = (ItemId::new(), ItemId::new());
        let mut txn = store.begin("test").unwrap();
        let batch = txn.stage();
        batch.names.push((Some(parent), "b".into(), Some(y)));
        batch.names.push((Some(parent), "a".into(), Some(x)));
        batch.names.push((None, "root".into(), Some(parent)));
        txn.commit(|_| Ok(())).unwrap();
        assert_eq!(
            store.children(Some(parent), 1),
            vec![("a".to_string(), x), ("b".to_string(), y)]
        );
        assert_eq!(store.children(None, 1), vec![("root".to_string(), parent)]);
        assert_eq!(store.resolve_name(Some(parent), "b", 1), Some(y));
    }

    #[test]
    fn test_image_round_trip() {
        let store = Store::default();
        let a = ItemId::new();
        commit_title(&store, a, "x");
        let copy = Store::default();
        copy.restore_image(store.image());
        assert_eq!(copy.version(), 1);
        assert_eq!(copy.load_value(a, "title", 1), Some(Value::from("x")));
        assert_eq!(copy.iter_history(0, 1).unwrap().len(), 1);
    }
}
