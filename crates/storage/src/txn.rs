//! Write transactions
//!
//! A [`Transaction`] owns the store's write lock for its lifetime and stages
//! records into frames. Nested frames fold into their parent on commit and
//! vanish on abort; the top-level commit publishes everything as one
//! version or nothing at all.

use crate::store::Store;
use itemdb_core::{CommitBatch, ItemDbError, Result, Version};
use parking_lot::MutexGuard;
use tracing::debug;

/// Proof that the store's write lock is held
pub struct WriteLock<'a> {
    store: &'a Store,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> WriteLock<'a> {
    pub(crate) fn new(store: &'a Store, guard: MutexGuard<'a, ()>) -> Self {
        Self {
            store,
            _guard: guard,
        }
    }

    /// Store version while the lock is held; cannot move until released
    pub fn version(&self) -> Version {
        self.store.version()
    }
}

/// Staged write transaction for the store's next version
pub struct Transaction<'a> {
    lock: WriteLock<'a>,
    frames: Vec<CommitBatch>,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(lock: WriteLock<'a>, view: &str) -> Self {
        let version = lock.version() + 1;
        Self {
            lock,
            frames: vec![CommitBatch::new(version, view)],
        }
    }

    /// Version this transaction will publish
    pub fn version(&self) -> Version {
        self.lock.version() + 1
    }

    /// Nesting depth; 1 for a top-level transaction
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Records staged in the innermost frame
    pub fn stage(&mut self) -> &mut CommitBatch {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    /// Open a nested frame
    pub fn begin_nested(&mut self) {
        let version = self.version();
        let view = self.frames[0].record.view.clone();
        self.frames.push(CommitBatch::new(version, view));
    }

    /// Fold the innermost frame into its parent
    pub fn commit_nested(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(ItemDbError::InvalidOperation("no nested transaction to commit".into()));
        }
        let Some(inner) = self.frames.pop() else {
            return Ok(());
        };
        let outer = self.stage();
        outer.record.items.extend(inner.record.items);
        outer.items.extend(inner.items);
        outer.values.extend(inner.values);
        outer.refs.extend(inner.refs);
        outer.links.extend(inner.links);
        outer.indexes.extend(inner.indexes);
        outer.names.extend(inner.names);
        outer.acls.extend(inner.acls);
        Ok(())
    }

    /// Discard the innermost frame
    pub fn abort_nested(&mut self) -> Result<()> {
        if self.frames.len() < 2 {
            return Err(ItemDbError::InvalidOperation("no nested transaction to abort".into()));
        }
        self.frames.pop();
        Ok(())
    }

    /// Publish every staged record as one version.
    ///
    /// `sink` runs first (normally the write-ahead log append). On any error
    /// nothing is applied and the store stays at its previous version.
    pub fn commit<F>(mut self, sink: F) -> Result<Version>
    where
        F: FnOnce(&CommitBatch) -> Result<()>,
    {
        if self.frames.len() != 1 {
            return Err(ItemDbError::InvalidOperation(format!(
                "commit with {} nested transactions open",
                self.frames.len() - 1
            )));
        }
        let batch = match self.frames.pop() {
            Some(batch) => batch,
            None => return Err(ItemDbError::InvalidOperation("empty transaction".into())),
        };
        let store = self.lock.store;
        store.publish(&self.lock, batch, sink)
    }

    /// Drop every staged record and release the lock
    pub fn abort(self) {
        debug!(target: "itemdb::store", version = self.version(), "Transaction aborted");
    }
}

#[cfg(test)]
mod tests {
    use crate::faults::FailPoint;
    use crate::store::{Store, StoreConfig};
    use itemdb_core::{ItemDbError, ItemId, ItemRecord, Value};
    use std::time::Duration;

    #[test]
    fn test_nested_commit_folds_into_parent() {
        let store = Store::default();
        let a = ItemId::new();
        let mut txn = store.begin("t").unwrap();
        txn.begin_nested();
        txn.stage().values.push((a, "x".into(), Some(Value::Int(1))));
        txn.commit_nested().unwrap();
        txn.begin_nested();
        txn.stage().values.push((a, "y".into(), Some(Value::Int(2))));
        txn.abort_nested().unwrap();
        txn.stage().items.push((a, ItemRecord::default()));
        assert_eq!(txn.depth(), 1);
        assert_eq!(txn.commit(|_| Ok(())).unwrap(), 1);
        assert_eq!(store.load_value(a, "x", 1), Some(Value::Int(1)));
        assert_eq!(store.load_value(a, "y", 1), None);
    }

    #[test]
    fn test_commit_with_open_nested_fails() {
        let store = Store::default();
        let mut txn = store.begin("t").unwrap();
        txn.begin_nested();
        assert!(txn.commit(|_| Ok(())).is_err());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn test_sink_failure_applies_nothing() {
        let store = Store::default();
        let a = ItemId::new();
        let mut txn = store.begin("t").unwrap();
        txn.stage().values.push((a, "x".into(), Some(Value::Int(1))));
        let err = txn
            .commit(|_| Err(ItemDbError::Storage("disk full".into())))
            .unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(store.version(), 0);
        assert_eq!(store.load_value(a, "x", 1), None);
    }

    #[test]
    fn test_injected_failure_after_log() {
        let store = Store::default();
        store.faults().fail_next_commit(FailPoint::AfterLog);
        let mut logged = false;
        let mut txn = store.begin("t").unwrap();
        txn.stage().items.push((ItemId::new(), ItemRecord::default()));
        assert!(txn
            .commit(|_| {
                logged = true;
                Ok(())
            })
            .is_err());
        assert!(logged);
        assert_eq!(store.version(), 0);
        assert_eq!(store.commit_log_len(), 0);
    }

    #[test]
    fn test_lock_timeout_reports_deadlock() {
        let store = Store::new(StoreConfig {
            lock_timeout: Duration::from_millis(20),
        });
        let _held = store.lock_for_write().unwrap();
        assert!(matches!(store.begin("t"), Err(ItemDbError::Deadlock)));
    }

    #[test]
    fn test_injected_deadlock() {
        let store = Store::default();
        store.faults().inject_deadlocks(1);
        assert!(matches!(store.begin("t"), Err(ItemDbError::Deadlock)));
        assert!(store.begin("t").is_ok());
    }
}
