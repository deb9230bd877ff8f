//! Commit and cancel
//!
//! A commit first refreshes to the latest version, then takes the store's
//! write lock, stages one record set per dirty item and publishes them as
//! a single version through the write-ahead log sink. A failed commit
//! leaves the view's changes in place.

use super::{name_taken, View, ViewState};
use crate::item::ItemFlags;
use crate::link::Endpoint;
use crate::notify::{Notification, Origin};
use crate::refs::RefValue;
use itemdb_concurrency::{retry_on_deadlock, MergeResolver};
use itemdb_core::{
    CommitBatch, ItemChange, ItemDbError, ItemId, ItemRecord, ItemStatus, RefRecord, Result,
    Version,
};
use itemdb_storage::Transaction;
use std::cell::Cell;
use std::time::Instant;
use tracing::{debug, error, info};

impl View {
    /// Publish every change as one new version.
    ///
    /// Returns `None` when there was nothing to commit.
    pub fn commit(&mut self, resolver: &mut dyn MergeResolver) -> Result<Option<Version>> {
        self.commit_with(resolver, true, |_| {})
    }

    /// [`View::commit`] with control over notifications; `after_commit`
    /// runs with the new version once the commit is visible
    pub fn commit_with<F>(
        &mut self,
        resolver: &mut dyn MergeResolver,
        notify: bool,
        after_commit: F,
    ) -> Result<Option<Version>>
    where
        F: FnOnce(Version),
    {
        self.enter(ViewState::Committing)?;
        let result = self.commit_inner(resolver, notify);
        self.leave();
        if let Ok(Some(version)) = result {
            after_commit(version);
        }
        result
    }

    fn commit_inner(
        &mut self,
        resolver: &mut dyn MergeResolver,
        notify: bool,
    ) -> Result<Option<Version>> {
        let start = Instant::now();
        self.effect_deletes()?;
        self.resolve_stubs()?;
        if !self.is_dirty() {
            return Ok(None);
        }

        let shared = self.shared.clone();
        let store = shared.store.clone();
        let outcome = retry_on_deadlock(&shared.config.retry, "commit", |_| {
            self.refresh_inner(resolver, None, notify)?;
            let mut txn = store.begin(&self.name)?;
            if txn.version() != self.version + 1 {
                self.refresh_inner(resolver, Some(txn.version() - 1), notify)?;
            }
            self.build_batch(&mut txn)?;
            let changes = txn.stage().record.items.clone();
            let logged = Cell::new(false);
            let result = txn.commit(|batch| {
                shared.log(batch)?;
                logged.set(true);
                Ok(())
            });
            if result.is_err() && logged.get() {
                shared.discard_logged();
            }
            result.map(|version| (version, changes))
        });

        let (version, changes) = match outcome {
            Ok(done) => done,
            Err(e) => {
                error!(
                    target: "itemdb::view",
                    view = %self.name,
                    version = self.version,
                    error = %e,
                    "Commit aborted"
                );
                return Err(e);
            }
        };

        let count = self.log.len();
        for id in std::mem::take(&mut self.log) {
            let deleted = self
                .items
                .get(&id)
                .map_or(false, |i| i.flags.contains(ItemFlags::DELETED));
            if deleted {
                self.items.remove(&id);
                continue;
            }
            if let Some(item) = self.items.get_mut(&id) {
                item.clear_dirty(version);
                for (_, slot) in item.refs.iter_mut() {
                    if let RefValue::Collection(c) = slot {
                        c.committed(store.clone(), version);
                    }
                }
            }
        }
        self.logged.clear();
        self.pending_deletes.clear();
        self.names.clear();
        self.set_version(version);
        if notify {
            for change in &changes {
                self.notifications
                    .push_back(Notification::from_change(change, Origin::Local, version));
            }
        }
        self.prune();
        info!(
            target: "itemdb::view",
            view = %self.name,
            version,
            count,
            duration_ms = start.elapsed().as_millis() as u64,
            "Committed"
        );
        Ok(Some(version))
    }

    /// Stage the records of every dirty item, one nested frame per item
    fn build_batch(&mut self, txn: &mut Transaction<'_>) -> Result<()> {
        for id in self.log.clone() {
            txn.begin_nested();
            let staged = self.stage_item(id, txn.stage());
            match staged {
                Ok(()) => txn.commit_nested()?,
                Err(e) => {
                    txn.abort_nested()?;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn stage_item(&mut self, id: ItemId, batch: &mut CommitBatch) -> Result<()> {
        let Some(item) = self.items.get(&id) else {
            return Ok(());
        };
        if item.flags.contains(ItemFlags::DELETED) {
            if item.is_new() {
                return Ok(());
            }
            return self.stage_tombstone(id, batch);
        }
        self.stage_live(id, batch)
    }

    fn stage_tombstone(&self, id: ItemId, batch: &mut CommitBatch) -> Result<()> {
        let store = &self.shared.store;
        let Some((_, base)) = store.load_item(id, self.version) else {
            return Ok(());
        };
        for name in &base.values {
            batch.values.push((id, name.clone(), None));
        }
        for name in &base.refs {
            if let Some(RefRecord::Collection(header)) = store.load_ref(id, name, self.version) {
                for (member, _) in store.load_links(id, name, self.version) {
                    batch.links.push((id, name.clone(), member, None));
                }
                for (index, _) in header.indexes {
                    batch.indexes.push((id, name.clone(), index, None));
                }
            }
            batch.refs.push((id, name.clone(), None));
        }
        for name in &base.acls {
            batch.acls.push((id, name.clone(), None));
        }
        if let Some(name) = &base.name {
            if store.resolve_name(base.parent, name, self.version) == Some(id) {
                batch.names.push((base.parent, name.clone(), None));
            }
        }
        let record = ItemRecord {
            kind: base.kind.clone(),
            name: base.name.clone(),
            parent: base.parent,
            status: ItemStatus::DELETED,
            values: Vec::new(),
            refs: Vec::new(),
            acls: Vec::new(),
        };
        batch.record.items.push(ItemChange {
            item: id,
            kind: base.kind,
            status: ItemStatus::DELETED,
            values: base.values,
            refs: base.refs,
        });
        batch.items.push((id, record));
        Ok(())
    }

    fn stage_live(&mut self, id: ItemId, batch: &mut CommitBatch) -> Result<()> {
        let store = self.shared.store.clone();
        let version = self.version;
        let item = self.items.get_mut(&id).ok_or(ItemDbError::NoSuchItem(id))?;

        let mut values = Vec::new();
        for (name, value) in item.values.iter_dirty() {
            values.push(name.to_string());
            batch.values.push((id, name.to_string(), value.cloned()));
        }

        let mut refs = Vec::new();
        let dirty_refs: Vec<String> = item.refs.dirty_names().iter().cloned().collect();
        for name in dirty_refs {
            let record = match item.refs.get_mut_clean(&name) {
                None | Some(RefValue::Empty) => RefRecord::None,
                Some(RefValue::Single(link)) => match link.peer().resolved() {
                    Some(peer) => RefRecord::Single(peer),
                    None => {
                        return Err(ItemDbError::DanglingReference {
                            item: id,
                            attribute: name,
                            target: match link.peer() {
                                Endpoint::Deferred(stub) => stub.to_string(),
                                Endpoint::Resolved(peer) => peer.to_string(),
                            },
                        })
                    }
                },
                Some(RefValue::Collection(c)) => {
                    for (member, link) in c.changed_links() {
                        batch.links.push((id, name.clone(), member, link));
                    }
                    for (index, record) in c.changed_indexes() {
                        batch.indexes.push((id, name.clone(), index, record));
                    }
                    RefRecord::Collection(c.header())
                }
            };
            batch.refs.push((id, name.clone(), Some(record)));
            refs.push(name);
        }

        if item.name != item.base_name || item.parent != item.base_parent || item.is_new() {
            if let Some(base) = &item.base_name {
                if !item.is_new() && store.resolve_name(item.base_parent, base, version) == Some(id) {
                    batch.names.push((item.base_parent, base.clone(), None));
                }
            }
            if let Some(name) = &item.name {
                if let Some(holder) = store.resolve_name(item.parent, name, version) {
                    let vacated = batch
                        .names
                        .iter()
                        .any(|(p, n, v)| *p == item.parent && n == name && v.is_none());
                    if holder != id && !vacated && !self.logged.contains(&holder) {
                        return Err(name_taken(name, holder));
                    }
                }
                batch.names.push((item.parent, name.clone(), Some(id)));
            }
        }

        for name in &item.dirty_acls {
            let acl = item.acls.get(name).cloned().flatten();
            batch.acls.push((id, name.clone(), acl));
        }

        let status = item.status();
        batch.items.push((
            id,
            ItemRecord {
                kind: item.kind.clone(),
                name: item.name.clone(),
                parent: item.parent,
                status,
                values: item.values.persistent_names(),
                refs: item.refs.names(),
                acls: item.acl_names.iter().cloned().collect(),
            },
        ));
        batch.record.items.push(ItemChange {
            item: id,
            kind: item.kind.clone(),
            status,
            values,
            refs,
        });
        Ok(())
    }

    /// Throw away every uncommitted change
    pub fn cancel(&mut self) -> Result<()> {
        self.ensure_open()?;
        let log = std::mem::take(&mut self.log);
        self.logged.clear();
        self.pending_deletes.clear();
        self.names.clear();
        let count = log.len();
        let mut reload = Vec::new();
        for id in log {
            if let Some(item) = self.items.remove(&id) {
                if item.is_pinned() && !item.is_new() {
                    reload.push(id);
                }
            }
        }
        for id in reload {
            if self.load(id)? {
                if let Some(item) = self.items.get_mut(&id) {
                    item.flags |= ItemFlags::PINNED;
                }
            }
        }
        debug!(target: "itemdb::view", view = %self.name, count, "Cancelled changes");
        Ok(())
    }
}
