//! Refresh and merge
//!
//! Refresh moves a view to a newer version. Every item the intervening
//! commits touched is either a clean advance (unloaded, read again on next
//! access) or a merge candidate (dirty here too). Merge candidates are
//! compared field by field; each overlap goes through
//! [`itemdb_concurrency::dispatch`]. The candidate is then rebased: loaded
//! fresh at the target version and its local changes replayed on top
//! through the same attach/detach operations user code goes through, so
//! both ends of every reference stay in step.
//!
//! Any failure puts the view back exactly where it was.

use super::{View, ViewState};
use crate::item::ItemFlags;
use crate::link::Endpoint;
use crate::notify::{Notification, Origin};
use crate::refs::RefValue;
use crate::values::{SetMode, ValueChanges, ValueEntry};
use itemdb_concurrency::{
    dispatch, plan_merge, ChangeSet, Conflict, ConflictSite, ItemDiff, MergeResolver, MergeValue,
};
use itemdb_core::{
    Acl, IndexKind, ItemDbError, ItemId, LinkRecord, MergeReason, RefRecord, Result, Value,
    Version,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// A resolved conflict
struct Choice {
    reason: MergeReason,
    attribute: String,
    value: MergeValue,
    incoming: MergeValue,
}

impl Choice {
    fn keeps_incoming(&self) -> bool {
        self.value == self.incoming
    }
}

#[derive(Default)]
struct Merges {
    chosen: HashMap<ItemId, Vec<Choice>>,
}

impl Merges {
    fn record(&mut self, item: ItemId, conflict: &Conflict, value: MergeValue) {
        self.chosen.entry(item).or_default().push(Choice {
            reason: conflict.reason,
            attribute: conflict.attribute.clone(),
            value,
            incoming: conflict.incoming.clone(),
        });
    }

    /// Latest choice for `item` matching one of `reasons` on `attribute`
    fn get(&self, item: ItemId, reasons: &[MergeReason], attribute: &str) -> Option<&Choice> {
        self.chosen.get(&item)?.iter().rev().find(|c| {
            reasons.contains(&c.reason) && c.attribute == attribute
        })
    }

    fn count(&self) -> usize {
        self.chosen.values().map(Vec::len).sum()
    }
}

struct SingleIntent {
    attribute: String,
    other_name: String,
    target: Option<Endpoint>,
}

struct MemberIntent {
    key: ItemId,
    present: bool,
    alias: Option<String>,
    after: Option<ItemId>,
    moved: bool,
}

struct CollectionIntent {
    attribute: String,
    other_name: String,
    members: Vec<MemberIntent>,
    indexes: Vec<(String, IndexKind, bool)>,
}

/// Local changes of one item, replayed after it is loaded again
struct LocalIntent {
    values: ValueChanges,
    transient: Vec<(String, ValueEntry)>,
    singles: Vec<SingleIntent>,
    collections: Vec<CollectionIntent>,
    name: Option<String>,
    parent: Option<ItemId>,
    renamed: bool,
    moved: bool,
    acls: Vec<(String, Option<Acl>)>,
    deleted: bool,
    deferred: bool,
    pinned: bool,
}

impl View {
    /// Move to the latest version, merging with `resolver`
    pub fn refresh(&mut self, resolver: &mut dyn MergeResolver) -> Result<Version> {
        self.refresh_to(resolver, None, true)
    }

    /// Move to `target` (latest when `None`). With `notify`, one
    /// notification per changed item and version is queued.
    ///
    /// The versions in between are merged as one batch: local changes are
    /// compared against the state at `target`, never against intermediate
    /// commits. A value another view wrote and later reverted to the local
    /// one is therefore not a conflict. Notifications still name each
    /// version.
    pub fn refresh_to(
        &mut self,
        resolver: &mut dyn MergeResolver,
        target: Option<Version>,
        notify: bool,
    ) -> Result<Version> {
        self.enter(ViewState::Refreshing)?;
        let result = self.refresh_inner(resolver, target, notify);
        self.leave();
        result
    }

    pub(crate) fn refresh_inner(
        &mut self,
        resolver: &mut dyn MergeResolver,
        target: Option<Version>,
        notify: bool,
    ) -> Result<Version> {
        let latest = self.shared.store.version();
        let target = target.unwrap_or(latest).min(latest);
        if target == self.version {
            return Ok(target);
        }
        if target < self.version {
            self.rewind(target)?;
            return Ok(target);
        }
        let saved = self.save();
        match self.advance(resolver, target, notify) {
            Ok(()) => Ok(target),
            Err(e) => {
                debug!(
                    target: "itemdb::view",
                    view = %self.name,
                    version = self.version,
                    error = %e,
                    "Refresh failed; view restored"
                );
                self.restore(saved);
                Err(e)
            }
        }
    }

    /// The store is behind the view: drop everything read above `target`
    fn rewind(&mut self, target: Version) -> Result<()> {
        if self.is_dirty() {
            return Err(ItemDbError::InvalidOperation(format!(
                "view '{}' has uncommitted changes and cannot move back to {}",
                self.name, target
            )));
        }
        let stale: Vec<ItemId> = self
            .items
            .values()
            .filter(|i| i.version > target)
            .map(|i| i.id)
            .collect();
        for id in &stale {
            self.unload(*id);
        }
        self.names.clear();
        let from = self.version;
        self.set_version(target);
        for item in self.items.values_mut() {
            for (_, slot) in item.refs.iter_mut() {
                if let RefValue::Collection(c) = slot {
                    c.rebase_source(target);
                }
            }
        }
        debug!(
            target: "itemdb::view",
            view = %self.name,
            from,
            to = target,
            count = stale.len(),
            "Rewound view"
        );
        Ok(())
    }

    fn advance(&mut self, resolver: &mut dyn MergeResolver, target: Version, notify: bool) -> Result<()> {
        let store = self.shared.store.clone();
        let from = self.version;
        let records = store.iter_history(from, target)?;
        let mut remote = ChangeSet::new();
        for record in &records {
            remote.absorb_record(record);
        }

        // conflicts, decided before anything moves
        let mut merges = Merges::default();
        let mut dropped: HashSet<(ItemId, String, ItemId)> = HashSet::new();
        for id in self.log.clone() {
            let Some(theirs) = remote.get(&id) else {
                continue;
            };
            match self.items.get(&id) {
                Some(item) if !item.is_new() => {}
                _ => continue,
            }
            let mut theirs = theirs.clone();
            self.fill_remote(id, &mut theirs, from, target);
            let mine = self.local_diff(id);
            let plan = plan_merge(&mine, &theirs, |name| self.is_collection(id, name));
            for site in plan.conflicts {
                let conflict = self.conflict(id, &site, target)?;
                let stub = self
                    .items
                    .get(&id)
                    .and_then(|i| i.refs.get(&site.attribute))
                    .and_then(RefValue::endpoint)
                    .map_or(false, Endpoint::is_deferred);
                let agreed = matches!(site.reason, MergeReason::Value | MergeReason::Ref)
                    && conflict.local == conflict.incoming
                    && !stub;
                if agreed {
                    merges.record(id, &conflict, conflict.incoming.clone());
                    continue;
                }
                let chosen = dispatch(&self.shared.merges, resolver, &conflict)?;
                debug!(
                    target: "itemdb::view",
                    item = %id,
                    reason = %site.reason,
                    attribute = %site.attribute,
                    "Merged conflict"
                );
                if site.reason == MergeReason::Ref && chosen == conflict.incoming {
                    if let MergeValue::Ref(Some(local_peer)) = conflict.local {
                        if let Ok(spec) = self.ref_spec(id, &site.attribute) {
                            dropped.insert((local_peer, spec.other_name, id));
                        }
                    }
                }
                merges.record(id, &conflict, chosen);
            }
        }
        self.name_collisions(from, target, resolver, &mut merges)?;

        // split changed items into clean advances and rebases
        let changed: Vec<(ItemId, bool)> = remote
            .iter()
            .filter(|(id, _)| self.items.contains_key(id))
            .map(|(id, diff)| (*id, diff.deleted))
            .collect();
        let mut rebase = Vec::new();
        let mut reload = Vec::new();
        let mut gone = HashSet::new();
        for (id, deleted) in changed {
            let pinned = self.items.get(&id).map_or(false, |i| i.is_pinned());
            if !self.logged.contains(&id) {
                self.unload(id);
                if pinned && !deleted {
                    reload.push(id);
                }
                continue;
            }
            if deleted {
                self.detach_local_peers(id)?;
                gone.insert(id);
                self.forget(id);
                continue;
            }
            rebase.push((id, self.capture(id)?));
        }

        self.set_version(target);
        for (id, _) in &rebase {
            self.items.remove(id);
        }
        for item in self.items.values_mut() {
            for (_, slot) in item.refs.iter_mut() {
                if let RefValue::Collection(c) = slot {
                    c.rebase_source(target);
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
        let rebased = rebase.len();
        for (id, intent) in rebase {
            self.replay(id, intent, &merges, &gone, &dropped)?;
        }
        self.apply_new_names(&merges);
        self.rebuild_names();
        self.trim_log();

        if notify {
            for record in &records {
                for change in &record.items {
                    self.notifications.push_back(Notification::from_change(
                        change,
                        Origin::Remote,
                        record.version,
                    ));
                }
            }
        }
        debug!(
            target: "itemdb::view",
            view = %self.name,
            from,
            version = target,
            count = remote.len(),
            rebased,
            merged = merges.count(),
            "Refreshed view"
        );
        Ok(())
    }

    // ========================================================================
    // Diffs
    // ========================================================================

    fn is_collection(&self, id: ItemId, attribute: &str) -> bool {
        let kind = self.items.get(&id).and_then(|i| i.kind.clone());
        self.shared
            .schema
            .attribute(kind.as_deref(), attribute)
            .map_or(false, |d| d.is_collection())
    }

    fn local_diff(&self, id: ItemId) -> ItemDiff {
        let Some(item) = self.items.get(&id) else {
            return ItemDiff::default();
        };
        let mut diff = ItemDiff {
            kind: item.kind.clone(),
            created: item.is_new(),
            deleted: item.is_deleted(),
            values: item.values.dirty_names(),
            refs: item.refs.dirty_names().clone(),
            renamed: item.renamed(),
            moved: item.moved(),
            acls: !item.dirty_acls.is_empty(),
            ..Default::default()
        };
        for name in item.refs.dirty_names() {
            if let Some(RefValue::Collection(c)) = item.refs.get(name) {
                diff.members.insert(name.clone(), c.touched().clone());
                if c.has_index_edits() {
                    diff.index_edits.insert(name.clone());
                }
            }
        }
        diff
    }

    /// Add what the commit log does not carry: names, parents and the
    /// collection members that changed
    fn fill_remote(&self, id: ItemId, theirs: &mut ItemDiff, from: Version, target: Version) {
        let store = &self.shared.store;
        let before = store.load_item(id, from).map(|(_, r)| r);
        let after = store.load_item(id, target).map(|(_, r)| r);
        if let (Some(b), Some(a)) = (&before, &after) {
            if b.name != a.name {
                theirs.renamed = a.name.clone();
            }
            if b.parent != a.parent {
                theirs.moved = Some(a.parent);
            }
        }
        let collections: Vec<String> = theirs
            .refs
            .iter()
            .filter(|name| self.is_collection(id, name))
            .cloned()
            .collect();
        for name in collections {
            let old: HashMap<ItemId, LinkRecord> =
                store.load_links(id, &name, from).into_iter().collect();
            let new: HashMap<ItemId, LinkRecord> =
                store.load_links(id, &name, target).into_iter().collect();
            let mut members = BTreeSet::new();
            for key in old.keys().chain(new.keys()) {
                let alias_before = old.get(key).map(|l| &l.alias);
                let alias_after = new.get(key).map(|l| &l.alias);
                if alias_before != alias_after {
                    members.insert(*key);
                }
            }
            // a member kept on both sides was moved when its kept predecessor changed
            let survives = |k: &ItemId| old.contains_key(k) && new.contains_key(k);
            for key in old.keys().filter(|k| new.contains_key(k)) {
                if surviving_prev(&old, *key, survives) != surviving_prev(&new, *key, survives) {
                    members.insert(*key);
                }
            }
            theirs.members.insert(name, members);
        }
    }

    fn conflict(&self, id: ItemId, site: &ConflictSite, target: Version) -> Result<Conflict> {
        let item = self.items.get(&id).ok_or(ItemDbError::NoSuchItem(id))?;
        let store = &self.shared.store;
        let remote = store.load_item(id, target).map(|(_, r)| r);
        let attribute = site.attribute.as_str();
        let (local, incoming) = match site.reason {
            MergeReason::Value => (
                MergeValue::Value(item.values.get(attribute).cloned()),
                MergeValue::Value(store.load_value(id, attribute, target)),
            ),
            MergeReason::Ref => (
                MergeValue::Ref(item.refs.get(attribute).and_then(RefValue::single)),
                MergeValue::Ref(match store.load_ref(id, attribute, target) {
                    Some(RefRecord::Single(peer)) => Some(peer),
                    _ => None,
                }),
            ),
            MergeReason::Rename | MergeReason::Name => (
                MergeValue::Name(item.name.clone().unwrap_or_default()),
                MergeValue::Name(remote.and_then(|r| r.name).unwrap_or_default()),
            ),
            MergeReason::Move => (
                MergeValue::Parent(item.parent),
                MergeValue::Parent(remote.and_then(|r| r.parent)),
            ),
            MergeReason::Delete => (MergeValue::Changed, MergeValue::Deleted),
            MergeReason::Change => (MergeValue::Deleted, MergeValue::Changed),
            MergeReason::Collection => (MergeValue::Changed, MergeValue::Changed),
        };
        Ok(Conflict {
            reason: site.reason,
            item: id,
            kind: item.kind.clone(),
            attribute: site.attribute.clone(),
            local,
            incoming,
        })
    }

    /// Names taken by other items in the versions being absorbed
    fn name_collisions(
        &mut self,
        from: Version,
        target: Version,
        resolver: &mut dyn MergeResolver,
        merges: &mut Merges,
    ) -> Result<()> {
        let store = self.shared.store.clone();
        for id in self.log.clone() {
            let (name, parent) = match self.items.get(&id) {
                Some(item)
                    if !item.is_deleted()
                        && (item.is_new() || item.renamed().is_some() || item.moved().is_some()) =>
                {
                    match &item.name {
                        Some(name) => (name.clone(), item.parent),
                        None => continue,
                    }
                }
                _ => continue,
            };
            let Some(holder) = store.resolve_name(parent, &name, target) else {
                continue;
            };
            if holder == id || store.resolve_name(parent, &name, from) == Some(holder) {
                continue;
            }
            if let Some(h) = self.items.get(&holder) {
                let vacated = h.is_deleted() || h.name.as_deref() != Some(name.as_str()) || h.parent != parent;
                if self.logged.contains(&holder) && vacated {
                    continue;
                }
            }
            let conflict = Conflict {
                reason: MergeReason::Name,
                item: id,
                kind: self.items.get(&id).and_then(|i| i.kind.clone()),
                attribute: "name".into(),
                local: MergeValue::Name(name.clone()),
                incoming: MergeValue::Name(name),
            };
            let chosen = dispatch(&self.shared.merges, resolver, &conflict)?;
            merges.record(id, &conflict, chosen);
        }
        Ok(())
    }

    // ========================================================================
    // Rebase
    // ========================================================================

    /// Detach dirty cached peers from an item deleted by another view
    fn detach_local_peers(&mut self, id: ItemId) -> Result<()> {
        let shared = self.shared.clone();
        let mut peers = Vec::new();
        if let Some(item) = self.items.get_mut(&id) {
            let kind = item.kind.clone();
            for (name, slot) in item.refs.iter_mut() {
                let Some(other) = shared
                    .schema
                    .attribute(kind.as_deref(), name)
                    .and_then(|d| d.other_name())
                else {
                    continue;
                };
                match slot {
                    RefValue::Single(link) => {
                        if let Some(peer) = link.peer().resolved() {
                            peers.push((peer, other.to_string()));
                        }
                    }
                    RefValue::Collection(c) => {
                        for peer in c.keys()? {
                            peers.push((peer, other.to_string()));
                        }
                    }
                    RefValue::Empty => {}
                }
            }
        }
        for (peer, other) in peers {
            if self.items.contains_key(&peer) && self.logged.contains(&peer) {
                self.detach_reverse(peer, &other, id)?;
            }
        }
        Ok(())
    }

    fn capture(&mut self, id: ItemId) -> Result<LocalIntent> {
        let shared = self.shared.clone();
        let version = self.version;
        let item = self.items.get_mut(&id).ok_or(ItemDbError::NoSuchItem(id))?;
        let kind = item.kind.clone();
        let mut singles = Vec::new();
        let mut collections = Vec::new();
        let dirty_refs: Vec<String> = item.refs.dirty_names().iter().cloned().collect();
        for attribute in dirty_refs {
            let Some(def) = shared.schema.attribute(kind.as_deref(), &attribute) else {
                continue;
            };
            let Some(other) = def.other_name().map(str::to_string) else {
                continue;
            };
            match item.refs.get_mut_clean(&attribute) {
                Some(RefValue::Collection(c)) => {
                    // replayed in local base order so every `after` lands first
                    let position: HashMap<ItemId, usize> = c
                        .keys()?
                        .into_iter()
                        .enumerate()
                        .map(|(i, key)| (key, i))
                        .collect();
                    let mut touched: Vec<ItemId> = c.touched().iter().copied().collect();
                    touched.sort_by_key(|key| position.get(key).copied().unwrap_or(usize::MAX));
                    let mut members = Vec::new();
                    for key in touched {
                        let present = c.contains(key);
                        let (alias, after) = if present {
                            (c.alias_of(key)?, c.previous(key)?)
                        } else {
                            (None, None)
                        };
                        let moved = present
                            && shared
                                .store
                                .load_link(id, &attribute, key, version)
                                .map_or(false, |base| base.prev != after);
                        members.push(MemberIntent {
                            key,
                            present,
                            alias,
                            after,
                            moved,
                        });
                    }
                    let mut indexes = Vec::new();
                    for name in c.index_names() {
                        let index = c.index(&name)?;
                        indexes.push((name, index.kind().clone(), index.descending()));
                    }
                    collections.push(CollectionIntent {
                        attribute,
                        other_name: other,
                        members,
                        indexes,
                    });
                }
                Some(RefValue::Single(link)) => singles.push(SingleIntent {
                    attribute,
                    other_name: other,
                    target: Some(link.peer().clone()),
                }),
                Some(RefValue::Empty) | None if !def.is_collection() => {
                    singles.push(SingleIntent {
                        attribute,
                        other_name: other,
                        target: None,
                    })
                }
                _ => {}
            }
        }
        Ok(LocalIntent {
            values: item.values.collect_changes(),
            transient: item.values.transient_entries(),
            singles,
            collections,
            name: item.name.clone(),
            parent: item.parent,
            renamed: item.renamed().is_some() || (item.name.is_none() && item.base_name.is_some()),
            moved: item.moved().is_some(),
            acls: item
                .dirty_acls
                .iter()
                .map(|n| (n.clone(), item.acls.get(n).cloned().flatten()))
                .collect(),
            deleted: item.is_deleted(),
            deferred: item.flags.contains(ItemFlags::DEFERRED),
            pinned: item.is_pinned(),
        })
    }

    fn replay(
        &mut self,
        id: ItemId,
        intent: LocalIntent,
        merges: &Merges,
        gone: &HashSet<ItemId>,
        dropped: &HashSet<(ItemId, String, ItemId)>,
    ) -> Result<()> {
        if !self.load(id)? {
            return Err(ItemDbError::NoSuchItem(id));
        }
        if intent.deleted && !intent.deferred {
            if let Some(c) = merges.get(id, &[MergeReason::Change], "item") {
                if c.value == MergeValue::Changed {
                    return Err(ItemDbError::merge(
                        MergeReason::Change,
                        id,
                        "item",
                        "an item deleted in this view cannot take the other change",
                    ));
                }
            }
            return self.delete_one(id);
        }

        if let Some(item) = self.items.get_mut(&id) {
            for (name, entry) in intent.transient {
                item.values.set(&name, entry.value, SetMode::Loading, entry.flags);
            }
        }

        for (name, local) in intent.values {
            let value = match merges.get(id, &[MergeReason::Value], &name) {
                Some(c) if c.keeps_incoming() => continue,
                Some(Choice {
                    value: MergeValue::Value(v),
                    ..
                }) => v.clone(),
                _ => local,
            };
            self.replay_value(id, &name, value)?;
        }

        for single in intent.singles {
            let target = match merges.get(id, &[MergeReason::Ref], &single.attribute) {
                Some(c) if c.keeps_incoming() => {
                    if let Some(Endpoint::Resolved(local_peer)) = single.target {
                        if MergeValue::Ref(Some(local_peer)) != c.incoming {
                            self.detach_reverse(local_peer, &single.other_name, id)?;
                        }
                    }
                    continue;
                }
                Some(Choice {
                    value: MergeValue::Ref(t),
                    ..
                }) => t.map(Endpoint::Resolved),
                _ => single.target,
            };
            match target {
                None => self.assign_single(id, &single.attribute, &single.other_name, None)?,
                Some(Endpoint::Resolved(peer)) if gone.contains(&peer) => {
                    self.assign_single(id, &single.attribute, &single.other_name, None)?
                }
                Some(Endpoint::Resolved(peer)) => {
                    self.assign_single(id, &single.attribute, &single.other_name, Some(peer))?
                }
                Some(Endpoint::Deferred(stub)) => self.set_ref_stub(id, &single.attribute, stub)?,
            }
        }

        for coll in intent.collections {
            self.replay_collection(id, coll, gone, dropped)?;
        }

        let (current_name, current_parent) = match self.items.get(&id) {
            Some(item) => (item.name.clone(), item.parent),
            None => return Err(ItemDbError::NoSuchItem(id)),
        };
        let mut name = if intent.renamed {
            intent.name
        } else {
            current_name.clone()
        };
        let mut parent = if intent.moved {
            intent.parent
        } else {
            current_parent
        };
        if let Some(Choice {
            value: MergeValue::Name(n),
            ..
        }) = merges.get(id, &[MergeReason::Rename, MergeReason::Name], "name")
        {
            name = Some(n.clone());
        }
        if let Some(Choice {
            value: MergeValue::Parent(p),
            ..
        }) = merges.get(id, &[MergeReason::Move], "parent")
        {
            parent = *p;
        }
        if name != current_name || parent != current_parent {
            if let Some(item) = self.items.get_mut(&id) {
                item.name = name;
                item.parent = parent;
            }
            self.mark_dirty(id, ItemFlags::NDIRTY);
        }

        if !intent.acls.is_empty() {
            if let Some(item) = self.items.get_mut(&id) {
                for (name, acl) in intent.acls {
                    if acl.is_some() {
                        item.acl_names.insert(name.clone());
                    } else {
                        item.acl_names.remove(&name);
                    }
                    item.acls.insert(name.clone(), acl);
                    item.dirty_acls.insert(name);
                }
            }
            self.mark_dirty(id, ItemFlags::ADIRTY);
        }

        if intent.deferred {
            let keep = matches!(
                merges.get(id, &[MergeReason::Change], "item"),
                Some(c) if c.value == MergeValue::Changed
            );
            if keep {
                self.pending_deletes.retain(|p| *p != id);
            } else {
                self.mark_dirty(id, ItemFlags::DEFERRED);
            }
        }
        if intent.pinned {
            if let Some(item) = self.items.get_mut(&id) {
                item.flags |= ItemFlags::PINNED;
            }
        }
        Ok(())
    }

    fn replay_value(&mut self, id: ItemId, name: &str, value: Option<Value>) -> Result<()> {
        let changed = match self.items.get_mut(&id) {
            Some(item) => match value {
                Some(v) => {
                    let flags = item.values.entry(name).map(|e| e.flags).unwrap_or_default();
                    item.values.set(name, v, SetMode::Dirty, flags)
                }
                None => item.values.remove(name, SetMode::Dirty).is_some(),
            },
            None => false,
        };
        if changed {
            self.mark_dirty(id, ItemFlags::VDIRTY);
            self.reposition_in_watchers(id, name)?;
        }
        Ok(())
    }

    fn replay_collection(
        &mut self,
        id: ItemId,
        intent: CollectionIntent,
        gone: &HashSet<ItemId>,
        dropped: &HashSet<(ItemId, String, ItemId)>,
    ) -> Result<()> {
        let attribute = intent.attribute.as_str();
        let other = intent.other_name.as_str();
        for (name, kind, descending) in intent.indexes {
            let present = self.read_collection(id, attribute)?.index_kind(&name).is_some();
            if !present {
                self.collection_for_write(id, attribute, other)?
                    .add_index(&name, kind, descending)?;
                self.mark_dirty(id, ItemFlags::RDIRTY);
                self.resort(id, attribute, None, Some(&name))?;
            }
        }
        for member in intent.members {
            if gone.contains(&member.key)
                || dropped.contains(&(id, attribute.to_string(), member.key))
            {
                continue;
            }
            let contains = self.read_collection(id, attribute)?.contains(member.key);
            if member.present {
                if !contains {
                    if !self.load(member.key)? {
                        continue;
                    }
                    let placement = match member.after {
                        None => crate::collection::Placement::First,
                        Some(a) if self.read_collection(id, attribute)?.contains(a) => {
                            crate::collection::Placement::After(a)
                        }
                        Some(_) => crate::collection::Placement::Last,
                    };
                    self.add_member(id, attribute, other, member.key, placement, member.alias.as_deref())?;
                    continue;
                }
                let coll = self.read_collection(id, attribute)?;
                let after = match member.after {
                    _ if !member.moved => None,
                    Some(a) if a == member.key || !coll.contains(a) => None,
                    wanted => Some(wanted),
                };
                if let Some(after) = after {
                    if coll.previous(member.key)? != after {
                        self.collection_for_write(id, attribute, other)?
                            .place(member.key, after)?;
                        self.mark_dirty(id, ItemFlags::RDIRTY);
                    }
                }
                if self.read_collection(id, attribute)?.alias_of(member.key)? != member.alias {
                    self.collection_for_write(id, attribute, other)?
                        .set_alias(member.key, member.alias.as_deref())?;
                    self.mark_dirty(id, ItemFlags::RDIRTY);
                }
            } else if contains {
                self.remove_member(id, attribute, other, member.key)?;
            }
        }
        Ok(())
    }

    fn apply_new_names(&mut self, merges: &Merges) {
        let renames: Vec<(ItemId, String)> = merges
            .chosen
            .iter()
            .flat_map(|(id, choices)| {
                choices.iter().filter_map(move |c| match (&c.reason, &c.value) {
                    (MergeReason::Name, MergeValue::Name(n)) => Some((*id, n.clone())),
                    _ => None,
                })
            })
            .collect();
        for (id, name) in renames {
            let changed = match self.items.get_mut(&id) {
                Some(item) if item.name.as_deref() != Some(name.as_str()) => {
                    item.name = Some(name);
                    true
                }
                _ => false,
            };
            if changed {
                self.mark_dirty(id, ItemFlags::NDIRTY);
            }
        }
    }

    /// Recompute the name overlay from the dirty items
    pub(crate) fn rebuild_names(&mut self) {
        let store = self.shared.store.clone();
        self.names.clear();
        let mut added = Vec::new();
        for id in &self.log {
            let Some(item) = self.items.get(id) else {
                continue;
            };
            let deleted = item.flags.contains(ItemFlags::DELETED);
            let moved = item.is_new()
                || deleted
                || item.name != item.base_name
                || item.parent != item.base_parent;
            if !moved {
                continue;
            }
            if let Some(base) = &item.base_name {
                if !item.is_new()
                    && store.resolve_name(item.base_parent, base, self.version) == Some(*id)
                {
                    self.names.insert((item.base_parent, base.clone()), None);
                }
            }
            if !deleted {
                if let Some(name) = &item.name {
                    added.push(((item.parent, name.clone()), *id));
                }
            }
        }
        for (key, id) in added {
            self.names.insert(key, Some(id));
        }
    }

    /// Drop log entries whose changes all merged away
    fn trim_log(&mut self) {
        let items = &self.items;
        let pending = &self.pending_deletes;
        self.log
            .retain(|id| items.get(id).map_or(false, |i| i.is_dirty()) || pending.contains(id));
        self.logged = self.log.iter().copied().collect();
    }
}

/// Closest predecessor of `key` in base order that `keep` accepts
fn surviving_prev<F>(links: &HashMap<ItemId, LinkRecord>, key: ItemId, keep: F) -> Option<ItemId>
where
    F: Fn(&ItemId) -> bool,
{
    let mut cursor = links.get(&key).and_then(|l| l.prev);
    for _ in 0..links.len() {
        match cursor {
            Some(p) if !keep(&p) => cursor = links.get(&p).and_then(|l| l.prev),
            _ => break,
        }
    }
    cursor
}
