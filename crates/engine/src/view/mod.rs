//! Views
//!
//! A [`View`] is one thread's snapshot of the repository at a version. It
//! owns a cache of materialized [`Item`]s, the change log of items it
//! dirtied, pending deletions, a name overlay for uncommitted renames and
//! a queue of [`Notification`]s.
//!
//! # State machine
//!
//! ```text
//! Open ──refresh──▶ Refreshing ──▶ Open
//!  │  ──commit───▶ Committing ──▶ Open
//!  └──close─────▶ Closed
//! ```
//!
//! Loading an item is a short nested state guarded per item: a load that
//! re-enters itself fails with [`ItemDbError::RecursiveLoad`].
//!
//! # Submodules
//!
//! - `refs`: bi-directional references and collection membership
//! - `collection`: the [`Collection`] handle
//! - `refresh`: moving to a newer version and merging
//! - `commit`: publishing the change log, and cancel
//! - `check`: consistency checks and repair
//! - `import`: copying item graphs between views

mod check;
mod collection;
mod commit;
mod import;
mod refresh;
mod refs;

pub use check::CheckReport;
pub use collection::Collection;

use crate::item::{Item, ItemFlags};
use crate::link::{Endpoint, Link};
use crate::collection::RefCollection;
use crate::notify::{Notification, SLOW_DISPATCH};
use crate::refs::RefValue;
use crate::shared::Shared;
use crate::text::tokenize_unique;
use crate::values::{EntryFlags, SetMode};
use itemdb_core::{
    Acl, CommitRecord, ItemDbError, ItemId, ItemPath, Permissions, RefRecord, Result, Value,
    Version,
};
use itemdb_storage::ReaderId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Lifecycle state of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// Usable
    Open,
    /// Moving to a newer version
    Refreshing,
    /// Publishing its changes
    Committing,
    /// Released; every operation fails
    Closed,
}

type NameKey = (Option<ItemId>, String);

/// Everything refresh must be able to roll back
#[derive(Clone)]
pub(crate) struct Saved {
    version: Version,
    items: HashMap<ItemId, Item>,
    log: Vec<ItemId>,
    logged: HashSet<ItemId>,
    pending_deletes: Vec<ItemId>,
    names: HashMap<NameKey, Option<ItemId>>,
    notifications: VecDeque<Notification>,
}

/// One thread's snapshot of the repository
pub struct View {
    pub(crate) shared: Arc<Shared>,
    name: String,
    handle: u64,
    pub(crate) version: Version,
    state: ViewState,
    reader: ReaderId,
    pub(crate) items: HashMap<ItemId, Item>,
    pub(crate) log: Vec<ItemId>,
    pub(crate) logged: HashSet<ItemId>,
    pub(crate) pending_deletes: Vec<ItemId>,
    defer_deletes: bool,
    pub(crate) names: HashMap<NameKey, Option<ItemId>>,
    loading: HashSet<ItemId>,
    pub(crate) notifications: VecDeque<Notification>,
    tick: u64,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("cached", &self.items.len())
            .field("dirty", &self.log.len())
            .finish()
    }
}

impl View {
    pub(crate) fn open(shared: Arc<Shared>, name: &str) -> Self {
        let version = shared.store.version();
        let reader = shared.store.register_reader(version);
        let handle = shared.register_view(name);
        debug!(target: "itemdb::view", view = name, version, "Opened view");
        Self {
            shared,
            name: name.to_string(),
            handle,
            version,
            state: ViewState::Open,
            reader,
            items: HashMap::new(),
            log: Vec::new(),
            logged: HashSet::new(),
            pending_deletes: Vec::new(),
            defer_deletes: false,
            names: HashMap::new(),
            loading: HashSet::new(),
            notifications: VecDeque::new(),
            tick: 0,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Name given at open; recorded in commit records
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Version the view reads at
    pub fn version(&self) -> Version {
        self.version
    }

    /// Lifecycle state
    pub fn state(&self) -> ViewState {
        self.state
    }

    /// True while an item is being materialized
    pub fn is_loading(&self) -> bool {
        !self.loading.is_empty()
    }

    /// True when the view has uncommitted changes
    pub fn is_dirty(&self) -> bool {
        !self.log.is_empty() || !self.pending_deletes.is_empty()
    }

    /// Number of items in the change log
    pub fn dirty_count(&self) -> usize {
        self.log.len()
    }

    /// Number of materialized items
    pub fn cached_count(&self) -> usize {
        self.items.len()
    }

    /// When set, [`Self::delete`] only schedules deletions; they take
    /// effect at the next commit or [`Self::effect_deletes`].
    pub fn set_defer_deletes(&mut self, defer: bool) {
        self.defer_deletes = defer;
    }

    /// Release the view. Uncommitted changes are dropped.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.state == ViewState::Closed {
            return;
        }
        self.shared.store.release_reader(self.reader);
        self.shared.unregister_view(self.handle);
        self.state = ViewState::Closed;
        if !self.log.is_empty() {
            debug!(
                target: "itemdb::view",
                view = %self.name,
                count = self.log.len(),
                "Closed view with uncommitted changes"
            );
        }
        self.items.clear();
        self.log.clear();
        self.logged.clear();
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match self.state {
            ViewState::Closed => Err(ItemDbError::InvalidOperation(format!(
                "view '{}' is closed",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    fn enter(&mut self, state: ViewState) -> Result<()> {
        self.ensure_open()?;
        if self.state != ViewState::Open {
            return Err(ItemDbError::InvalidOperation(format!(
                "view '{}' is {:?}",
                self.name, self.state
            )));
        }
        self.state = state;
        Ok(())
    }

    fn leave(&mut self) {
        if self.state != ViewState::Closed {
            self.state = ViewState::Open;
        }
    }

    /// Move the view and its reader registration to `version`
    pub(crate) fn set_version(&mut self, version: Version) {
        self.version = version;
        self.shared.store.move_reader(self.reader, version);
    }

    pub(crate) fn save(&self) -> Saved {
        Saved {
            version: self.version,
            items: self.items.clone(),
            log: self.log.clone(),
            logged: self.logged.clone(),
            pending_deletes: self.pending_deletes.clone(),
            names: self.names.clone(),
            notifications: self.notifications.clone(),
        }
    }

    pub(crate) fn restore(&mut self, saved: Saved) {
        self.set_version(saved.version);
        self.items = saved.items;
        self.log = saved.log;
        self.logged = saved.logged;
        self.pending_deletes = saved.pending_deletes;
        self.names = saved.names;
        self.notifications = saved.notifications;
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Materialize `id` if needed. Returns false when the item does not
    /// exist at this version or is deleted in this view.
    pub(crate) fn load(&mut self, id: ItemId) -> Result<bool> {
        let tick = self.next_tick();
        if let Some(item) = self.items.get_mut(&id) {
            item.last_access = tick;
            return Ok(!item.is_deleted());
        }
        if !self.loading.insert(id) {
            return Err(ItemDbError::RecursiveLoad(id));
        }
        let loaded = self.materialize(id);
        self.loading.remove(&id);
        match loaded? {
            Some(mut item) => {
                item.last_access = tick;
                self.items.insert(id, item);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn materialize(&self, id: ItemId) -> Result<Option<Item>> {
        let store = &self.shared.store;
        let Some((version, record)) = store.load_item(id, self.version) else {
            return Ok(None);
        };
        if record.is_deleted() {
            return Ok(None);
        }
        let schema = &self.shared.schema;
        let kind = record.kind.clone();
        let mut item = Item::new(id, kind.clone(), version);
        item.flags = ItemFlags::empty();
        item.name = record.name.clone();
        item.base_name = record.name.clone();
        item.parent = record.parent;
        item.base_parent = record.parent;
        for (name, value) in store.load_values(id, &record.values, self.version) {
            let mut flags = EntryFlags::empty();
            if schema
                .attribute(kind.as_deref(), &name)
                .map_or(false, |d| d.read_only)
            {
                flags |= EntryFlags::READ_ONLY;
            }
            item.values.set(&name, value, SetMode::Loading, flags);
        }
        for (name, record) in store.load_refs(id, &record.refs, self.version) {
            let slot = match record {
                RefRecord::None => RefValue::Empty,
                RefRecord::Single(peer) => {
                    RefValue::Single(Link::new(id, &name, Endpoint::Resolved(peer)))
                }
                RefRecord::Collection(header) => {
                    let other = schema
                        .attribute(kind.as_deref(), &name)
                        .and_then(|d| d.other_name())
                        .unwrap_or_default()
                        .to_string();
                    RefValue::Collection(RefCollection::from_header(
                        id,
                        &name,
                        &other,
                        header,
                        store.clone(),
                        self.version,
                    ))
                }
            };
            item.refs.set(&name, slot, false);
        }
        item.acl_names = record.acls.iter().cloned().collect();
        debug!(target: "itemdb::view", view = %self.name, item = %id, version, "Loaded item");
        Ok(Some(item))
    }

    /// Drop a clean item from the cache
    pub(crate) fn unload(&mut self, id: ItemId) {
        if self.items.remove(&id).is_some() {
            debug!(target: "itemdb::view", view = %self.name, item = %id, "Unloaded item");
        }
    }

    pub(crate) fn live(&mut self, id: ItemId) -> Result<()> {
        if self.load(id)? {
            Ok(())
        } else {
            Err(ItemDbError::NoSuchItem(id))
        }
    }

    pub(crate) fn item_mut(&mut self, id: ItemId) -> Result<&mut Item> {
        self.live(id)?;
        self.items.get_mut(&id).ok_or(ItemDbError::NoSuchItem(id))
    }

    /// Record `id` in the change log with `bits` set
    pub(crate) fn mark_dirty(&mut self, id: ItemId, bits: ItemFlags) {
        if let Some(item) = self.items.get_mut(&id) {
            item.flags |= bits;
        }
        if self.logged.insert(id) {
            self.log.push(id);
        }
    }

    pub(crate) fn forget(&mut self, id: ItemId) {
        self.items.remove(&id);
        if self.logged.remove(&id) {
            self.log.retain(|i| *i != id);
        }
        self.pending_deletes.retain(|i| *i != id);
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Create an item of `kind` (declared in the schema) or kindless
    pub fn create(&mut self, kind: Option<&str>) -> Result<ItemId> {
        self.ensure_open()?;
        if let Some(k) = kind {
            if self.shared.schema.kind(k).is_none() {
                return Err(ItemDbError::Schema(format!("unknown kind '{}'", k)));
            }
        }
        let id = ItemId::new();
        let mut item = Item::new(id, kind.map(str::to_string), self.version);
        item.last_access = self.next_tick();
        self.items.insert(id, item);
        self.mark_dirty(id, ItemFlags::empty());
        Ok(id)
    }

    /// Create an item named `name` under `parent` (a root when `None`)
    pub fn create_named(
        &mut self,
        kind: Option<&str>,
        parent: Option<ItemId>,
        name: &str,
    ) -> Result<ItemId> {
        self.ensure_open()?;
        check_name(name)?;
        if let Some(p) = parent {
            self.live(p)?;
        }
        if let Some(holder) = self.resolve_name(parent, name)? {
            return Err(name_taken(name, holder));
        }
        let id = self.create(kind)?;
        if let Some(item) = self.items.get_mut(&id) {
            item.name = Some(name.to_string());
            item.parent = parent;
        }
        self.names.insert((parent, name.to_string()), Some(id));
        self.mark_dirty(id, ItemFlags::NDIRTY);
        Ok(id)
    }

    /// `Some(id)` when the item exists and is not deleted in this view
    pub fn find(&mut self, id: ItemId) -> Result<Option<ItemId>> {
        self.ensure_open()?;
        Ok(self.load(id)?.then_some(id))
    }

    /// Materialized item
    pub fn item(&mut self, id: ItemId) -> Result<&Item> {
        self.ensure_open()?;
        self.live(id)?;
        self.items.get(&id).ok_or(ItemDbError::NoSuchItem(id))
    }

    /// Kind of `id`
    pub fn kind_of(&mut self, id: ItemId) -> Result<Option<String>> {
        Ok(self.item(id)?.kind.clone())
    }

    // ========================================================================
    // Values
    // ========================================================================

    /// Value of `attribute`, falling back to the schema default
    pub fn get_value(&mut self, id: ItemId, attribute: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let item = self.item(id)?;
        if let Some(v) = item.values.get(attribute) {
            return Ok(Some(v.clone()));
        }
        let kind = item.kind.clone();
        Ok(self
            .shared
            .schema
            .attribute(kind.as_deref(), attribute)
            .and_then(|d| d.default.clone()))
    }

    /// Value of `attribute`; unset without a default is an error
    pub fn require_value(&mut self, id: ItemId, attribute: &str) -> Result<Value> {
        self.get_value(id, attribute)?
            .ok_or_else(|| ItemDbError::NoSuchAttribute {
                item: id,
                attribute: attribute.to_string(),
            })
    }

    /// Set a literal attribute
    pub fn set_value(&mut self, id: ItemId, attribute: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_open()?;
        self.live(id)?;
        self.write_value(id, attribute, Some(value.into()))
    }

    /// Remove a literal attribute
    pub fn remove_value(&mut self, id: ItemId, attribute: &str) -> Result<()> {
        self.ensure_open()?;
        self.live(id)?;
        self.write_value(id, attribute, None)
    }

    pub(crate) fn write_value(&mut self, id: ItemId, attribute: &str, value: Option<Value>) -> Result<()> {
        let shared = self.shared.clone();
        let item = self.items.get_mut(&id).ok_or(ItemDbError::NoSuchItem(id))?;
        let def = shared.schema.attribute(item.kind.as_deref(), attribute);
        let mut flags = EntryFlags::empty();
        if let Some(d) = def {
            if d.is_reference() {
                return Err(ItemDbError::Cardinality {
                    attribute: attribute.to_string(),
                    message: "reference attribute; use the reference operations".into(),
                });
            }
            if d.read_only {
                if !item.is_new() {
                    return Err(ItemDbError::ReadOnlyAttribute {
                        item: id,
                        attribute: attribute.to_string(),
                    });
                }
                flags |= EntryFlags::READ_ONLY;
            }
            if d.transient {
                flags |= EntryFlags::TRANSIENT;
            }
        }
        if let Some(v) = &value {
            shared
                .catalog
                .check(def.and_then(|d| d.value_type.as_deref()), v)?;
        }
        let changed = match value {
            Some(v) => item.values.set(attribute, v, SetMode::Dirty, flags),
            None => item.values.remove(attribute, SetMode::Dirty).is_some(),
        };
        if !changed {
            return Ok(());
        }
        if !flags.contains(EntryFlags::TRANSIENT) {
            self.mark_dirty(id, ItemFlags::VDIRTY);
        }
        self.reposition_in_watchers(id, attribute)
    }

    // ========================================================================
    // Names and paths
    // ========================================================================

    /// Item named `name` under `parent` at this view's state
    pub fn resolve_name(&mut self, parent: Option<ItemId>, name: &str) -> Result<Option<ItemId>> {
        let found = match self.names.get(&(parent, name.to_string())) {
            Some(local) => *local,
            None => self.shared.store.resolve_name(parent, name, self.version),
        };
        match found {
            Some(id) if self.load(id)? => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    /// Item at an absolute path such as `//movies/alien`
    pub fn find_path(&mut self, path: &str) -> Result<Option<ItemId>> {
        self.ensure_open()?;
        let parsed =
            ItemPath::parse(path).ok_or_else(|| ItemDbError::NoSuchPath(path.to_string()))?;
        self.find_item_path(&parsed)
    }

    pub(crate) fn find_item_path(&mut self, path: &ItemPath) -> Result<Option<ItemId>> {
        let mut parent = None;
        for segment in path.segments() {
            match self.resolve_name(parent, segment)? {
                Some(id) => parent = Some(id),
                None => return Ok(None),
            }
        }
        Ok(parent)
    }

    /// Path of a named item; unnamed items and their descendants have none
    pub fn path_of(&mut self, id: ItemId) -> Result<Option<ItemPath>> {
        self.ensure_open()?;
        let mut segments = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if !seen.insert(current) {
                return Err(ItemDbError::Corruption(format!(
                    "parent cycle through {}",
                    current
                )));
            }
            let item = self.item(current)?;
            let Some(name) = item.name.clone() else {
                return Ok(None);
            };
            segments.push(name);
            cursor = item.parent;
        }
        segments.reverse();
        Ok(Some(ItemPath::new(segments)))
    }

    /// Named children of `parent` (roots when `None`), by name
    pub fn children(&mut self, parent: Option<ItemId>) -> Result<Vec<(String, ItemId)>> {
        self.ensure_open()?;
        let mut by_name: BTreeMap<String, ItemId> = self
            .shared
            .store
            .children(parent, self.version)
            .into_iter()
            .collect();
        for ((p, name), local) in &self.names {
            if *p != parent {
                continue;
            }
            match local {
                Some(id) => {
                    by_name.insert(name.clone(), *id);
                }
                None => {
                    by_name.remove(name);
                }
            }
        }
        let mut out = Vec::with_capacity(by_name.len());
        for (name, id) in by_name {
            if self.load(id)? {
                out.push((name, id));
            }
        }
        Ok(out)
    }

    /// Named root items
    pub fn roots(&mut self) -> Result<Vec<(String, ItemId)>> {
        self.children(None)
    }

    /// Give `id` a new name under its current parent
    pub fn rename(&mut self, id: ItemId, name: &str) -> Result<()> {
        self.ensure_open()?;
        check_name(name)?;
        let (parent, old) = {
            let item = self.item(id)?;
            (item.parent, item.name.clone())
        };
        self.rehome(id, parent, old, parent, name.to_string())
    }

    /// Move `id` under `parent`, keeping its name
    pub fn move_item(&mut self, id: ItemId, parent: Option<ItemId>) -> Result<()> {
        self.ensure_open()?;
        let (old_parent, name) = {
            let item = self.item(id)?;
            (item.parent, item.name.clone())
        };
        let mut cursor = parent;
        while let Some(p) = cursor {
            if p == id {
                return Err(ItemDbError::InvalidOperation(format!(
                    "cannot move {} under its own descendant",
                    id
                )));
            }
            cursor = self.item(p)?.parent;
        }
        match name {
            Some(n) => self.rehome(id, old_parent, Some(n.clone()), parent, n),
            None => {
                if let Some(item) = self.items.get_mut(&id) {
                    item.parent = parent;
                }
                self.mark_dirty(id, ItemFlags::NDIRTY);
                Ok(())
            }
        }
    }

    pub(crate) fn rehome(
        &mut self,
        id: ItemId,
        old_parent: Option<ItemId>,
        old_name: Option<String>,
        parent: Option<ItemId>,
        name: String,
    ) -> Result<()> {
        if old_parent == parent && old_name.as_deref() == Some(name.as_str()) {
            return Ok(());
        }
        if let Some(holder) = self.resolve_name(parent, &name)? {
            if holder != id {
                return Err(name_taken(&name, holder));
            }
        }
        if let Some(old) = old_name {
            self.names.insert((old_parent, old), None);
        }
        self.names.insert((parent, name.clone()), Some(id));
        if let Some(item) = self.items.get_mut(&id) {
            item.name = Some(name);
            item.parent = parent;
        }
        self.mark_dirty(id, ItemFlags::NDIRTY);
        Ok(())
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete `id` and its named descendants, detaching every reference.
    ///
    /// With deferred deletion on, the item only becomes invisible; the
    /// detach happens at the next commit.
    pub fn delete(&mut self, id: ItemId) -> Result<()> {
        self.ensure_open()?;
        self.live(id)?;
        if self.defer_deletes {
            self.mark_dirty(id, ItemFlags::DEFERRED);
            self.pending_deletes.push(id);
            return Ok(());
        }
        self.delete_tree(id)
    }

    /// Carry out every scheduled deletion
    pub fn effect_deletes(&mut self) -> Result<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut self.pending_deletes);
        for id in pending {
            if let Some(item) = self.items.get_mut(&id) {
                if !item.flags.contains(ItemFlags::DEFERRED) {
                    continue;
                }
                item.flags.remove(ItemFlags::DEFERRED);
            }
            self.delete_tree(id)?;
        }
        Ok(())
    }

    fn delete_tree(&mut self, id: ItemId) -> Result<()> {
        let mut order = vec![id];
        let mut seen = HashSet::from([id]);
        let mut cursor = 0;
        while cursor < order.len() {
            let current = order[cursor];
            cursor += 1;
            for (_, child) in self.children(Some(current))? {
                if seen.insert(child) {
                    order.push(child);
                }
            }
        }
        for target in order.into_iter().rev() {
            self.delete_one(target)?;
        }
        Ok(())
    }

    fn delete_one(&mut self, id: ItemId) -> Result<()> {
        if !self.load(id)? {
            return Ok(());
        }
        let names = self
            .items
            .get(&id)
            .map(|item| item.refs.names())
            .unwrap_or_default();
        for attribute in names {
            self.clear_reference(id, &attribute)?;
        }
        let (parent, name, is_new) = match self.items.get(&id) {
            Some(item) => (item.parent, item.name.clone(), item.is_new()),
            None => return Ok(()),
        };
        if let Some(n) = name {
            self.names.insert((parent, n), None);
        }
        if is_new {
            self.forget(id);
        } else {
            self.mark_dirty(id, ItemFlags::DELETED);
        }
        debug!(target: "itemdb::view", view = %self.name, item = %id, "Deleted item");
        Ok(())
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Keep `id` loaded across refresh and pruning
    pub fn pin(&mut self, id: ItemId) -> Result<()> {
        self.item_mut(id)?.flags |= ItemFlags::PINNED;
        Ok(())
    }

    /// Undo [`Self::pin`]
    pub fn unpin(&mut self, id: ItemId) -> Result<()> {
        self.item_mut(id)?.flags.remove(ItemFlags::PINNED);
        Ok(())
    }

    /// Unload least recently used clean items until the cache fits the
    /// configured size. Returns how many were dropped.
    pub fn prune(&mut self) -> usize {
        let limit = self.shared.config.view_cache_size;
        if self.items.len() <= limit {
            return 0;
        }
        let mut candidates: Vec<(u64, ItemId)> = self
            .items
            .values()
            .filter(|i| !i.is_dirty() && !i.is_pinned())
            .map(|i| (i.last_access, i.id))
            .collect();
        candidates.sort();
        let excess = self.items.len() - limit;
        let dropped = candidates.len().min(excess);
        for (_, id) in candidates.into_iter().take(dropped) {
            self.items.remove(&id);
        }
        debug!(target: "itemdb::view", view = %self.name, count = dropped, "Pruned items");
        dropped
    }

    // ========================================================================
    // ACLs
    // ========================================================================

    /// Set (`Some`) or remove (`None`) the ACL `name` of `id`
    pub fn set_acl(&mut self, id: ItemId, name: &str, acl: Option<Acl>) -> Result<()> {
        self.ensure_open()?;
        let item = self.item_mut(id)?;
        if acl.is_some() {
            item.acl_names.insert(name.to_string());
        } else {
            item.acl_names.remove(name);
        }
        item.acls.insert(name.to_string(), acl);
        item.dirty_acls.insert(name.to_string());
        self.mark_dirty(id, ItemFlags::ADIRTY);
        Ok(())
    }

    /// ACL `name` of `id`
    pub fn acl(&mut self, id: ItemId, name: &str) -> Result<Option<Acl>> {
        self.ensure_open()?;
        let version = self.version;
        let store = self.shared.store.clone();
        let item = self.item_mut(id)?;
        if let Some(cached) = item.acls.get(name) {
            return Ok(cached.clone());
        }
        if !item.acl_names.contains(name) {
            return Ok(None);
        }
        let loaded = store.load_acl(id, name, version);
        item.acls.insert(name.to_string(), loaded.clone());
        Ok(loaded)
    }

    /// Whether `principal` holds `wanted` on `id` through ACL `name`.
    /// An item without that ACL grants everything.
    pub fn check_access(
        &mut self,
        id: ItemId,
        name: &str,
        principal: ItemId,
        wanted: Permissions,
    ) -> Result<bool> {
        Ok(match self.acl(id, name)? {
            Some(acl) => acl.verify(principal, wanted),
            None => true,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Items of `kind` (every item when `None`) visible in this view
    pub fn query_items(&mut self, kind: Option<&str>) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        let mut ids: BTreeSet<ItemId> = self
            .shared
            .store
            .query_items(kind, self.version)
            .into_iter()
            .collect();
        for item in self.items.values() {
            if item.is_deleted() {
                ids.remove(&item.id);
            } else if item.is_new() && (kind.is_none() || item.kind.as_deref() == kind) {
                ids.insert(item.id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    /// Items whose indexed attributes contain every word of `text`, as of
    /// the last indexed version not after this view
    pub fn search_items(&mut self, text: &str) -> Result<Vec<(ItemId, String)>> {
        self.ensure_open()?;
        let terms = tokenize_unique(text);
        let hits = self.shared.store.text().search(&terms, self.version);
        let mut out = Vec::with_capacity(hits.len());
        for (id, attribute) in hits {
            if self.load(id)? {
                out.push((id, attribute));
            }
        }
        Ok(out)
    }

    /// Visit every item in the change log, in the order first dirtied
    pub fn map_changes<F>(&self, mut f: F)
    where
        F: FnMut(&Item),
    {
        for id in &self.log {
            if let Some(item) = self.items.get(id) {
                f(item);
            }
        }
    }

    /// Commit records in `(from, to]`
    pub fn history(&self, from: Version, to: Version) -> Result<Vec<CommitRecord>> {
        self.ensure_open()?;
        self.shared.store.iter_history(from, to)
    }

    /// Visit commit records in `(from, to]`
    pub fn map_history<F>(&self, from: Version, to: Version, mut f: F) -> Result<()>
    where
        F: FnMut(&CommitRecord),
    {
        for record in self.history(from, to)? {
            f(&record);
        }
        Ok(())
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// Take every queued notification
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    /// Hand every queued notification to `handler`
    pub fn dispatch_notifications<F>(&mut self, mut handler: F) -> usize
    where
        F: FnMut(&Notification),
    {
        let started = Instant::now();
        let mut count = 0;
        while let Some(n) = self.notifications.pop_front() {
            handler(&n);
            count += 1;
        }
        let elapsed = started.elapsed();
        if elapsed > SLOW_DISPATCH {
            warn!(
                target: "itemdb::view",
                view = %self.name,
                count,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow notification dispatch"
            );
        }
        count
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Hash of an item's values and references as this view sees them.
    ///
    /// Equal content hashes equal: attribute order and set member order do
    /// not matter, collection order and aliases do.
    pub fn item_hash(&mut self, id: ItemId) -> Result<u64> {
        self.ensure_open()?;
        let shared = self.shared.clone();
        let item = self.item_mut(id)?;
        let mut fields: Vec<(String, Value)> = item
            .values
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        for (name, slot) in item.refs.iter_mut() {
            let value = match slot {
                RefValue::Empty => Value::Null,
                RefValue::Single(link) => Value::String(match link.peer() {
                    Endpoint::Resolved(peer) => peer.to_string(),
                    Endpoint::Deferred(target) => target.to_string(),
                }),
                RefValue::Collection(c) => {
                    let mut members = Vec::new();
                    for key in c.keys()? {
                        members.push(Value::String(match c.alias_of(key)? {
                            Some(alias) => format!("{}:{}", key, alias),
                            None => key.to_string(),
                        }));
                    }
                    Value::Array(members)
                }
            };
            fields.push((name.to_string(), value));
        }
        shared
            .catalog
            .hash_all(fields.iter().map(|(name, value)| (name.as_str(), value)))
    }

    /// JSON rendering of one item
    pub fn dump_item(&mut self, id: ItemId) -> Result<serde_json::Value> {
        self.ensure_open()?;
        let path = self.path_of(id)?.map(|p| p.to_string());
        let item = self.item_mut(id)?;
        let mut values = serde_json::Map::new();
        for (name, value) in item.values.iter() {
            values.insert(
                name.to_string(),
                serde_json::to_value(value)
                    .map_err(|e| ItemDbError::Serialization(e.to_string()))?,
            );
        }
        let mut refs = serde_json::Map::new();
        for (name, slot) in item.refs.iter_mut() {
            let rendered = match slot {
                RefValue::Empty => serde_json::Value::Null,
                RefValue::Single(link) => match link.peer() {
                    Endpoint::Resolved(peer) => serde_json::Value::String(peer.to_string()),
                    Endpoint::Deferred(target) => serde_json::json!({ "stub": target.to_string() }),
                },
                RefValue::Collection(c) => serde_json::Value::Array(
                    c.keys()?
                        .into_iter()
                        .map(|k| serde_json::Value::String(k.to_string()))
                        .collect(),
                ),
            };
            refs.insert(name.to_string(), rendered);
        }
        Ok(serde_json::json!({
            "id": id.to_string(),
            "kind": item.kind,
            "path": path,
            "version": item.version,
            "values": values,
            "refs": refs,
        }))
    }
}

impl Drop for View {
    fn drop(&mut self) {
        self.release();
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') {
        return Err(ItemDbError::InvalidOperation(format!(
            "invalid item name {:?}",
            name
        )));
    }
    Ok(())
}

fn name_taken(name: &str, holder: ItemId) -> ItemDbError {
    ItemDbError::InvalidOperation(format!("name '{}' is already taken by {}", name, holder))
}
