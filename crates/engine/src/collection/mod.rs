//! Ordered reference collections
//!
//! A [`RefCollection`] is the many side of a bi-directional reference: an
//! arena of entries keyed by member id, each with explicit previous/next
//! pointers, an optional alias unique in the collection, and any number of
//! named [`SecondaryIndex`]es.
//!
//! # Lazy loading
//!
//! A collection loaded from the store starts from its header alone
//! (first, last, count, aliases, index kinds). Entries and index records
//! are fetched one at a time the first time something walks over them.
//!
//! # Peers
//!
//! Methods here only maintain the collection itself. Keeping the reverse
//! side on the member in step is the view's job.

mod index;

pub use index::{KeyOrder, SecondaryIndex};

use itemdb_core::{
    CollectionHeader, IndexKind, IndexRecord, ItemDbError, ItemId, LinkRecord, Result, Version,
};
use itemdb_storage::Store;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// Where a new member goes in base order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Before every member
    First,
    /// After every member
    Last,
    /// Right after this member
    After(ItemId),
}

#[derive(Debug, Clone)]
struct LinkSource {
    store: Arc<Store>,
    version: Version,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Entry {
    prev: Option<ItemId>,
    next: Option<ItemId>,
    alias: Option<String>,
}

impl From<LinkRecord> for Entry {
    fn from(r: LinkRecord) -> Self {
        Self {
            prev: r.prev,
            next: r.next,
            alias: r.alias,
        }
    }
}

impl From<&Entry> for LinkRecord {
    fn from(e: &Entry) -> Self {
        LinkRecord {
            prev: e.prev,
            next: e.next,
            alias: e.alias.clone(),
        }
    }
}

#[derive(Debug, Clone)]
enum IndexSlot {
    Unloaded(IndexKind),
    Loaded(SecondaryIndex),
}

impl IndexSlot {
    fn kind(&self) -> &IndexKind {
        match self {
            IndexSlot::Unloaded(kind) => kind,
            IndexSlot::Loaded(index) => index.kind(),
        }
    }
}

/// Doubly-linked, alias-keyed, indexed set of members
#[derive(Debug, Clone)]
pub struct RefCollection {
    owner: ItemId,
    attribute: String,
    other_name: String,
    entries: HashMap<ItemId, Entry>,
    head: Option<ItemId>,
    tail: Option<ItemId>,
    len: usize,
    aliases: BTreeMap<String, ItemId>,
    indexes: BTreeMap<String, IndexSlot>,
    source: Option<LinkSource>,
    dirty_entries: BTreeSet<ItemId>,
    removed_entries: BTreeSet<ItemId>,
    touched: BTreeSet<ItemId>,
    dirty_indexes: BTreeSet<String>,
    removed_indexes: BTreeSet<String>,
    placed_indexes: BTreeSet<String>,
    header_dirty: bool,
}

impl RefCollection {
    /// Empty collection not yet in the store
    pub fn new(owner: ItemId, attribute: &str, other_name: &str) -> Self {
        Self {
            owner,
            attribute: attribute.to_string(),
            other_name: other_name.to_string(),
            entries: HashMap::new(),
            head: None,
            tail: None,
            len: 0,
            aliases: BTreeMap::new(),
            indexes: BTreeMap::new(),
            source: None,
            dirty_entries: BTreeSet::new(),
            removed_entries: BTreeSet::new(),
            touched: BTreeSet::new(),
            dirty_indexes: BTreeSet::new(),
            removed_indexes: BTreeSet::new(),
            placed_indexes: BTreeSet::new(),
            header_dirty: true,
        }
    }

    /// Collection backed by the store at `version`; entries load on demand
    pub fn from_header(
        owner: ItemId,
        attribute: &str,
        other_name: &str,
        header: CollectionHeader,
        store: Arc<Store>,
        version: Version,
    ) -> Self {
        let mut c = Self::new(owner, attribute, other_name);
        c.head = header.first;
        c.tail = header.last;
        c.len = header.count;
        c.aliases = header.aliases.into_iter().collect();
        c.indexes = header
            .indexes
            .into_iter()
            .map(|(name, kind)| (name, IndexSlot::Unloaded(kind)))
            .collect();
        c.source = Some(LinkSource { store, version });
        c.header_dirty = false;
        c
    }

    /// Owning item
    pub fn owner(&self) -> ItemId {
        self.owner
    }

    /// Attribute holding the collection
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Attribute on each member holding the reverse side
    pub fn other_name(&self) -> &str {
        &self.other_name
    }

    /// Member count
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when there are no members
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // ========================================================================
    // Entry access
    // ========================================================================

    /// Materialize the entry for `key` from the store if needed.
    ///
    /// Returns false when `key` is not a member.
    pub fn load(&mut self, key: ItemId) -> bool {
        if self.entries.contains_key(&key) {
            return true;
        }
        if self.removed_entries.contains(&key) {
            return false;
        }
        let Some(source) = &self.source else {
            return false;
        };
        match source
            .store
            .load_link(self.owner, &self.attribute, key, source.version)
        {
            Some(record) => {
                self.entries.insert(key, record.into());
                true
            }
            None => false,
        }
    }

    fn not_member(&self, key: ItemId) -> ItemDbError {
        ItemDbError::NotInCollection {
            owner: self.owner,
            attribute: self.attribute.clone(),
            member: key,
        }
    }

    fn entry(&mut self, key: ItemId) -> Result<&Entry> {
        if !self.load(key) {
            return Err(self.not_member(key));
        }
        self.entries.get(&key).ok_or_else(|| self.not_member(key))
    }

    fn entry_mut(&mut self, key: ItemId) -> Result<&mut Entry> {
        if !self.load(key) {
            return Err(self.not_member(key));
        }
        self.dirty_entries.insert(key);
        let owner = self.owner;
        let attribute = self.attribute.clone();
        self.entries
            .get_mut(&key)
            .ok_or(ItemDbError::NotInCollection {
                owner,
                attribute,
                member: key,
            })
    }

    /// True when `key` is a member
    pub fn contains(&mut self, key: ItemId) -> bool {
        self.load(key)
    }

    /// First member in base order
    pub fn first(&self) -> Option<ItemId> {
        self.head
    }

    /// Last member in base order
    pub fn last(&self) -> Option<ItemId> {
        self.tail
    }

    /// Member after `key` in base order
    pub fn next(&mut self, key: ItemId) -> Result<Option<ItemId>> {
        Ok(self.entry(key)?.next)
    }

    /// Member before `key` in base order
    pub fn previous(&mut self, key: ItemId) -> Result<Option<ItemId>> {
        Ok(self.entry(key)?.prev)
    }

    /// Alias of `key`
    pub fn alias_of(&mut self, key: ItemId) -> Result<Option<String>> {
        Ok(self.entry(key)?.alias.clone())
    }

    /// Member holding `alias`
    pub fn get_by_alias(&self, alias: &str) -> Option<ItemId> {
        self.aliases.get(alias).copied()
    }

    /// Every member in base order
    pub fn keys(&mut self) -> Result<Vec<ItemId>> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(key) = cursor {
            if out.len() >= self.len {
                return Err(ItemDbError::Corruption(format!(
                    "{}.{} links more than its {} members",
                    self.owner, self.attribute, self.len
                )));
            }
            out.push(key);
            cursor = self.entry(key)?.next;
        }
        Ok(out)
    }

    // ========================================================================
    // Base-order mutation
    // ========================================================================

    fn check_alias(&self, key: ItemId, alias: Option<&str>) -> Result<()> {
        if let Some(a) = alias {
            if let Some(holder) = self.aliases.get(a) {
                if *holder != key {
                    return Err(ItemDbError::AliasInUse {
                        alias: a.to_string(),
                        holder: *holder,
                    });
                }
            }
        }
        Ok(())
    }

    fn unlink(&mut self, key: ItemId) -> Result<Entry> {
        let entry = self.entry(key)?.clone();
        match entry.prev {
            Some(p) => self.entry_mut(p)?.next = entry.next,
            None => self.head = entry.next,
        }
        match entry.next {
            Some(n) => self.entry_mut(n)?.prev = entry.prev,
            None => self.tail = entry.prev,
        }
        Ok(entry)
    }

    fn link(&mut self, key: ItemId, placement: Placement, alias: Option<String>) -> Result<()> {
        let (prev, next) = match placement {
            Placement::First => (None, self.head),
            Placement::Last => (self.tail, None),
            Placement::After(a) => (Some(a), self.entry(a)?.next),
        };
        match prev {
            Some(p) => self.entry_mut(p)?.next = Some(key),
            None => self.head = Some(key),
        }
        match next {
            Some(n) => self.entry_mut(n)?.prev = Some(key),
            None => self.tail = Some(key),
        }
        self.entries.insert(key, Entry { prev, next, alias });
        self.dirty_entries.insert(key);
        self.removed_entries.remove(&key);
        Ok(())
    }

    /// Add `key`, or update the alias of an existing member.
    ///
    /// Returns true when `key` was not a member before. New members are
    /// appended to every index; sorted indexes are re-sorted by the caller.
    pub fn insert(&mut self, key: ItemId, placement: Placement, alias: Option<&str>) -> Result<bool> {
        self.check_alias(key, alias)?;
        if self.contains(key) {
            if alias.is_some() {
                self.set_alias(key, alias)?;
            }
            return Ok(false);
        }
        if let Placement::After(a) = placement {
            if a == key || !self.contains(a) {
                return Err(self.not_member(a));
            }
        }
        self.ensure_indexes()?;
        self.link(key, placement, alias.map(str::to_string))?;
        if let Some(a) = alias {
            self.aliases.insert(a.to_string(), key);
        }
        self.len += 1;
        self.touched.insert(key);
        self.header_dirty = true;
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for name in names {
            self.loaded_index_mut(&name)?.push(key);
        }
        Ok(true)
    }

    /// Remove `key` from every index, then from base order
    pub fn remove(&mut self, key: ItemId) -> Result<()> {
        if !self.contains(key) {
            return Err(self.not_member(key));
        }
        self.ensure_indexes()?;
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for name in names {
            self.loaded_index_mut(&name)?.remove(key);
        }
        let entry = self.unlink(key)?;
        if let Some(alias) = entry.alias {
            self.aliases.remove(&alias);
        }
        self.entries.remove(&key);
        self.dirty_entries.remove(&key);
        self.removed_entries.insert(key);
        self.touched.insert(key);
        self.len -= 1;
        self.header_dirty = true;
        Ok(())
    }

    /// Put `new` where `old` is, keeping alias and every index position
    pub fn replace(&mut self, old: ItemId, new: ItemId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if self.contains(new) {
            return Err(ItemDbError::InvalidOperation(format!(
                "{} is already in {}.{}",
                new, self.owner, self.attribute
            )));
        }
        self.ensure_indexes()?;
        let entry = self.unlink(old)?;
        let placement = match entry.prev {
            Some(p) => Placement::After(p),
            None => Placement::First,
        };
        self.entries.remove(&old);
        self.dirty_entries.remove(&old);
        self.removed_entries.insert(old);
        if let Some(alias) = &entry.alias {
            self.aliases.insert(alias.clone(), new);
        }
        self.link(new, placement, entry.alias)?;
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for name in names {
            self.loaded_index_mut(&name)?.replace(old, new);
        }
        self.touched.insert(old);
        self.touched.insert(new);
        self.header_dirty = true;
        Ok(())
    }

    /// Move `key` right after `after` in base order (`None` moves it first)
    pub fn place(&mut self, key: ItemId, after: Option<ItemId>) -> Result<()> {
        if after == Some(key) {
            return Err(ItemDbError::InvalidOperation(format!(
                "cannot place {} after itself",
                key
            )));
        }
        if !self.contains(key) {
            return Err(self.not_member(key));
        }
        if let Some(a) = after {
            if !self.contains(a) {
                return Err(self.not_member(a));
            }
        }
        let entry = self.unlink(key)?;
        let placement = match after {
            Some(a) => Placement::After(a),
            None => Placement::First,
        };
        self.link(key, placement, entry.alias)?;
        self.touched.insert(key);
        self.header_dirty = true;
        Ok(())
    }

    /// Set or clear the alias of `key`
    pub fn set_alias(&mut self, key: ItemId, alias: Option<&str>) -> Result<()> {
        self.check_alias(key, alias)?;
        let old = self.entry(key)?.alias.clone();
        if old.as_deref() == alias {
            return Ok(());
        }
        if let Some(o) = old {
            self.aliases.remove(&o);
        }
        if let Some(a) = alias {
            self.aliases.insert(a.to_string(), key);
        }
        self.entry_mut(key)?.alias = alias.map(str::to_string);
        self.touched.insert(key);
        self.header_dirty = true;
        Ok(())
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    fn no_index(&self, name: &str) -> ItemDbError {
        ItemDbError::NoSuchIndex {
            attribute: self.attribute.clone(),
            index: name.to_string(),
        }
    }

    fn ensure_index(&mut self, name: &str) -> Result<()> {
        let kind = match self.indexes.get(name) {
            None => return Err(self.no_index(name)),
            Some(IndexSlot::Loaded(_)) => return Ok(()),
            Some(IndexSlot::Unloaded(kind)) => kind.clone(),
        };
        let record = self.source.as_ref().and_then(|s| {
            s.store
                .load_index(self.owner, &self.attribute, name, s.version)
        });
        let index = match record {
            Some(record) => SecondaryIndex::from_record(record),
            None => {
                return Err(ItemDbError::Corruption(format!(
                    "index '{}' ({:?}) of {}.{} has no record",
                    name, kind, self.owner, self.attribute
                )))
            }
        };
        self.indexes.insert(name.to_string(), IndexSlot::Loaded(index));
        Ok(())
    }

    fn ensure_indexes(&mut self) -> Result<()> {
        let names: Vec<String> = self.indexes.keys().cloned().collect();
        for name in names {
            self.ensure_index(&name)?;
        }
        Ok(())
    }

    fn loaded_index_mut(&mut self, name: &str) -> Result<&mut SecondaryIndex> {
        self.ensure_index(name)?;
        self.dirty_indexes.insert(name.to_string());
        match self.indexes.get_mut(name) {
            Some(IndexSlot::Loaded(index)) => Ok(index),
            _ => Err(ItemDbError::NoSuchIndex {
                attribute: self.attribute.clone(),
                index: name.to_string(),
            }),
        }
    }

    /// Names of attached indexes
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Ordering of the named index
    pub fn index_kind(&self, name: &str) -> Option<&IndexKind> {
        self.indexes.get(name).map(IndexSlot::kind)
    }

    /// Attribute and comparator indexes
    pub fn sorted_indexes(&self) -> Vec<(String, IndexKind)> {
        self.indexes
            .iter()
            .filter(|(_, slot)| !matches!(slot.kind(), IndexKind::Sequence))
            .map(|(name, slot)| (name.clone(), slot.kind().clone()))
            .collect()
    }

    /// Read access to an index, loading it first
    pub fn index(&mut self, name: &str) -> Result<&SecondaryIndex> {
        self.ensure_index(name)?;
        match self.indexes.get(name) {
            Some(IndexSlot::Loaded(index)) => Ok(index),
            _ => Err(self.no_index(name)),
        }
    }

    /// Attach a new index holding every member in base order.
    ///
    /// Sorted kinds are sorted afterwards with [`Self::sort_index`].
    pub fn add_index(&mut self, name: &str, kind: IndexKind, descending: bool) -> Result<()> {
        if self.indexes.contains_key(name) {
            return Err(ItemDbError::IndexAlreadyExists {
                attribute: self.attribute.clone(),
                index: name.to_string(),
            });
        }
        let mut index = SecondaryIndex::new(kind, descending);
        for key in self.keys()? {
            index.push(key);
        }
        self.indexes.insert(name.to_string(), IndexSlot::Loaded(index));
        self.dirty_indexes.insert(name.to_string());
        self.removed_indexes.remove(name);
        self.header_dirty = true;
        Ok(())
    }

    /// Detach an index
    pub fn remove_index(&mut self, name: &str) -> Result<()> {
        if self.indexes.remove(name).is_none() {
            return Err(self.no_index(name));
        }
        self.dirty_indexes.remove(name);
        self.removed_indexes.insert(name.to_string());
        self.header_dirty = true;
        Ok(())
    }

    /// Re-sort a whole index
    pub fn sort_index(&mut self, name: &str, order: KeyOrder<'_>) -> Result<()> {
        self.loaded_index_mut(name)?.sort(order);
        Ok(())
    }

    /// Move one key to its sorted position
    pub fn reposition(&mut self, name: &str, key: ItemId, order: KeyOrder<'_>) -> Result<()> {
        if !self.contains(key) {
            return Err(self.not_member(key));
        }
        self.loaded_index_mut(name)?.insert_sorted(key, order);
        Ok(())
    }

    /// Move `key` right after `after` in the named index
    pub fn place_in_index(&mut self, name: &str, key: ItemId, after: Option<ItemId>) -> Result<()> {
        if !self.loaded_index_mut(name)?.place(key, after) {
            let missing = match after {
                Some(a) if self.contains(key) && a != key => a,
                _ => key,
            };
            return Err(self.not_member(missing));
        }
        self.placed_indexes.insert(name.to_string());
        Ok(())
    }

    /// Set the integer payload of `key` in the named index
    pub fn set_entry_value(&mut self, name: &str, key: ItemId, value: i64) -> Result<()> {
        if !self.contains(key) {
            return Err(self.not_member(key));
        }
        self.loaded_index_mut(name)?.set_entry_value(key, value);
        self.placed_indexes.insert(name.to_string());
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// True when anything must be written
    pub fn is_dirty(&self) -> bool {
        self.header_dirty
            || !self.dirty_entries.is_empty()
            || !self.removed_entries.is_empty()
            || !self.dirty_indexes.is_empty()
            || !self.removed_indexes.is_empty()
    }

    /// Members added, removed, re-aliased or placed since the last commit
    pub fn touched(&self) -> &BTreeSet<ItemId> {
        &self.touched
    }

    /// True when an index was detached, or placed or valued by hand, since
    /// the last commit
    pub fn has_index_edits(&self) -> bool {
        !self.placed_indexes.is_empty() || !self.removed_indexes.is_empty()
    }

    /// Header as persisted
    pub fn header(&self) -> CollectionHeader {
        CollectionHeader {
            first: self.head,
            last: self.tail,
            count: self.len,
            aliases: self.aliases.iter().map(|(a, k)| (a.clone(), *k)).collect(),
            indexes: self
                .indexes
                .iter()
                .map(|(name, slot)| (name.clone(), slot.kind().clone()))
                .collect(),
        }
    }

    /// Entries to write; `None` removes
    pub fn changed_links(&self) -> Vec<(ItemId, Option<LinkRecord>)> {
        let mut out: Vec<(ItemId, Option<LinkRecord>)> = self
            .dirty_entries
            .iter()
            .filter_map(|k| self.entries.get(k).map(|e| (*k, Some(LinkRecord::from(e)))))
            .collect();
        out.extend(self.removed_entries.iter().map(|k| (*k, None)));
        out
    }

    /// Index records to write; `None` removes
    pub fn changed_indexes(&self) -> Vec<(String, Option<IndexRecord>)> {
        let mut out: Vec<(String, Option<IndexRecord>)> = self
            .dirty_indexes
            .iter()
            .filter_map(|name| match self.indexes.get(name) {
                Some(IndexSlot::Loaded(index)) => Some((name.clone(), Some(index.to_record()))),
                _ => None,
            })
            .collect();
        out.extend(self.removed_indexes.iter().map(|n| (n.clone(), None)));
        out
    }

    /// Everything written at `version`; later loads read from there
    pub fn committed(&mut self, store: Arc<Store>, version: Version) {
        self.dirty_entries.clear();
        self.removed_entries.clear();
        self.touched.clear();
        self.dirty_indexes.clear();
        self.removed_indexes.clear();
        self.placed_indexes.clear();
        self.header_dirty = false;
        self.source = Some(LinkSource { store, version });
    }

    /// Read unloaded entries at `version` from now on. Only valid when no
    /// record of this collection changed in between.
    pub(crate) fn rebase_source(&mut self, version: Version) {
        if let Some(source) = &mut self.source {
            source.version = version;
        }
    }

    // ========================================================================
    // Consistency
    // ========================================================================

    /// Structural problems: length, links, aliases, index membership
    pub fn check_structure(&mut self) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        let label = format!("{}.{}", self.owner, self.attribute);
        let keys = match self.keys() {
            Ok(keys) => keys,
            Err(e) => {
                problems.push(format!("{}: {}", label, e));
                return Ok(problems);
            }
        };
        if keys.len() != self.len {
            problems.push(format!(
                "{}: length {} but {} members linked",
                label,
                self.len,
                keys.len()
            ));
        }
        let mut prev = None;
        for key in &keys {
            let entry = self.entry(*key)?.clone();
            if entry.prev != prev {
                problems.push(format!("{}: {} has a stale previous pointer", label, key));
            }
            prev = Some(*key);
        }
        for (alias, holder) in self.aliases.clone() {
            let ok = self.contains(holder)
                && self.entry(holder)?.alias.as_deref() == Some(alias.as_str());
            if !ok {
                problems.push(format!("{}: alias '{}' points at {}", label, alias, holder));
            }
        }
        let members: HashSet<ItemId> = keys.iter().copied().collect();
        for name in self.index_names() {
            let index = self.index(&name)?;
            let indexed: HashSet<ItemId> = index.keys().iter().copied().collect();
            if indexed.len() != index.len() {
                problems.push(format!("{}: index '{}' holds a key twice", label, name));
            }
            if indexed != members {
                problems.push(format!("{}: index '{}' disagrees with members", label, name));
            }
        }
        Ok(problems)
    }
}
