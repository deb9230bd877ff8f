//! Bi-directional references
//!
//! Every reference write goes through attach/detach so both ends change
//! together: setting `a.owner = b` also adds `a` to `b.owned`, and taking
//! `a` out of `b.owned` clears `a.owner`. Sorted collection indexes are
//! repositioned here too, whenever membership or a watched value changes.

use super::{Collection, View};
use crate::collection::{Placement, RefCollection};
use crate::item::{Item, ItemFlags};
use crate::link::{Endpoint, Link, StubTarget};
use crate::refs::RefValue;
use crate::shared::Comparator;
use itemdb_core::{
    compare_values, Cardinality, IndexKind, ItemDbError, ItemId, ItemPath, RefSpec, Result,
};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, warn};

fn dangling(item: ItemId, attribute: &str, target: impl ToString) -> ItemDbError {
    ItemDbError::DanglingReference {
        item,
        attribute: attribute.to_string(),
        target: target.to_string(),
    }
}

/// Order of two members under a sorted index; ties break on id
fn member_order(
    items: &HashMap<ItemId, Item>,
    kind: &IndexKind,
    comparator: Option<&Comparator>,
    a: ItemId,
    b: ItemId,
) -> Ordering {
    let primary = match kind {
        IndexKind::Sequence => Ordering::Equal,
        IndexKind::Attribute { attribute } => {
            let va = items.get(&a).and_then(|i| i.values.get(attribute));
            let vb = items.get(&b).and_then(|i| i.values.get(attribute));
            match (va, vb) {
                (Some(x), Some(y)) => compare_values(x, y),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }
        IndexKind::Comparator { .. } => match (items.get(&a), items.get(&b), comparator) {
            (Some(x), Some(y), Some(compare)) => compare(x, y),
            _ => Ordering::Equal,
        },
    };
    primary.then_with(|| a.cmp(&b))
}

impl View {
    // ========================================================================
    // Schema lookups
    // ========================================================================

    /// Reference declaration of `attribute` on loaded item `id`
    pub(crate) fn ref_spec(&self, id: ItemId, attribute: &str) -> Result<RefSpec> {
        let item = self.items.get(&id).ok_or(ItemDbError::NoSuchItem(id))?;
        let def = self
            .shared
            .schema
            .attribute(item.kind.as_deref(), attribute)
            .ok_or_else(|| {
                ItemDbError::Schema(format!(
                    "kind {} declares no attribute '{}'",
                    item.kind.as_deref().unwrap_or("<none>"),
                    attribute
                ))
            })?;
        def.reference.clone().ok_or_else(|| ItemDbError::Cardinality {
            attribute: attribute.to_string(),
            message: "literal attribute; use the value operations".into(),
        })
    }

    fn single_spec(&self, id: ItemId, attribute: &str) -> Result<RefSpec> {
        let spec = self.ref_spec(id, attribute)?;
        if spec.cardinality == Cardinality::List {
            return Err(ItemDbError::Cardinality {
                attribute: attribute.to_string(),
                message: "collection attribute; use the collection operations".into(),
            });
        }
        Ok(spec)
    }

    pub(crate) fn list_spec(&self, id: ItemId, attribute: &str) -> Result<RefSpec> {
        let spec = self.ref_spec(id, attribute)?;
        if spec.cardinality == Cardinality::Single {
            return Err(ItemDbError::Cardinality {
                attribute: attribute.to_string(),
                message: "single reference; use set_ref".into(),
            });
        }
        Ok(spec)
    }

    /// `peer.other_name` must be declared and point back at `attribute`
    fn check_reverse(&self, peer: ItemId, other_name: &str, attribute: &str) -> Result<RefSpec> {
        let spec = self.ref_spec(peer, other_name)?;
        if spec.other_name != attribute {
            return Err(ItemDbError::Schema(format!(
                "{}.{} points back at '{}', not '{}'",
                peer, other_name, spec.other_name, attribute
            )));
        }
        Ok(spec)
    }

    // ========================================================================
    // Attach / detach
    // ========================================================================

    /// Make `peer.other_name` hold `owner`
    pub(crate) fn attach_reverse(
        &mut self,
        peer: ItemId,
        other_name: &str,
        owner: ItemId,
        owner_attribute: &str,
    ) -> Result<()> {
        if !self.load(peer)? {
            return Err(dangling(owner, owner_attribute, peer));
        }
        let spec = self.check_reverse(peer, other_name, owner_attribute)?;
        match spec.cardinality {
            Cardinality::Single => {
                let current = self
                    .items
                    .get(&peer)
                    .and_then(|i| i.refs.get(other_name))
                    .and_then(RefValue::single);
                if current == Some(owner) {
                    return Ok(());
                }
                if let Some(previous) = current {
                    warn!(
                        target: "itemdb::view",
                        item = %peer,
                        attribute = other_name,
                        previous = %previous,
                        new = %owner,
                        "Implicit reassignment of single reference; detaching previous peer"
                    );
                    self.detach_reverse(previous, owner_attribute, peer)?;
                }
                if let Some(item) = self.items.get_mut(&peer) {
                    let link = Link::new(peer, other_name, Endpoint::Resolved(owner));
                    item.refs.set(other_name, RefValue::Single(link), true);
                }
                self.mark_dirty(peer, ItemFlags::RDIRTY);
            }
            Cardinality::List => {
                let added = {
                    let coll = self.collection_for_write(peer, other_name, owner_attribute)?;
                    coll.insert(owner, Placement::Last, None)?
                };
                self.mark_dirty(peer, ItemFlags::RDIRTY);
                if added {
                    self.resort(peer, other_name, Some(owner), None)?;
                }
            }
        }
        Ok(())
    }

    /// Take `owner` out of `peer.other_name`, if it is there
    pub(crate) fn detach_reverse(&mut self, peer: ItemId, other_name: &str, owner: ItemId) -> Result<()> {
        if !self.load(peer)? {
            return Ok(());
        }
        let Some(item) = self.items.get_mut(&peer) else {
            return Ok(());
        };
        let changed = match item.refs.take(other_name) {
            Some(RefValue::Single(link)) if link.peer().resolved() == Some(owner) => {
                item.refs.restore(other_name, RefValue::Empty);
                true
            }
            Some(RefValue::Collection(mut coll)) => {
                let result = if coll.contains(owner) {
                    coll.remove(owner).map(|_| true)
                } else {
                    Ok(false)
                };
                item.refs.restore(other_name, RefValue::Collection(coll));
                result?
            }
            Some(other) => {
                item.refs.restore(other_name, other);
                false
            }
            None => false,
        };
        if changed {
            item.refs.mark_dirty(other_name);
            self.mark_dirty(peer, ItemFlags::RDIRTY);
        }
        Ok(())
    }

    // ========================================================================
    // Single references
    // ========================================================================

    /// Peer of a single reference, resolving a stub on first access
    pub fn get_ref(&mut self, id: ItemId, attribute: &str) -> Result<Option<ItemId>> {
        self.ensure_open()?;
        self.live(id)?;
        let deferred = match self.items.get(&id).and_then(|i| i.refs.get(attribute)) {
            None | Some(RefValue::Empty) => return Ok(None),
            Some(RefValue::Single(link)) => match link.peer() {
                Endpoint::Resolved(peer) => return Ok(Some(*peer)),
                Endpoint::Deferred(_) => true,
            },
            Some(RefValue::Collection(_)) => false,
        };
        if deferred {
            return self.resolve_stub(id, attribute);
        }
        Err(ItemDbError::Cardinality {
            attribute: attribute.to_string(),
            message: "collection attribute; use collection()".into(),
        })
    }

    /// Point `id.attribute` at `target` (clear with `None`), updating both
    /// the old and the new peer
    pub fn set_ref(&mut self, id: ItemId, attribute: &str, target: Option<ItemId>) -> Result<()> {
        self.ensure_open()?;
        self.live(id)?;
        let spec = self.single_spec(id, attribute)?;
        if let Some(t) = target {
            if !self.load(t)? {
                return Err(dangling(id, attribute, t));
            }
            self.check_reverse(t, &spec.other_name, attribute)?;
        }
        self.assign_single(id, attribute, &spec.other_name, target)
    }

    pub(crate) fn assign_single(
        &mut self,
        id: ItemId,
        attribute: &str,
        other_name: &str,
        target: Option<ItemId>,
    ) -> Result<()> {
        let (had_link, old_peer) = match self.items.get(&id).and_then(|i| i.refs.get(attribute)) {
            Some(RefValue::Single(link)) => (true, link.peer().resolved()),
            _ => (false, None),
        };
        if !had_link && target.is_none() {
            return Ok(());
        }
        if old_peer.is_some() && old_peer == target {
            return Ok(());
        }
        if let Some(old) = old_peer {
            self.detach_reverse(old, other_name, id)?;
        }
        let slot = match target {
            Some(t) => RefValue::Single(Link::new(id, attribute, Endpoint::Resolved(t))),
            None => RefValue::Empty,
        };
        if let Some(item) = self.items.get_mut(&id) {
            item.refs.set(attribute, slot, true);
        }
        self.mark_dirty(id, ItemFlags::RDIRTY);
        if let Some(t) = target {
            self.attach_reverse(t, other_name, id, attribute)?;
        }
        Ok(())
    }

    /// Point `id.attribute` at an item that may not be reachable yet.
    ///
    /// The stub resolves on first read or at commit; the reverse side is
    /// attached then.
    pub fn set_ref_stub(&mut self, id: ItemId, attribute: &str, target: StubTarget) -> Result<()> {
        self.ensure_open()?;
        self.live(id)?;
        let spec = self.single_spec(id, attribute)?;
        let old_peer = self
            .items
            .get(&id)
            .and_then(|i| i.refs.get(attribute))
            .and_then(RefValue::single);
        if let Some(old) = old_peer {
            self.detach_reverse(old, &spec.other_name, id)?;
        }
        if let Some(item) = self.items.get_mut(&id) {
            let link = Link::new(id, attribute, Endpoint::Deferred(target));
            item.refs.set(attribute, RefValue::Single(link), true);
        }
        self.mark_dirty(id, ItemFlags::RDIRTY);
        Ok(())
    }

    /// Stub by absolute path
    pub fn set_ref_path(&mut self, id: ItemId, attribute: &str, path: &str) -> Result<()> {
        let parsed =
            ItemPath::parse(path).ok_or_else(|| ItemDbError::NoSuchPath(path.to_string()))?;
        self.set_ref_stub(id, attribute, StubTarget::Path(parsed))
    }

    fn resolve_stub(&mut self, id: ItemId, attribute: &str) -> Result<Option<ItemId>> {
        let target = match self.items.get(&id).and_then(|i| i.refs.get(attribute)) {
            Some(RefValue::Single(link)) => match link.peer() {
                Endpoint::Deferred(t) => t.clone(),
                Endpoint::Resolved(peer) => return Ok(Some(*peer)),
            },
            _ => return Ok(None),
        };
        let peer = match &target {
            StubTarget::Id(t) => self.load(*t)?.then_some(*t),
            StubTarget::Path(p) => self.find_item_path(p)?,
        };
        let peer = peer.ok_or_else(|| dangling(id, attribute, &target))?;
        let spec = self.single_spec(id, attribute)?;
        self.check_reverse(peer, &spec.other_name, attribute)?;
        if let Some(RefValue::Single(link)) = self
            .items
            .get_mut(&id)
            .and_then(|i| i.refs.get_mut(attribute))
        {
            link.reattach(Endpoint::Resolved(peer));
        }
        self.mark_dirty(id, ItemFlags::RDIRTY);
        self.attach_reverse(peer, &spec.other_name, id, attribute)?;
        debug!(target: "itemdb::view", item = %id, attribute, peer = %peer, "Resolved stub");
        Ok(Some(peer))
    }

    /// Resolve every stub held by a dirty item
    pub(crate) fn resolve_stubs(&mut self) -> Result<()> {
        for id in self.log.clone() {
            let stubs: Vec<String> = match self.items.get(&id) {
                Some(item) if !item.is_deleted() => item
                    .refs
                    .iter()
                    .filter(|(_, slot)| slot.endpoint().map_or(false, Endpoint::is_deferred))
                    .map(|(name, _)| name.to_string())
                    .collect(),
                _ => continue,
            };
            for attribute in stubs {
                self.resolve_stub(id, &attribute)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Collection slot for reading; an absent one starts empty and clean
    pub(crate) fn read_collection(&mut self, owner: ItemId, attribute: &str) -> Result<&mut RefCollection> {
        let other = self.list_spec(owner, attribute)?.other_name;
        let item = self.items.get_mut(&owner).ok_or(ItemDbError::NoSuchItem(owner))?;
        if !matches!(item.refs.get(attribute), Some(RefValue::Collection(_))) {
            item.refs.restore(
                attribute,
                RefValue::Collection(RefCollection::new(owner, attribute, &other)),
            );
        }
        item.refs
            .get_mut_clean(attribute)
            .and_then(RefValue::collection_mut)
            .ok_or(ItemDbError::NoSuchItem(owner))
    }

    /// Collection slot for writing; marks it dirty
    pub(crate) fn collection_for_write(
        &mut self,
        owner: ItemId,
        attribute: &str,
        other_name: &str,
    ) -> Result<&mut RefCollection> {
        let item = self.items.get_mut(&owner).ok_or(ItemDbError::NoSuchItem(owner))?;
        if !matches!(item.refs.get(attribute), Some(RefValue::Collection(_))) {
            item.refs.set(
                attribute,
                RefValue::Collection(RefCollection::new(owner, attribute, other_name)),
                true,
            );
        }
        item.refs
            .get_mut(attribute)
            .and_then(RefValue::collection_mut)
            .ok_or(ItemDbError::NoSuchItem(owner))
    }

    /// Handle on the collection `owner.attribute`
    pub fn collection(&mut self, owner: ItemId, attribute: &str) -> Result<Collection<'_>> {
        self.ensure_open()?;
        self.live(owner)?;
        let spec = self.list_spec(owner, attribute)?;
        Ok(Collection::new(self, owner, attribute, spec.other_name))
    }

    /// Append `member` to `owner.attribute`; for a member already there
    /// only the alias changes
    pub fn add_ref(
        &mut self,
        owner: ItemId,
        attribute: &str,
        member: ItemId,
        alias: Option<&str>,
    ) -> Result<()> {
        self.insert_ref(owner, attribute, member, Placement::Last, alias)
    }

    /// Insert `member` into `owner.attribute` at `placement`
    pub fn insert_ref(
        &mut self,
        owner: ItemId,
        attribute: &str,
        member: ItemId,
        placement: Placement,
        alias: Option<&str>,
    ) -> Result<()> {
        self.ensure_open()?;
        self.live(owner)?;
        let spec = self.list_spec(owner, attribute)?;
        if !self.load(member)? {
            return Err(dangling(owner, attribute, member));
        }
        self.check_reverse(member, &spec.other_name, attribute)?;
        self.add_member(owner, attribute, &spec.other_name, member, placement, alias)
    }

    pub(crate) fn add_member(
        &mut self,
        owner: ItemId,
        attribute: &str,
        other_name: &str,
        member: ItemId,
        placement: Placement,
        alias: Option<&str>,
    ) -> Result<()> {
        let added = {
            let coll = self.collection_for_write(owner, attribute, other_name)?;
            coll.insert(member, placement, alias)?
        };
        self.mark_dirty(owner, ItemFlags::RDIRTY);
        if added {
            self.resort(owner, attribute, Some(member), None)?;
            self.attach_reverse(member, other_name, owner, attribute)?;
        }
        Ok(())
    }

    /// Take `member` out of `owner.attribute` and clear its reverse side
    pub fn remove_ref(&mut self, owner: ItemId, attribute: &str, member: ItemId) -> Result<()> {
        self.ensure_open()?;
        self.live(owner)?;
        let spec = self.list_spec(owner, attribute)?;
        self.remove_member(owner, attribute, &spec.other_name, member)
    }

    pub(crate) fn remove_member(
        &mut self,
        owner: ItemId,
        attribute: &str,
        other_name: &str,
        member: ItemId,
    ) -> Result<()> {
        self.collection_for_write(owner, attribute, other_name)?
            .remove(member)?;
        self.mark_dirty(owner, ItemFlags::RDIRTY);
        self.detach_reverse(member, other_name, owner)
    }

    /// Put `new` in the place of `old`, keeping alias and index positions
    pub fn replace_ref(&mut self, owner: ItemId, attribute: &str, old: ItemId, new: ItemId) -> Result<()> {
        self.ensure_open()?;
        self.live(owner)?;
        let spec = self.list_spec(owner, attribute)?;
        if !self.load(new)? {
            return Err(dangling(owner, attribute, new));
        }
        self.check_reverse(new, &spec.other_name, attribute)?;
        self.collection_for_write(owner, attribute, &spec.other_name)?
            .replace(old, new)?;
        self.mark_dirty(owner, ItemFlags::RDIRTY);
        self.detach_reverse(old, &spec.other_name, owner)?;
        self.attach_reverse(new, &spec.other_name, owner, attribute)?;
        self.resort(owner, attribute, Some(new), None)
    }

    /// Empty a single reference or a collection, detaching every peer
    pub fn clear_ref(&mut self, id: ItemId, attribute: &str) -> Result<()> {
        self.ensure_open()?;
        self.live(id)?;
        self.clear_reference(id, attribute)
    }

    pub(crate) fn clear_reference(&mut self, id: ItemId, attribute: &str) -> Result<()> {
        let spec = match self.ref_spec(id, attribute) {
            Ok(spec) => spec,
            Err(_) => {
                if let Some(item) = self.items.get_mut(&id) {
                    item.refs.set(attribute, RefValue::Empty, true);
                }
                self.mark_dirty(id, ItemFlags::RDIRTY);
                return Ok(());
            }
        };
        match spec.cardinality {
            Cardinality::Single => self.assign_single(id, attribute, &spec.other_name, None),
            Cardinality::List => {
                let keys = match self
                    .items
                    .get_mut(&id)
                    .and_then(|i| i.refs.get_mut_clean(attribute))
                {
                    Some(RefValue::Collection(c)) => c.keys()?,
                    _ => return Ok(()),
                };
                for key in keys {
                    self.remove_member(id, attribute, &spec.other_name, key)?;
                }
                Ok(())
            }
        }
    }

    /// Every peer of `id.attribute`, in base order for collections
    pub fn peers(&mut self, id: ItemId, attribute: &str) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        self.live(id)?;
        let item = self.items.get_mut(&id).ok_or(ItemDbError::NoSuchItem(id))?;
        Ok(match item.refs.get_mut_clean(attribute) {
            None | Some(RefValue::Empty) => Vec::new(),
            Some(RefValue::Single(link)) => link.peer().resolved().into_iter().collect(),
            Some(RefValue::Collection(c)) => c.keys()?,
        })
    }

    // ========================================================================
    // Sorted indexes
    // ========================================================================

    /// Re-sort the sorted indexes of `owner.attribute` (only `index` when
    /// given), moving only `key` when given
    pub(crate) fn resort(
        &mut self,
        owner: ItemId,
        attribute: &str,
        key: Option<ItemId>,
        index: Option<&str>,
    ) -> Result<()> {
        let sorted: Vec<(String, IndexKind)> =
            match self.items.get(&owner).and_then(|i| i.refs.get(attribute)) {
                Some(RefValue::Collection(c)) => c
                    .sorted_indexes()
                    .into_iter()
                    .filter(|(name, _)| index.map_or(true, |i| i == name))
                    .collect(),
                _ => return Ok(()),
            };
        if sorted.is_empty() {
            return Ok(());
        }
        let Some(RefValue::Collection(mut coll)) = self
            .items
            .get_mut(&owner)
            .and_then(|i| i.refs.take(attribute))
        else {
            return Ok(());
        };
        let result = self.sort_detached(&mut coll, &sorted, key);
        if let Some(item) = self.items.get_mut(&owner) {
            item.refs.restore(attribute, RefValue::Collection(coll));
            item.refs.mark_dirty(attribute);
        }
        self.mark_dirty(owner, ItemFlags::RDIRTY);
        result
    }

    fn sort_detached(
        &mut self,
        coll: &mut RefCollection,
        sorted: &[(String, IndexKind)],
        key: Option<ItemId>,
    ) -> Result<()> {
        for member in coll.keys()? {
            self.load(member)?;
        }
        for (name, kind) in sorted {
            let comparator = match kind {
                IndexKind::Comparator { method } => Some(self.shared.comparator(method)?),
                _ => None,
            };
            let items = &self.items;
            let order = |a: ItemId, b: ItemId| member_order(items, kind, comparator.as_ref(), a, b);
            match key {
                Some(k) => coll.reposition(name, k, &order)?,
                None => coll.sort_index(name, &order)?,
            }
        }
        Ok(())
    }

    /// After `attribute` of `id` changed, reposition `id` in every sorted
    /// index that orders by it
    pub(crate) fn reposition_in_watchers(&mut self, id: ItemId, attribute: &str) -> Result<()> {
        let shared = self.shared.clone();
        let mut watchers: Vec<(ItemId, String)> = Vec::new();
        if let Some(item) = self.items.get_mut(&id) {
            let kind = item.kind.clone();
            for (slot_name, slot) in item.refs.iter_mut() {
                let Some(other) = shared
                    .schema
                    .attribute(kind.as_deref(), slot_name)
                    .and_then(|d| d.other_name())
                else {
                    continue;
                };
                match slot {
                    RefValue::Single(link) => {
                        if let Some(peer) = link.peer().resolved() {
                            watchers.push((peer, other.to_string()));
                        }
                    }
                    RefValue::Collection(c) => {
                        for peer in c.keys()? {
                            watchers.push((peer, other.to_string()));
                        }
                    }
                    RefValue::Empty => {}
                }
            }
        }
        for (peer, coll_attribute) in watchers {
            if !self.load(peer)? {
                continue;
            }
            let names: Vec<String> = match self
                .items
                .get(&peer)
                .and_then(|i| i.refs.get(&coll_attribute))
            {
                Some(RefValue::Collection(c)) => c
                    .sorted_indexes()
                    .into_iter()
                    .filter(|(_, kind)| match kind {
                        IndexKind::Attribute { attribute: watched } => watched == attribute,
                        IndexKind::Comparator { .. } => true,
                        IndexKind::Sequence => false,
                    })
                    .map(|(name, _)| name)
                    .collect(),
                _ => continue,
            };
            for name in names {
                self.resort(peer, &coll_attribute, Some(id), Some(&name))?;
            }
        }
        Ok(())
    }
}
