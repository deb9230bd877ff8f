//! Materialized items
//!
//! An [`Item`] is a view's private copy of one stored item at the view's
//! version: header, literal values, references and ACLs, plus the status
//! bits the view's change log is built from. Items are reached through
//! their view; nothing here touches the store.

use crate::refs::References;
use crate::values::Values;
use bitflags::bitflags;
use itemdb_core::{Acl, ItemId, ItemStatus, Value, Version};
use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    /// Item status inside a view
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ItemFlags: u32 {
        /// Created in this view, never committed
        const NEW = 0x0001;
        /// Deleted in this view
        const DELETED = 0x0002;
        /// Deletion scheduled for the next commit
        const DEFERRED = 0x0004;
        /// Kept loaded across refresh and pruning
        const PINNED = 0x0008;
        /// Literal values changed
        const VDIRTY = 0x0010;
        /// References changed
        const RDIRTY = 0x0020;
        /// Name or parent changed
        const NDIRTY = 0x0040;
        /// ACLs changed
        const ADIRTY = 0x0080;
    }
}

impl ItemFlags {
    /// Any of the dirty bits
    pub const DIRTY: ItemFlags = ItemFlags::VDIRTY
        .union(ItemFlags::RDIRTY)
        .union(ItemFlags::NDIRTY)
        .union(ItemFlags::ADIRTY);
}

/// A view's copy of one item
#[derive(Debug, Clone)]
pub struct Item {
    pub(crate) id: ItemId,
    pub(crate) kind: Option<String>,
    pub(crate) name: Option<String>,
    pub(crate) parent: Option<ItemId>,
    pub(crate) base_name: Option<String>,
    pub(crate) base_parent: Option<ItemId>,
    pub(crate) flags: ItemFlags,
    pub(crate) version: Version,
    pub(crate) values: Values,
    pub(crate) refs: References,
    pub(crate) acl_names: BTreeSet<String>,
    pub(crate) acls: BTreeMap<String, Option<Acl>>,
    pub(crate) dirty_acls: BTreeSet<String>,
    pub(crate) last_access: u64,
}

impl Item {
    pub(crate) fn new(id: ItemId, kind: Option<String>, version: Version) -> Self {
        Self {
            id,
            kind,
            name: None,
            parent: None,
            base_name: None,
            base_parent: None,
            flags: ItemFlags::NEW,
            version,
            values: Values::new(),
            refs: References::new(),
            acl_names: BTreeSet::new(),
            acls: BTreeMap::new(),
            dirty_acls: BTreeSet::new(),
            last_access: 0,
        }
    }

    /// Identity
    pub fn id(&self) -> ItemId {
        self.id
    }

    /// Kind name
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Name under the parent
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Parent item
    pub fn parent(&self) -> Option<ItemId> {
        self.parent
    }

    /// Version the item was loaded or last committed at
    pub fn version(&self) -> Version {
        self.version
    }

    /// Status bits
    pub fn flags(&self) -> ItemFlags {
        self.flags
    }

    /// Never committed
    pub fn is_new(&self) -> bool {
        self.flags.contains(ItemFlags::NEW)
    }

    /// Deleted, or scheduled for deletion
    pub fn is_deleted(&self) -> bool {
        self.flags.intersects(ItemFlags::DELETED | ItemFlags::DEFERRED)
    }

    /// Has uncommitted changes
    pub fn is_dirty(&self) -> bool {
        self.flags
            .intersects(ItemFlags::DIRTY | ItemFlags::NEW | ItemFlags::DELETED | ItemFlags::DEFERRED)
    }

    /// Pinned in the view's cache
    pub fn is_pinned(&self) -> bool {
        self.flags.contains(ItemFlags::PINNED)
    }

    /// Literal values
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// References
    pub fn refs(&self) -> &References {
        &self.refs
    }

    /// Value of `name`, ignoring schema defaults
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// New name when renamed since the last commit
    pub fn renamed(&self) -> Option<String> {
        if self.name != self.base_name {
            self.name.clone()
        } else {
            None
        }
    }

    /// New parent when moved since the last commit
    pub fn moved(&self) -> Option<Option<ItemId>> {
        if self.parent != self.base_parent {
            Some(self.parent)
        } else {
            None
        }
    }

    /// Status bits as persisted in the commit log
    pub(crate) fn status(&self) -> ItemStatus {
        let mut status = ItemStatus::empty();
        status.set(ItemStatus::NEW, self.flags.contains(ItemFlags::NEW));
        status.set(ItemStatus::DELETED, self.flags.contains(ItemFlags::DELETED));
        status.set(ItemStatus::VDIRTY, self.flags.contains(ItemFlags::VDIRTY));
        status.set(ItemStatus::RDIRTY, self.flags.contains(ItemFlags::RDIRTY));
        status.set(ItemStatus::NDIRTY, self.flags.contains(ItemFlags::NDIRTY));
        status.set(ItemStatus::ADIRTY, self.flags.contains(ItemFlags::ADIRTY));
        status
    }

    /// Forget changes after they were written at `version`
    pub(crate) fn clear_dirty(&mut self, version: Version) {
        self.flags.remove(ItemFlags::DIRTY | ItemFlags::NEW);
        self.version = version;
        self.base_name = self.name.clone();
        self.base_parent = self.parent;
        self.values.clear_dirty();
        self.refs.clear_dirty();
        self.dirty_acls.clear();
    }
}
