//! Reference container
//!
//! Per item, attribute name to [`RefValue`]: a single [`Link`], an ordered
//! [`RefCollection`], or an explicit empty reference. Names of changed
//! slots are tracked for the commit and merge paths.

use crate::collection::RefCollection;
use crate::link::{Endpoint, Link};
use itemdb_core::ItemId;
use std::collections::{BTreeMap, BTreeSet};

/// Contents of one reference attribute
#[derive(Debug, Clone)]
pub enum RefValue {
    /// Explicitly no peer
    Empty,
    /// One peer
    Single(Link),
    /// Ordered collection of peers
    Collection(RefCollection),
}

impl RefValue {
    /// Resolved single peer, if any
    pub fn single(&self) -> Option<ItemId> {
        match self {
            RefValue::Single(link) => link.peer().resolved(),
            _ => None,
        }
    }

    /// Peer endpoint of a single reference
    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            RefValue::Single(link) => Some(link.peer()),
            _ => None,
        }
    }

    /// Collection, if this is one
    pub fn collection(&self) -> Option<&RefCollection> {
        match self {
            RefValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    /// Mutable collection, if this is one
    pub fn collection_mut(&mut self) -> Option<&mut RefCollection> {
        match self {
            RefValue::Collection(c) => Some(c),
            _ => None,
        }
    }
}

/// Attribute name to reference
#[derive(Debug, Clone, Default)]
pub struct References {
    slots: BTreeMap<String, RefValue>,
    dirty: BTreeSet<String>,
}

impl References {
    /// Empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference under `name`
    pub fn get(&self, name: &str) -> Option<&RefValue> {
        self.slots.get(name)
    }

    /// Mutable reference under `name`; marks it dirty
    pub fn get_mut(&mut self, name: &str) -> Option<&mut RefValue> {
        let slot = self.slots.get_mut(name)?;
        self.dirty.insert(name.to_string());
        Some(slot)
    }

    /// Mutable reference under `name` for lazy loading; not a change
    pub fn get_mut_clean(&mut self, name: &str) -> Option<&mut RefValue> {
        self.slots.get_mut(name)
    }

    /// Set `name`; `dirty` is false for loads
    pub fn set(&mut self, name: &str, value: RefValue, dirty: bool) {
        self.slots.insert(name.to_string(), value);
        if dirty {
            self.dirty.insert(name.to_string());
        }
    }

    /// Take a slot out without recording a change
    pub fn take(&mut self, name: &str) -> Option<RefValue> {
        self.slots.remove(name)
    }

    /// Put back a slot taken with [`Self::take`]
    pub fn restore(&mut self, name: &str, value: RefValue) {
        self.slots.insert(name.to_string(), value);
    }

    /// Every slot in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RefValue)> {
        self.slots.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Mutable slots in name order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut RefValue)> {
        self.slots.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of present slots
    pub fn names(&self) -> Vec<String> {
        self.slots.keys().cloned().collect()
    }

    /// Record a change to `name`
    pub fn mark_dirty(&mut self, name: &str) {
        self.dirty.insert(name.to_string());
    }

    /// True when any slot changed
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Names of changed slots
    pub fn dirty_names(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    /// Forget every change
    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
    }
}
