//! Literal value container
//!
//! One [`Values`] per item maps attribute names to literal values. Every
//! entry carries its own flags so the commit path can pick out exactly the
//! dirty, persistent entries, and the merge path can diff them by name.

use bitflags::bitflags;
use itemdb_core::Value;
use std::collections::{BTreeMap, BTreeSet};

bitflags! {
    /// Per-entry bookkeeping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// Changed since the last commit or load
        const DIRTY = 0x1;
        /// Never persisted
        const TRANSIENT = 0x2;
        /// Rejects writes once committed
        const READ_ONLY = 0x4;
    }
}

/// Whether a write is a user change or a load from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Mark the entry dirty
    Dirty,
    /// Leave dirty bookkeeping alone
    Loading,
}

/// One value with its flags
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEntry {
    /// The literal
    pub value: Value,
    /// Bookkeeping
    pub flags: EntryFlags,
}

/// Minimal diff keyed by attribute name; `None` means removed
pub type ValueChanges = BTreeMap<String, Option<Value>>;

/// Attribute name to literal value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Values {
    entries: BTreeMap<String, ValueEntry>,
    removed: BTreeSet<String>,
}

impl Values {
    /// Empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `name`
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).map(|e| &e.value)
    }

    /// Value of `name`, or `default`
    pub fn get_or<'a>(&'a self, name: &str, default: &'a Value) -> &'a Value {
        self.get(name).unwrap_or(default)
    }

    /// Entry of `name` with flags
    pub fn entry(&self, name: &str) -> Option<&ValueEntry> {
        self.entries.get(name)
    }

    /// True when `name` holds a value
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no value is set
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store `value` under `name`, keeping existing TRANSIENT/READ_ONLY
    /// flags and adding `extra`.
    ///
    /// Returns true when the stored value changed.
    pub fn set(&mut self, name: &str, value: Value, mode: SetMode, extra: EntryFlags) -> bool {
        let dirty = if mode == SetMode::Dirty {
            EntryFlags::DIRTY
        } else {
            EntryFlags::empty()
        };
        match self.entries.get_mut(name) {
            Some(entry) => {
                let changed = entry.value != value;
                entry.value = value;
                entry.flags |= extra;
                if changed {
                    entry.flags |= dirty;
                }
                changed
            }
            None => {
                self.entries.insert(
                    name.to_string(),
                    ValueEntry {
                        value,
                        flags: extra | dirty,
                    },
                );
                if mode == SetMode::Dirty {
                    self.removed.remove(name);
                }
                true
            }
        }
    }

    /// Remove `name`, returning the old value
    pub fn remove(&mut self, name: &str, mode: SetMode) -> Option<Value> {
        let entry = self.entries.remove(name)?;
        if mode == SetMode::Dirty && !entry.flags.contains(EntryFlags::TRANSIENT) {
            self.removed.insert(name.to_string());
        }
        Some(entry.value)
    }

    /// Every value in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.value))
    }

    /// Dirty persistent entries; `None` for removals
    pub fn iter_dirty(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        let set = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.flags.contains(EntryFlags::DIRTY) && !e.flags.contains(EntryFlags::TRANSIENT)
            })
            .map(|(k, e)| (k.as_str(), Some(&e.value)));
        let removed = self.removed.iter().map(|k| (k.as_str(), None));
        set.chain(removed)
    }

    /// True when a persistent entry changed
    pub fn is_dirty(&self) -> bool {
        self.iter_dirty().next().is_some()
    }

    /// Names of dirty persistent entries
    pub fn dirty_names(&self) -> BTreeSet<String> {
        self.iter_dirty().map(|(k, _)| k.to_string()).collect()
    }

    /// Forget every change
    pub fn clear_dirty(&mut self) {
        for entry in self.entries.values_mut() {
            entry.flags.remove(EntryFlags::DIRTY);
        }
        self.removed.clear();
    }

    /// Names of entries that persist
    pub fn persistent_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.flags.contains(EntryFlags::TRANSIENT))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Values never persisted, with their flags
    pub fn transient_entries(&self) -> Vec<(String, ValueEntry)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.flags.contains(EntryFlags::TRANSIENT))
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }

    /// Diff of every dirty persistent entry
    pub fn collect_changes(&self) -> ValueChanges {
        self.iter_dirty()
            .map(|(k, v)| (k.to_string(), v.cloned()))
            .collect()
    }

    /// Apply a diff as a load: entries change but nothing becomes dirty
    pub fn apply_changes(&mut self, changes: ValueChanges) {
        for (name, value) in changes {
            match value {
                Some(v) => {
                    self.set(&name, v, SetMode::Loading, EntryFlags::empty());
                    if let Some(e) = self.entries.get_mut(&name) {
                        e.flags.remove(EntryFlags::DIRTY);
                    }
                }
                None => {
                    self.remove(&name, SetMode::Loading);
                }
            }
            self.removed.remove(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_marks_dirty_only_on_change() {
        let mut values = Values::new();
        values.set("title", Value::from("x"), SetMode::Loading, EntryFlags::empty());
        assert!(!values.is_dirty());
        assert!(!values.set("title", Value::from("x"), SetMode::Dirty, EntryFlags::empty()));
        assert!(!values.is_dirty());
        assert!(values.set("title", Value::from("y"), SetMode::Dirty, EntryFlags::empty()));
        assert_eq!(values.dirty_names().into_iter().collect::<Vec<_>>(), vec!["title"]);
    }

    #[test]
    fn test_transient_never_dirty() {
        let mut values = Values::new();
        values.set("scratch", Value::Int(1), SetMode::Dirty, EntryFlags::TRANSIENT);
        assert!(!values.is_dirty());
        assert!(values.persistent_names().is_empty());
        values.remove("scratch", SetMode::Dirty);
        assert!(!values.is_dirty());
    }

    #[test]
    fn test_collect_and_apply_changes() {
        let mut local = Values::new();
        local.set("a", Value::Int(1), SetMode::Loading, EntryFlags::empty());
        local.set("b", Value::Int(2), SetMode::Loading, EntryFlags::empty());
        local.set("a", Value::Int(10), SetMode::Dirty, EntryFlags::empty());
        local.remove("b", SetMode::Dirty);
        let changes = local.collect_changes();
        assert_eq!(changes.get("a"), Some(&Some(Value::Int(10))));
        assert_eq!(changes.get("b"), Some(&None));

        let mut other = Values::new();
        other.set("b", Value::Int(2), SetMode::Loading, EntryFlags::empty());
        other.apply_changes(changes);
        assert_eq!(other.get("a"), Some(&Value::Int(10)));
        assert!(!other.contains("b"));
        assert!(!other.is_dirty());
    }

    #[test]
    fn test_get_or_default() {
        let values = Values::new();
        let fallback = Value::from("none");
        assert_eq!(values.get_or("missing", &fallback), &fallback);
    }
}
