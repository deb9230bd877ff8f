//! Secondary indexes over a reference collection
//!
//! An index holds every member key of its collection exactly once, in its
//! own order:
//! - Sequence: explicit positions, new members appended
//! - Attribute: ordered by one attribute of each member
//! - Comparator: ordered by a registered comparison method
//!
//! Sorted indexes never read members themselves. The view resolves member
//! values and hands a key comparison in.

use itemdb_core::{IndexKind, IndexRecord, ItemId};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Key comparison supplied by the view for sorted indexes
pub type KeyOrder<'a> = &'a dyn Fn(ItemId, ItemId) -> Ordering;

/// One named index
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryIndex {
    kind: IndexKind,
    descending: bool,
    keys: Vec<ItemId>,
    entry_values: HashMap<ItemId, i64>,
}

impl SecondaryIndex {
    /// Empty index
    pub fn new(kind: IndexKind, descending: bool) -> Self {
        Self {
            kind,
            descending,
            keys: Vec::new(),
            entry_values: HashMap::new(),
        }
    }

    /// Rebuild from its persisted form
    pub fn from_record(record: IndexRecord) -> Self {
        Self {
            kind: record.kind,
            descending: record.descending,
            keys: record.keys,
            entry_values: record.entry_values.into_iter().collect(),
        }
    }

    /// Persisted form; zero entry values are omitted
    pub fn to_record(&self) -> IndexRecord {
        let mut entry_values: Vec<(ItemId, i64)> = self
            .entry_values
            .iter()
            .filter(|(_, v)| **v != 0)
            .map(|(k, v)| (*k, *v))
            .collect();
        entry_values.sort();
        IndexRecord {
            kind: self.kind.clone(),
            descending: self.descending,
            keys: self.keys.clone(),
            entry_values,
        }
    }

    /// Ordering
    pub fn kind(&self) -> &IndexKind {
        &self.kind
    }

    /// True for attribute and comparator indexes
    pub fn is_sorted(&self) -> bool {
        !matches!(self.kind, IndexKind::Sequence)
    }

    /// Reverse order
    pub fn descending(&self) -> bool {
        self.descending
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in index order
    pub fn keys(&self) -> &[ItemId] {
        &self.keys
    }

    /// Position of `key`
    pub fn position(&self, key: ItemId) -> Option<usize> {
        self.keys.iter().position(|k| *k == key)
    }

    /// Key at `position`; negative positions count from the end
    pub fn get(&self, position: isize) -> Option<ItemId> {
        let len = self.keys.len() as isize;
        let at = if position < 0 { len + position } else { position };
        if at < 0 || at >= len {
            return None;
        }
        self.keys.get(at as usize).copied()
    }

    /// Key after `key`
    pub fn next(&self, key: ItemId) -> Option<ItemId> {
        self.position(key).and_then(|p| self.keys.get(p + 1).copied())
    }

    /// Key before `key`
    pub fn previous(&self, key: ItemId) -> Option<ItemId> {
        match self.position(key) {
            Some(p) if p > 0 => self.keys.get(p - 1).copied(),
            _ => None,
        }
    }

    /// Integer payload of an entry (0 when unset)
    pub fn entry_value(&self, key: ItemId) -> i64 {
        self.entry_values.get(&key).copied().unwrap_or(0)
    }

    pub(crate) fn set_entry_value(&mut self, key: ItemId, value: i64) {
        if value == 0 {
            self.entry_values.remove(&key);
        } else {
            self.entry_values.insert(key, value);
        }
    }

    pub(crate) fn push(&mut self, key: ItemId) {
        self.keys.push(key);
    }

    pub(crate) fn remove(&mut self, key: ItemId) -> bool {
        self.entry_values.remove(&key);
        match self.position(key) {
            Some(p) => {
                self.keys.remove(p);
                true
            }
            None => false,
        }
    }

    /// Swap `old` for `new` in place, keeping position and payload
    pub(crate) fn replace(&mut self, old: ItemId, new: ItemId) -> bool {
        let Some(p) = self.position(old) else {
            return false;
        };
        self.keys[p] = new;
        if let Some(v) = self.entry_values.remove(&old) {
            self.entry_values.insert(new, v);
        }
        true
    }

    /// Move `key` right after `after` (`None` moves it first)
    pub(crate) fn place(&mut self, key: ItemId, after: Option<ItemId>) -> bool {
        if after == Some(key) || self.position(key).is_none() {
            return false;
        }
        if let Some(a) = after {
            if self.position(a).is_none() {
                return false;
            }
        }
        self.keys.retain(|k| *k != key);
        let at = match after {
            Some(a) => self.position(a).map(|p| p + 1).unwrap_or(self.keys.len()),
            None => 0,
        };
        self.keys.insert(at, key);
        true
    }

    fn ordered(&self, order: KeyOrder<'_>, a: ItemId, b: ItemId) -> Ordering {
        let o = order(a, b);
        if self.descending {
            o.reverse()
        } else {
            o
        }
    }

    /// Insert `key` at its sorted position, or re-sort it if present
    pub(crate) fn insert_sorted(&mut self, key: ItemId, order: KeyOrder<'_>) {
        self.keys.retain(|k| *k != key);
        let at = self
            .keys
            .partition_point(|k| self.ordered(order, *k, key) != Ordering::Greater);
        self.keys.insert(at, key);
    }

    /// Re-sort every key
    pub(crate) fn sort(&mut self, order: KeyOrder<'_>) {
        let mut keys = std::mem::take(&mut self.keys);
        keys.sort_by(|a, b| self.ordered(order, *a, *b));
        self.keys = keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<ItemId> {
        let mut v: Vec<ItemId> = (0..n).map(|_| ItemId::new()).collect();
        v.sort();
        v
    }

    #[test]
    fn test_negative_positions() {
        let keys = ids(3);
        let mut index = SecondaryIndex::new(IndexKind::Sequence, false);
        for k in &keys {
            index.push(*k);
        }
        assert_eq!(index.get(-1), Some(keys[2]));
        assert_eq!(index.get(-3), Some(keys[0]));
        assert_eq!(index.get(-4), None);
        assert_eq!(index.get(3), None);
        assert_eq!(index.get(index.position(keys[1]).unwrap() as isize), Some(keys[1]));
    }

    #[test]
    fn test_place_first_and_after() {
        let keys = ids(3);
        let mut index = SecondaryIndex::new(IndexKind::Sequence, false);
        for k in &keys {
            index.push(*k);
        }
        assert!(index.place(keys[2], None));
        assert_eq!(index.keys(), &[keys[2], keys[0], keys[1]]);
        assert!(index.place(keys[2], Some(keys[1])));
        assert_eq!(index.keys(), &[keys[0], keys[1], keys[2]]);
        assert!(!index.place(keys[0], Some(keys[0])));
    }

    #[test]
    fn test_sorted_insert_and_descending() {
        let keys = ids(4);
        let by_id = |a: ItemId, b: ItemId| a.cmp(&b);
        let mut index = SecondaryIndex::new(
            IndexKind::Attribute {
                attribute: "title".into(),
            },
            false,
        );
        for k in keys.iter().rev() {
            index.insert_sorted(*k, &by_id);
        }
        assert_eq!(index.keys(), keys.as_slice());

        let mut desc = SecondaryIndex::new(IndexKind::Sequence, true);
        for k in &keys {
            desc.push(*k);
        }
        desc.sort(&by_id);
        let mut reversed = keys.clone();
        reversed.reverse();
        assert_eq!(desc.keys(), reversed.as_slice());
    }

    #[test]
    fn test_entry_values_follow_replace_and_record() {
        let keys = ids(2);
        let mut index = SecondaryIndex::new(IndexKind::Sequence, false);
        index.push(keys[0]);
        index.set_entry_value(keys[0], 7);
        assert!(index.replace(keys[0], keys[1]));
        assert_eq!(index.entry_value(keys[1]), 7);
        assert_eq!(index.entry_value(keys[0]), 0);
        let record = index.to_record();
        assert_eq!(record.entry_values, vec![(keys[1], 7)]);
        assert_eq!(SecondaryIndex::from_record(record), index);
    }
}
