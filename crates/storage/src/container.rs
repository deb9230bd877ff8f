//! Versioned key/value container
//!
//! A [`Container`] is one logical table of the store: an ordered map from
//! key to [`VersionChain`]. Reads name the version they read at; writes land
//! at the version of the batch that carries them.

use crate::chain::VersionChain;
use itemdb_core::Version;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// One logical table
#[derive(Debug)]
pub struct Container<K, V> {
    name: &'static str,
    data: RwLock<BTreeMap<K, VersionChain<V>>>,
}

impl<K: Ord + Clone, V: Clone> Container<K, V> {
    /// Empty container
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Container name, used in logs and snapshots
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Live value of `key` at `version`
    pub fn get(&self, key: &K, version: Version) -> Option<V> {
        self.data
            .read()
            .get(key)
            .and_then(|chain| chain.get_at_version(version).cloned())
    }

    /// Entry of `key` at `version` with the version it was written at.
    /// The inner `None` is a tombstone.
    pub fn entry(&self, key: &K, version: Version) -> Option<(Version, Option<V>)> {
        self.data
            .read()
            .get(key)
            .and_then(|chain| chain.entry_at(version))
            .map(|(v, value)| (v, value.cloned()))
    }

    /// Write every entry at `version` under one lock acquisition
    pub fn write_all<I>(&self, version: Version, entries: I)
    where
        I: IntoIterator<Item = (K, Option<V>)>,
    {
        let mut data = self.data.write();
        for (key, value) in entries {
            match data.get_mut(&key) {
                Some(chain) => chain.push(version, value),
                None => {
                    data.insert(key, VersionChain::new(version, value));
                }
            }
        }
    }

    /// Live entries from `start` onward while `within` holds
    pub fn scan_from<F>(&self, start: &K, version: Version, within: F) -> Vec<(K, V)>
    where
        F: Fn(&K) -> bool,
    {
        let data = self.data.read();
        data.range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(k, _)| within(k))
            .filter_map(|(k, chain)| chain.get_at_version(version).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Live entries at `version` matching `pred`
    pub fn filter<F>(&self, version: Version, pred: F) -> Vec<(K, V)>
    where
        F: Fn(&K, &V) -> bool,
    {
        let data = self.data.read();
        data.iter()
            .filter_map(|(k, chain)| chain.get_at_version(version).map(|v| (k, v)))
            .filter(|(k, v)| pred(k, v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Garbage-collect versions invisible at or after `min_version`
    pub fn gc(&self, min_version: Version) -> usize {
        let mut data = self.data.write();
        let mut removed = 0;
        data.retain(|_, chain| {
            removed += chain.gc(min_version);
            if chain.is_dead_at(min_version) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Drop everything written above `version`
    pub fn truncate_after(&self, version: Version) -> usize {
        let mut data = self.data.write();
        let mut removed = 0;
        data.retain(|_, chain| {
            removed += chain.truncate_after(version);
            !chain.is_empty()
        });
        removed
    }

    /// Number of keys with any version
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True when no key has any version
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Full contents, for snapshots
    pub fn export(&self) -> Vec<(K, VersionChain<V>)> {
        self.data
            .read()
            .iter()
            .map(|(k, chain)| (k.clone(), chain.clone()))
            .collect()
    }

    /// Replace contents from a snapshot
    pub fn import(&self, entries: Vec<(K, VersionChain<V>)>) {
        let mut data = self.data.write();
        data.clear();
        data.extend(entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioned_reads() {
        let c: Container<u32, &str> = Container::new("t");
        c.write_all(1, [(1, Some("a")), (2, Some("b"))]);
        c.write_all(2, [(1, Some("a2")), (2, None)]);
        assert_eq!(c.get(&1, 1), Some("a"));
        assert_eq!(c.get(&1, 2), Some("a2"));
        assert_eq!(c.get(&2, 1), Some("b"));
        assert_eq!(c.get(&2, 2), None);
        assert_eq!(c.entry(&2, 5), Some((2, None)));
        assert_eq!(c.get(&3, 9), None);
    }

    #[test]
    fn test_scan_from() {
        let c: Container<(u8, u8), i32> = Container::new("t");
        c.write_all(1, [((1, 1), Some(11)), ((1, 2), Some(12)), ((2, 1), Some(21))]);
        let got = c.scan_from(&(1, 0), 1, |k| k.0 == 1);
        assert_eq!(got, vec![((1, 1), 11), ((1, 2), 12)]);
    }

    #[test]
    fn test_gc_removes_dead_keys() {
        let c: Container<u8, i32> = Container::new("t");
        c.write_all(1, [(1, Some(1)), (2, Some(2))]);
        c.write_all(2, [(2, None)]);
        c.write_all(3, [(1, Some(3))]);
        let removed = c.gc(3);
        assert_eq!(removed, 3);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get(&1, 3), Some(3));
    }

    #[test]
    fn test_truncate_after() {
        let c: Container<u8, i32> = Container::new("t");
        c.write_all(1, [(1, Some(1))]);
        c.write_all(2, [(1, Some(2)), (2, Some(2))]);
        assert_eq!(c.truncate_after(1), 2);
        assert_eq!(c.get(&1, 9), Some(1));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_export_import() {
        let c: Container<u8, i32> = Container::new("t");
        c.write_all(1, [(1, Some(1))]);
        let other: Container<u8, i32> = Container::new("t");
        other.import(c.export());
        assert_eq!(other.get(&1, 1), Some(1));
    }
}
