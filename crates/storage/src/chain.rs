//! Per-key version chains
//!
//! Every container key owns a [`VersionChain`]: the values written at each
//! version, newest first. `None` entries are tombstones.

use itemdb_core::Version;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Versions of one key, newest first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionChain<T> {
    versions: VecDeque<(Version, Option<T>)>,
}

impl<T> VersionChain<T> {
    /// Create a new version chain with a single version
    pub fn new(version: Version, value: Option<T>) -> Self {
        let mut versions = VecDeque::with_capacity(4);
        versions.push_front((version, value));
        Self { versions }
    }

    /// Add a version.
    ///
    /// Writing the same version twice replaces the earlier write; this happens
    /// when a nested transaction stages the same key more than once.
    pub fn push(&mut self, version: Version, value: Option<T>) {
        match self.versions.front_mut() {
            Some(front) if front.0 == version => front.1 = value,
            _ => {
                debug_assert!(
                    self.versions.front().map(|f| f.0 < version).unwrap_or(true),
                    "versions must be pushed in increasing order"
                );
                self.versions.push_front((version, value));
            }
        }
    }

    /// Entry at or before `max_version`, tombstones included
    pub fn entry_at(&self, max_version: Version) -> Option<(Version, Option<&T>)> {
        self.versions
            .iter()
            .find(|(v, _)| *v <= max_version)
            .map(|(v, value)| (*v, value.as_ref()))
    }

    /// Live value at or before `max_version`
    pub fn get_at_version(&self, max_version: Version) -> Option<&T> {
        self.entry_at(max_version).and_then(|(_, value)| value)
    }

    /// Newest entry
    pub fn latest(&self) -> Option<(Version, Option<&T>)> {
        self.versions.front().map(|(v, value)| (*v, value.as_ref()))
    }

    /// Drop versions no reader at `min_version` or later can see.
    ///
    /// Keeps the newest entry at or below `min_version` and everything above
    /// it. Returns the number of entries removed.
    pub fn gc(&mut self, min_version: Version) -> usize {
        let Some(keep) = self.versions.iter().position(|(v, _)| *v <= min_version) else {
            return 0;
        };
        let removed = self.versions.len() - keep - 1;
        self.versions.truncate(keep + 1);
        removed
    }

    /// Drop every version above `version`. Returns the number removed.
    pub fn truncate_after(&mut self, version: Version) -> usize {
        let mut removed = 0;
        while matches!(self.versions.front(), Some((v, _)) if *v > version) {
            self.versions.pop_front();
            removed += 1;
        }
        removed
    }

    /// True when the only surviving entry is a tombstone at or below `version`
    pub fn is_dead_at(&self, version: Version) -> bool {
        self.versions.len() == 1
            && matches!(self.versions.front(), Some((v, None)) if *v <= version)
    }

    /// Number of versions stored
    pub fn version_count(&self) -> usize {
        self.versions.len()
    }

    /// Check if the version chain is empty
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Entries oldest first
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = (Version, Option<&T>)> {
        self.versions.iter().rev().map(|(v, value)| (*v, value.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_at_version() {
        let mut chain = VersionChain::new(1, Some("a"));
        chain.push(3, Some("b"));
        chain.push(5, None);
        assert_eq!(chain.get_at_version(0), None);
        assert_eq!(chain.get_at_version(1), Some(&"a"));
        assert_eq!(chain.get_at_version(4), Some(&"b"));
        assert_eq!(chain.get_at_version(5), None);
        assert_eq!(chain.entry_at(9).map(|(v, _)| v), Some(5));
    }

    #[test]
    fn test_push_same_version_replaces() {
        let mut chain = VersionChain::new(2, Some(1));
        chain.push(2, Some(7));
        assert_eq!(chain.version_count(), 1);
        assert_eq!(chain.get_at_version(2), Some(&7));
    }

    #[test]
    fn test_gc_keeps_visible_entry() {
        let mut chain = VersionChain::new(1, Some('a'));
        chain.push(2, Some('b'));
        chain.push(4, Some('c'));
        assert_eq!(chain.gc(3), 1);
        assert_eq!(chain.get_at_version(3), Some(&'b'));
        assert_eq!(chain.get_at_version(4), Some(&'c'));
        assert_eq!(chain.version_count(), 2);
    }

    #[test]
    fn test_gc_below_all_versions() {
        let mut chain = VersionChain::new(5, Some(1));
        assert_eq!(chain.gc(2), 0);
        assert_eq!(chain.version_count(), 1);
    }

    #[test]
    fn test_truncate_after() {
        let mut chain = VersionChain::new(1, Some(1));
        chain.push(2, Some(2));
        chain.push(3, Some(3));
        assert_eq!(chain.truncate_after(1), 2);
        assert_eq!(chain.latest(), Some((1, Some(&1))));
        assert_eq!(chain.truncate_after(0), 1);
        assert!(chain.is_empty());
    }

    #[test]
    fn test_dead_tombstone() {
        let mut chain = VersionChain::new(1, Some(1));
        chain.push(2, None);
        assert!(!chain.is_dead_at(2));
        chain.gc(2);
        assert!(chain.is_dead_at(2));
    }
}
