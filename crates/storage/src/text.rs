//! Full-text index container
//!
//! Inverted index from term to `(item, attribute)` documents. Documents
//! carry the version they were indexed at so a search can be answered at
//! any view's version. Tokenization happens upstream; this container only
//! stores terms.

use itemdb_core::{ItemId, Version};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

type DocKey = (ItemId, String);

#[derive(Debug, Default)]
struct Inner {
    postings: FxHashMap<String, FxHashSet<DocKey>>,
    docs: FxHashMap<DocKey, (Version, Vec<String>)>,
}

impl Inner {
    fn remove_doc(&mut self, key: &DocKey) {
        if let Some((_, terms)) = self.docs.remove(key) {
            for term in terms {
                if let Some(set) = self.postings.get_mut(&term) {
                    set.remove(key);
                    if set.is_empty() {
                        self.postings.remove(&term);
                    }
                }
            }
        }
    }
}

/// Serializable form of the index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextImage {
    /// Highest version fully indexed
    pub indexed_version: Version,
    /// Every document with its version and terms
    pub docs: Vec<(ItemId, String, Version, Vec<String>)>,
}

/// Inverted term index
#[derive(Debug, Default)]
pub struct TextIndex {
    inner: RwLock<Inner>,
    indexed_version: AtomicU64,
}

impl TextIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the document for `(item, attribute)`
    pub fn index_document(&self, item: ItemId, attribute: &str, terms: Vec<String>, version: Version) {
        let key = (item, attribute.to_string());
        let mut inner = self.inner.write();
        inner.remove_doc(&key);
        if terms.is_empty() {
            return;
        }
        let mut unique = terms;
        unique.sort_unstable();
        unique.dedup();
        for term in &unique {
            inner.postings.entry(term.clone()).or_default().insert(key.clone());
        }
        inner.docs.insert(key, (version, unique));
    }

    /// Drop one document
    pub fn remove_document(&self, item: ItemId, attribute: &str) {
        self.inner.write().remove_doc(&(item, attribute.to_string()));
    }

    /// Drop every document of `item`
    pub fn remove_item(&self, item: ItemId) {
        let mut inner = self.inner.write();
        let keys: Vec<DocKey> = inner.docs.keys().filter(|(i, _)| *i == item).cloned().collect();
        for key in keys {
            inner.remove_doc(&key);
        }
    }

    /// Documents containing every term, indexed at or before `version`.
    /// Results are sorted for determinism.
    pub fn search(&self, terms: &[String], version: Version) -> Vec<(ItemId, String)> {
        if terms.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read();
        let mut sets: Vec<&FxHashSet<DocKey>> = Vec::with_capacity(terms.len());
        for term in terms {
            match inner.postings.get(term) {
                Some(set) => sets.push(set),
                None => return Vec::new(),
            }
        }
        sets.sort_by_key(|s| s.len());
        let (first, rest) = sets.split_at(1);
        let mut hits: Vec<(ItemId, String)> = first[0]
            .iter()
            .filter(|key| rest.iter().all(|s| s.contains(*key)))
            .filter(|key| inner.docs.get(*key).map(|(v, _)| *v <= version).unwrap_or(false))
            .cloned()
            .collect();
        hits.sort();
        hits
    }

    /// Highest version fully indexed
    pub fn indexed_version(&self) -> Version {
        self.indexed_version.load(Ordering::Acquire)
    }

    /// Record progress
    pub fn set_indexed_version(&self, version: Version) {
        self.indexed_version.store(version, Ordering::Release);
    }

    /// Drop documents indexed above `version`
    pub fn truncate_after(&self, version: Version) {
        let mut inner = self.inner.write();
        let keys: Vec<DocKey> = inner
            .docs
            .iter()
            .filter(|(_, (v, _))| *v > version)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            inner.remove_doc(&key);
        }
        if self.indexed_version() > version {
            self.set_indexed_version(version);
        }
    }

    /// Number of documents
    pub fn document_count(&self) -> usize {
        self.inner.read().docs.len()
    }

    /// Snapshot form
    pub fn export(&self) -> TextImage {
        let inner = self.inner.read();
        let mut docs: Vec<(ItemId, String, Version, Vec<String>)> = inner
            .docs
            .iter()
            .map(|((item, attr), (v, terms))| (*item, attr.clone(), *v, terms.clone()))
            .collect();
        docs.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        TextImage {
            indexed_version: self.indexed_version(),
            docs,
        }
    }

    /// Rebuild from snapshot form
    pub fn import(&self, image: TextImage) {
        {
            let mut inner = self.inner.write();
            *inner = Inner::default();
        }
        for (item, attr, version, terms) in image.docs {
            self.index_document(item, &attr, terms, version);
        }
        self.set_indexed_version(image.indexed_version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_search_requires_all_terms() {
        let index = TextIndex::new();
        let a = ItemId::new();
        let b = ItemId::new();
        index.index_document(a, "body", terms(&["quick", "fox"]), 1);
        index.index_document(b, "body", terms(&["quick", "dog"]), 1);
        assert_eq!(index.search(&terms(&["quick"]), 1).len(), 2);
        assert_eq!(index.search(&terms(&["quick", "fox"]), 1), vec![(a, "body".to_string())]);
        assert!(index.search(&terms(&["cat"]), 1).is_empty());
    }

    #[test]
    fn test_search_respects_version() {
        let index = TextIndex::new();
        let a = ItemId::new();
        index.index_document(a, "body", terms(&["late"]), 5);
        assert!(index.search(&terms(&["late"]), 4).is_empty());
        assert_eq!(index.search(&terms(&["late"]), 5).len(), 1);
    }

    #[test]
    fn test_reindex_replaces_terms() {
        let index = TextIndex::new();
        let a = ItemId::new();
        index.index_document(a, "body", terms(&["old"]), 1);
        index.index_document(a, "body", terms(&["new"]), 2);
        assert!(index.search(&terms(&["old"]), 2).is_empty());
        assert_eq!(index.search(&terms(&["new"]), 2).len(), 1);
    }

    #[test]
    fn test_remove_item() {
        let index = TextIndex::new();
        let a = ItemId::new();
        index.index_document(a, "title", terms(&["x"]), 1);
        index.index_document(a, "body", terms(&["x"]), 1);
        index.remove_item(a);
        assert_eq!(index.document_count(), 0);
    }

    #[test]
    fn test_export_import() {
        let index = TextIndex::new();
        let a = ItemId::new();
        index.index_document(a, "body", terms(&["kept"]), 3);
        index.set_indexed_version(3);
        let copy = TextIndex::new();
        copy.import(index.export());
        assert_eq!(copy.indexed_version(), 3);
        assert_eq!(copy.search(&terms(&["kept"]), 3).len(), 1);
    }

    #[test]
    fn test_truncate_after() {
        let index = TextIndex::new();
        let a = ItemId::new();
        index.index_document(a, "body", terms(&["v4"]), 4);
        index.set_indexed_version(4);
        index.truncate_after(2);
        assert_eq!(index.document_count(), 0);
        assert_eq!(index.indexed_version(), 2);
    }
}
