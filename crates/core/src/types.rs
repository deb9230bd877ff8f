//! Identity types for itemdb
//!
//! This module defines:
//! - ItemId: stable UUID identity of an item
//! - Version: store-assigned commit counter
//! - ItemPath: `//root/child` style name path

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Store-assigned commit version.
///
/// Strictly increasing, never reused. Version 0 is the empty store.
pub type Version = u64;

/// Stable unique identifier of an item
///
/// The same identifier may be materialized independently in several views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    /// Create a new random ItemId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create an ItemId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse an ItemId from its string form
    ///
    /// Returns None if the string is not a valid UUID.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this ItemId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ItemId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Absolute name path of an item, e.g. `//projects/alpha/notes`.
///
/// The first segment names a root; each following segment names a child
/// of the previous item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemPath {
    segments: Vec<String>,
}

impl ItemPath {
    /// Build a path from its segments
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse `//a/b/c`. Returns None for relative or empty paths.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("//")?;
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return None;
        }
        Some(Self { segments })
    }

    /// Path segments, root first
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Path of a child of this path
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(name.into());
        Self { segments }
    }

    /// Last segment
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

impl fmt::Display for ItemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "//{}", self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_unique() {
        assert_ne!(ItemId::new(), ItemId::new());
    }

    #[test]
    fn test_item_id_string_round_trip() {
        let id = ItemId::new();
        assert_eq!(ItemId::parse(&id.to_string()), Some(id));
        assert_eq!(ItemId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_path_parse() {
        let path = ItemPath::parse("//projects/alpha").unwrap();
        assert_eq!(path.segments(), &["projects".to_string(), "alpha".to_string()]);
        assert_eq!(path.name(), Some("alpha"));
        assert_eq!(path.to_string(), "//projects/alpha");
    }

    #[test]
    fn test_path_rejects_relative() {
        assert!(ItemPath::parse("projects/alpha").is_none());
        assert!(ItemPath::parse("//").is_none());
        assert!(ItemPath::parse("//a//b").is_none());
    }

    #[test]
    fn test_path_child() {
        let path = ItemPath::new(["a"]).child("b");
        assert_eq!(path.to_string(), "//a/b");
    }
}
