//! Error types for itemdb
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Deadlocks are the only retryable condition. Everything else is fatal to
//! the operation that raised it.

use crate::types::{ItemId, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for itemdb operations
pub type Result<T> = std::result::Result<T, ItemDbError>;

/// Why a merge callback was consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeReason {
    /// Both sides changed the same literal value
    Value,
    /// Both sides changed the same single-valued reference
    Ref,
    /// The item was deleted by another view while dirty here
    Delete,
    /// Both sides renamed the item to different names
    Rename,
    /// Both sides moved the item under different parents
    Move,
    /// Two distinct items claim the same name under one parent
    Name,
    /// The item was changed by another view while deleted here
    Change,
    /// Both sides changed the same reference collection
    Collection,
}

impl fmt::Display for MergeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeReason::Value => "VALUE",
            MergeReason::Ref => "REF",
            MergeReason::Delete => "DELETE",
            MergeReason::Rename => "RENAME",
            MergeReason::Move => "MOVE",
            MergeReason::Name => "NAME",
            MergeReason::Change => "CHANGE",
            MergeReason::Collection => "COLLECTION",
        };
        f.write_str(s)
    }
}

/// Error types for itemdb
#[derive(Debug, Error)]
pub enum ItemDbError {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Storage layer error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Item does not exist at the view's version
    #[error("No such item: {0}")]
    NoSuchItem(ItemId),

    /// No item at the given path
    #[error("No item at path {0}")]
    NoSuchPath(String),

    /// Attribute not declared or not set
    #[error("Item {item} has no attribute '{attribute}'")]
    NoSuchAttribute {
        /// Item consulted
        item: ItemId,
        /// Attribute name
        attribute: String,
    },

    /// Write to an attribute declared read-only
    #[error("Attribute '{attribute}' on {item} is read-only")]
    ReadOnlyAttribute {
        /// Item written
        item: ItemId,
        /// Attribute name
        attribute: String,
    },

    /// Schema declarations are inconsistent
    #[error("Schema error: {0}")]
    Schema(String),

    /// Wrong cardinality for the attribute
    #[error("Cardinality error on '{attribute}': {message}")]
    Cardinality {
        /// Attribute name
        attribute: String,
        /// What went wrong
        message: String,
    },

    /// A link or stub resolves to a missing or deleted peer
    #[error("Dangling reference: {item}.{attribute} -> {target}")]
    DanglingReference {
        /// Item holding the reference
        item: ItemId,
        /// Reference attribute
        attribute: String,
        /// Unresolvable target (id or path)
        target: String,
    },

    /// Item is not a member of the collection
    #[error("{member} is not in {owner}.{attribute}")]
    NotInCollection {
        /// Collection owner
        owner: ItemId,
        /// Collection attribute
        attribute: String,
        /// Missing member
        member: ItemId,
    },

    /// Alias already used by another member
    #[error("Alias '{alias}' already set for {holder}")]
    AliasInUse {
        /// The alias
        alias: String,
        /// Member currently holding it
        holder: ItemId,
    },

    /// Named index is not attached to the collection
    #[error("No index '{index}' on '{attribute}'")]
    NoSuchIndex {
        /// Collection attribute
        attribute: String,
        /// Index name
        index: String,
    },

    /// Index name already used on the collection
    #[error("Index '{index}' already exists on '{attribute}'")]
    IndexAlreadyExists {
        /// Collection attribute
        attribute: String,
        /// Index name
        index: String,
    },

    /// Committed history overtook local changes irreconcilably
    #[error("Version conflict on {item} at version {version}")]
    VersionConflict {
        /// Conflicting item
        item: ItemId,
        /// Version that overtook it
        version: Version,
    },

    /// The merge callback declined, or the merge is unsupported
    #[error("Merge error ({reason}) on {item}.{attribute}: {message}")]
    Merge {
        /// Why the merge was attempted
        reason: MergeReason,
        /// Item being merged
        item: ItemId,
        /// Attribute being merged
        attribute: String,
        /// Details
        message: String,
    },

    /// Item load re-entered for the same id
    #[error("Recursive load of item {0}")]
    RecursiveLoad(ItemId),

    /// Storage write lock could not be acquired; retryable
    #[error("Deadlock detected, transaction aborted")]
    Deadlock,

    /// Repository is exclusively opened elsewhere
    #[error("Open denied: {0}")]
    OpenDenied(String),

    /// On-disk format is not the one this build writes
    #[error("Version mismatch: expected format {expected}, found {found}")]
    VersionMismatch {
        /// Format version this build understands
        expected: u32,
        /// Format version found on disk
        found: u32,
    },

    /// Wrong or missing password
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Unclean shutdown detected; reopen with recovery
    #[error("Recovery required: {0}")]
    RecoveryRequired(String),

    /// History below this version was compacted away
    #[error("History compacted: requested {requested}, oldest available {oldest}")]
    HistoryCompacted {
        /// Requested starting version
        requested: Version,
        /// Oldest version still in history
        oldest: Version,
    },
}

impl ItemDbError {
    /// Build a merge error
    pub fn merge(
        reason: MergeReason,
        item: ItemId,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ItemDbError::Merge {
            reason,
            item,
            attribute: attribute.into(),
            message: message.into(),
        }
    }

    /// True for conditions the commit and refresh loops retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, ItemDbError::Deadlock)
    }

    /// True for merge failures
    pub fn is_merge_error(&self) -> bool {
        matches!(self, ItemDbError::Merge { .. })
    }

    /// Merge reason, if this is a merge failure
    pub fn merge_reason(&self) -> Option<MergeReason> {
        match self {
            ItemDbError::Merge { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<rmp_serde::encode::Error> for ItemDbError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        ItemDbError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ItemDbError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        ItemDbError::Serialization(e.to_string())
    }
}
