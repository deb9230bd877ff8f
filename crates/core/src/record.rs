//! Persisted record layout
//!
//! One record family per logical container:
//!
//! | Container | Key | Record |
//! |-----------|-----|--------|
//! | items | item | [`ItemRecord`] |
//! | values | item, attribute | [`Value`] or removed |
//! | refs | item, attribute | [`RefRecord`] or removed |
//! | links | owner, attribute, member | [`LinkRecord`] or removed |
//! | indexes | owner, attribute, index | [`IndexRecord`] or removed |
//! | names | parent, name | item or removed |
//! | acls | item, acl name | [`Acl`] or removed |
//! | commits | version | [`CommitRecord`] |
//!
//! A [`CommitBatch`] carries every record written by one version. It is
//! the unit of the write-ahead log and of atomic application.

use crate::types::{ItemId, Version};
use crate::value::Value;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    /// Item status bits, persisted and carried in commit records
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ItemStatus: u32 {
        /// Item was deleted
        const DELETED = 0x0001;
        /// First version of the item
        const NEW = 0x0002;
        /// Literal values changed
        const VDIRTY = 0x0004;
        /// References changed
        const RDIRTY = 0x0008;
        /// Name or parent changed
        const NDIRTY = 0x0010;
        /// ACLs changed
        const ADIRTY = 0x0020;
    }
}

impl ItemStatus {
    /// Any of the dirty bits
    pub const DIRTY: ItemStatus = ItemStatus::VDIRTY
        .union(ItemStatus::RDIRTY)
        .union(ItemStatus::NDIRTY)
        .union(ItemStatus::ADIRTY);
}

/// Item header
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Kind name
    pub kind: Option<String>,
    /// Name under the parent
    pub name: Option<String>,
    /// Parent item
    pub parent: Option<ItemId>,
    /// Status bits (DELETED on tombstones)
    pub status: ItemStatus,
    /// Literal attributes present at this version
    pub values: Vec<String>,
    /// Reference attributes present at this version
    pub refs: Vec<String>,
    /// ACL names present at this version
    pub acls: Vec<String>,
}

impl ItemRecord {
    /// True for deletion tombstones
    pub fn is_deleted(&self) -> bool {
        self.status.contains(ItemStatus::DELETED)
    }
}

/// Reference attribute record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefRecord {
    /// Explicitly empty single reference
    None,
    /// Single peer
    Single(ItemId),
    /// Ordered collection header; entries live in the links container
    Collection(CollectionHeader),
}

/// Ordered collection header
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionHeader {
    /// First member in base order
    pub first: Option<ItemId>,
    /// Last member in base order
    pub last: Option<ItemId>,
    /// Member count
    pub count: usize,
    /// Every alias in the collection
    pub aliases: Vec<(String, ItemId)>,
    /// Attached indexes and their orderings
    pub indexes: Vec<(String, IndexKind)>,
}

/// One collection entry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkRecord {
    /// Previous member in base order
    pub prev: Option<ItemId>,
    /// Next member in base order
    pub next: Option<ItemId>,
    /// Alias, unique in the collection
    pub alias: Option<String>,
}

/// How a secondary index orders its keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Explicit position order
    Sequence,
    /// Ordered by an attribute of each member
    Attribute {
        /// Watched attribute
        attribute: String,
    },
    /// Ordered by a registered comparison method
    Comparator {
        /// Comparator name
        method: String,
    },
}

/// Persisted secondary index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// Ordering
    pub kind: IndexKind,
    /// Reverse order
    pub descending: bool,
    /// Keys in index order
    pub keys: Vec<ItemId>,
    /// Non-zero entry payloads
    pub entry_values: Vec<(ItemId, i64)>,
}

bitflags! {
    /// ACL permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Permissions: u32 {
        /// Read values and references
        const READ = 0x1;
        /// Change values and references
        const WRITE = 0x2;
        /// Delete the item
        const REMOVE = 0x4;
        /// Change the ACL itself
        const CHANGE_ACL = 0x8;
    }
}

/// One ACL entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ace {
    /// Principal item
    pub principal: ItemId,
    /// Permission bits
    pub permissions: Permissions,
    /// Deny instead of grant
    pub deny: bool,
}

/// Ordered list of ACL entries; first match wins
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    /// Entries in evaluation order
    pub entries: Vec<Ace>,
}

impl Acl {
    /// Empty ACL
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a grant
    pub fn grant(mut self, principal: ItemId, permissions: Permissions) -> Self {
        self.entries.push(Ace {
            principal,
            permissions,
            deny: false,
        });
        self
    }

    /// Append a denial
    pub fn deny(mut self, principal: ItemId, permissions: Permissions) -> Self {
        self.entries.push(Ace {
            principal,
            permissions,
            deny: true,
        });
        self
    }

    /// True when every requested bit is granted before being denied
    pub fn verify(&self, principal: ItemId, wanted: Permissions) -> bool {
        let mut granted = Permissions::empty();
        for ace in self.entries.iter().filter(|a| a.principal == principal) {
            let relevant = ace.permissions & wanted & !granted;
            if ace.deny {
                if !relevant.is_empty() {
                    return false;
                }
            } else {
                granted |= relevant;
            }
            if granted.contains(wanted) {
                return true;
            }
        }
        false
    }
}

/// Per-item summary in the commit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemChange {
    /// Changed item
    pub item: ItemId,
    /// Kind at commit time
    pub kind: Option<String>,
    /// NEW / DELETED and dirty bits
    pub status: ItemStatus,
    /// Literal attributes written
    pub values: Vec<String>,
    /// Reference attributes written
    pub refs: Vec<String>,
}

/// Commit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Version this commit created
    pub version: Version,
    /// Name of the committing view
    pub view: String,
    /// Wall clock at commit
    pub timestamp: DateTime<Utc>,
    /// Changed items in commit order
    pub items: Vec<ItemChange>,
}

/// Every record written by one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitBatch {
    /// Commit log entry; its version is the batch version
    pub record: CommitRecord,
    /// Item headers
    pub items: Vec<(ItemId, ItemRecord)>,
    /// Literal values (None removes)
    pub values: Vec<(ItemId, String, Option<Value>)>,
    /// Reference records (None removes)
    pub refs: Vec<(ItemId, String, Option<RefRecord>)>,
    /// Collection entries (None removes)
    pub links: Vec<(ItemId, String, ItemId, Option<LinkRecord>)>,
    /// Secondary indexes (None removes)
    pub indexes: Vec<(ItemId, String, String, Option<IndexRecord>)>,
    /// Name registrations (None removes)
    pub names: Vec<(Option<ItemId>, String, Option<ItemId>)>,
    /// ACLs (None removes)
    pub acls: Vec<(ItemId, String, Option<Acl>)>,
}

impl CommitBatch {
    /// Empty batch for `version`
    pub fn new(version: Version, view: impl Into<String>) -> Self {
        Self {
            record: CommitRecord {
                version,
                view: view.into(),
                timestamp: Utc::now(),
                items: Vec::new(),
            },
            items: Vec::new(),
            values: Vec::new(),
            refs: Vec::new(),
            links: Vec::new(),
            indexes: Vec::new(),
            names: Vec::new(),
            acls: Vec::new(),
        }
    }

    /// Batch version
    pub fn version(&self) -> Version {
        self.record.version
    }

    /// Number of records carried
    pub fn record_count(&self) -> usize {
        self.items.len()
            + self.values.len()
            + self.refs.len()
            + self.links.len()
            + self.indexes.len()
            + self.names.len()
            + self.acls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acl_first_match_wins() {
        let alice = ItemId::new();
        let acl = Acl::new()
            .deny(alice, Permissions::WRITE)
            .grant(alice, Permissions::READ | Permissions::WRITE);
        assert!(acl.verify(alice, Permissions::READ));
        assert!(!acl.verify(alice, Permissions::WRITE));
    }

    #[test]
    fn test_acl_unknown_principal() {
        let acl = Acl::new().grant(ItemId::new(), Permissions::READ);
        assert!(!acl.verify(ItemId::new(), Permissions::READ));
    }

    #[test]
    fn test_acl_grants_accumulate() {
        let bob = ItemId::new();
        let acl = Acl::new()
            .grant(bob, Permissions::READ)
            .grant(bob, Permissions::WRITE);
        assert!(acl.verify(bob, Permissions::READ | Permissions::WRITE));
    }

    #[test]
    fn test_batch_record_count() {
        let mut batch = CommitBatch::new(3, "main");
        let id = ItemId::new();
        batch.items.push((id, ItemRecord::default()));
        batch.values.push((id, "title".into(), Some(Value::from("x"))));
        assert_eq!(batch.version(), 3);
        assert_eq!(batch.record_count(), 2);
    }

    #[test]
    fn test_batch_encodes_with_msgpack() {
        let mut batch = CommitBatch::new(1, "main");
        let id = ItemId::new();
        batch.refs.push((id, "owner".into(), Some(RefRecord::Single(ItemId::new()))));
        let bytes = rmp_serde::to_vec(&batch).unwrap();
        let back: CommitBatch = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, batch);
    }

    #[test]
    fn test_status_dirty_mask() {
        assert!(ItemStatus::DIRTY.contains(ItemStatus::VDIRTY));
        assert!(!ItemStatus::DIRTY.contains(ItemStatus::DELETED));
    }
}
