//! Core types for itemdb
//!
//! This crate defines the foundational types used throughout the system:
//! - ItemId, Version, ItemPath: identity and addressing
//! - Value: literal attribute values
//! - TypeCatalog: hash/compare/encode handlers per value type
//! - Kind, AttributeDef, Schema: attribute declarations and reverse names
//! - Records: persisted layout shared by storage, durability and engine
//! - ItemDbError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod error;
pub mod record;
pub mod schema;
pub mod types;
pub mod value;

pub use catalog::{canonical, compare_values, TypeCatalog, ValueType, ANY_TYPE};
pub use error::{ItemDbError, MergeReason, Result};
pub use record::{
    Ace, Acl, CollectionHeader, CommitBatch, CommitRecord, IndexKind, IndexRecord, ItemChange,
    ItemRecord, ItemStatus, LinkRecord, Permissions, RefRecord,
};
pub use schema::{AttributeDef, Cardinality, Kind, RefSpec, Schema};
pub use types::{ItemId, ItemPath, Version};
pub use value::Value;
