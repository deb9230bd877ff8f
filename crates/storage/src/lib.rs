//! Storage layer for itemdb
//!
//! This crate implements the transactional backing store:
//! - Container: one versioned table per record family
//! - VersionChain: MVCC history of a single key
//! - Store: containers, commit log, version counter, reader registry
//! - Transaction: write-locked, nestable staging of one version
//! - TextIndex: inverted term index for full-text search
//! - FaultInjector: commit-path failure injection for tests
//!
//! # Versions
//!
//! Every write lands at the version of its batch. A batch becomes visible
//! when the version counter moves, so a partially applied batch is never
//! observed by any reader.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chain;
pub mod container;
pub mod faults;
pub mod store;
pub mod text;
pub mod txn;

pub use chain::VersionChain;
pub use container::Container;
pub use faults::{FailPoint, FaultInjector};
pub use store::{
    CompactionStats, IndexKey, LinkKey, NameKey, ReaderId, Store, StoreConfig, StoreImage, ValueKey,
};
pub use text::{TextImage, TextIndex};
pub use txn::{Transaction, WriteLock};
