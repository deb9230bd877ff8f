//! itemdb - embedded versioned item store
//!
//! Items carry typed values and bi-directional references. Every thread
//! works in its own [`View`]: a snapshot at a committed version that is
//! refreshed (merging concurrent changes) and committed as a whole.
//!
//! # Quick Start
//!
//! ```ignore
//! use itemdb::{Decline, Repository, Schema};
//!
//! let repo = Repository::builder().schema(schema).in_memory()?;
//! let mut view = repo.view("main")?;
//! let note = view.create(Some("Note"))?;
//! view.set_value(note, "title", "hello")?;
//! view.commit(&mut Decline)?;
//! ```
//!
//! # Architecture
//!
//! - `itemdb-core`: ids, values, schema, records and errors
//! - `itemdb-storage`: versioned containers and write transactions
//! - `itemdb-concurrency`: merge planning, resolvers and deadlock retry
//! - `itemdb-durability`: commit log, snapshots and recovery
//! - `itemdb-engine`: items, views, repository lifecycle and workers

pub use itemdb_concurrency::{
    Conflict, Decline, MergeResolver, MergeValue, Mergeable, PreferIncoming, PreferLocal,
    Resolution, RetryConfig,
};
pub use itemdb_core::*;
pub use itemdb_engine::*;
