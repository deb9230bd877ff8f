//! Repository engine for itemdb
//!
//! This crate ties the lower layers together:
//! - Items: values, references, links and ordered collections
//! - Views: per-thread snapshots with refresh, merge and commit
//! - Repository lifecycle: open/create/close, recovery, backup/restore
//! - Background workers: periodic checkpoints and full-text indexing
//!
//! The engine is the only component that knows about:
//! - Reference symmetry (both ends of a link change together)
//! - Merging a view's changes with concurrently committed history
//! - Cross-layer coordination (store + commit log + snapshots)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collection;
pub mod config;
pub mod item;
pub mod link;
pub mod notify;
pub mod refs;
pub mod repository;
pub mod text;
pub mod values;
pub mod view;
pub mod workers;

mod shared;

pub use collection::{Placement, RefCollection};
pub use config::{ConfigError, RepositoryConfig, CONFIG_FILE_NAME};
pub use item::{Item, ItemFlags};
pub use link::{Endpoint, Link, StubTarget};
pub use notify::{ChangeKind, Notification, Origin};
pub use refs::RefValue;
pub use repository::{Repository, RepositoryBuilder};
pub use shared::Comparator;
pub use view::{CheckReport, Collection, View, ViewState};
pub use workers::{CheckpointWorker, Indexer};
