//! Durability layer for itemdb
//!
//! This crate handles everything that touches disk:
//!
//! - Commit log: segmented write-ahead log, one CRC-framed record per version
//! - Durability modes: Always, Standard (default), Cache
//! - Checkpoint snapshots written crash-safely
//! - Recovery: newest good snapshot, then log replay
//! - Repository layout, metadata and the unclean-shutdown marker

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod layout;
pub mod mode;
pub mod recovery;
pub mod snapshot;
pub mod wal;

pub use error::DurabilityError;
pub use layout::{copy_tree, RepoLayout, RepoMeta, FORMAT_VERSION, META_FILE_NAME};
pub use mode::DurabilityMode;
pub use recovery::{recover, RecoveryStats};
pub use snapshot::{
    latest_snapshot, list_snapshots, prune_snapshots, read_snapshot, write_snapshot,
    SNAPSHOT_MAGIC,
};
pub use wal::{read_log, WalReplay, WalWriter, SEGMENT_MAGIC};
