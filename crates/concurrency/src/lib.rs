//! Concurrency layer for itemdb
//!
//! Optimistic views reconcile their uncommitted changes against newer
//! committed versions. This crate holds the parts of that protocol that do
//! not depend on how items are cached:
//! - ItemDiff / ChangeSet: what each side changed
//! - plan_merge: where the two sides overlap
//! - dispatch: the single resolution point (Mergeable, then resolver)
//! - RetryConfig: deadlock backoff shared by commit, refresh and workers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod diff;
pub mod merge;
pub mod retry;

pub use diff::{plan_merge, ChangeSet, ConflictSite, ItemDiff, MergePlan};
pub use merge::{
    dispatch, Conflict, Decline, MergeRegistry, MergeResolver, MergeValue, Mergeable,
    PreferIncoming, PreferLocal, Resolution,
};
pub use retry::{retry_on_deadlock, RetryConfig};
