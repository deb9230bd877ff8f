//! Change notifications
//!
//! Views queue one [`Notification`] per item for every local commit and
//! every remote version absorbed by refresh. Handlers run when the view's
//! owner dispatches the queue.

use itemdb_core::{ItemChange, ItemId, ItemStatus, Version};
use std::time::Duration;

/// Dispatch rounds slower than this are logged
pub(crate) const SLOW_DISPATCH: Duration = Duration::from_millis(100);

/// What happened to the item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Created
    Added,
    /// Values, references, name or ACLs changed
    Changed,
    /// Deleted
    Deleted,
}

/// Where the change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This view committed it
    Local,
    /// Another view committed it; seen by refresh
    Remote,
}

/// One item change at one version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Changed item
    pub item: ItemId,
    /// Kind of the item
    pub kind: Option<String>,
    /// Added, changed or deleted
    pub change: ChangeKind,
    /// Local commit or remote refresh
    pub origin: Origin,
    /// Version the change was committed at
    pub version: Version,
    /// Changed attribute names, values then references
    pub attributes: Vec<String>,
}

impl Notification {
    /// Notification for one commit-log entry
    pub fn from_change(change: &ItemChange, origin: Origin, version: Version) -> Self {
        let kind = if change.status.contains(ItemStatus::DELETED) {
            ChangeKind::Deleted
        } else if change.status.contains(ItemStatus::NEW) {
            ChangeKind::Added
        } else {
            ChangeKind::Changed
        };
        let mut attributes = change.values.clone();
        attributes.extend(change.refs.iter().cloned());
        Self {
            item: change.item,
            kind: change.kind.clone(),
            change: kind,
            origin,
            version,
            attributes,
        }
    }
}
