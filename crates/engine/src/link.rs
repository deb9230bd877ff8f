//! Single-valued bi-directional references
//!
//! A [`Link`] is one reference as seen from the item holding it. Its peer
//! is either resolved or a stub: a deferred target named by path or id
//! that the view resolves on first access, attaching the reverse side at
//! that moment.

use itemdb_core::{ItemDbError, ItemId, ItemPath, Result};
use std::fmt;

/// What a stub points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubTarget {
    /// Item id not necessarily loaded or even committed yet
    Id(ItemId),
    /// Absolute name path
    Path(ItemPath),
}

impl fmt::Display for StubTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StubTarget::Id(id) => write!(f, "{}", id),
            StubTarget::Path(path) => write!(f, "{}", path),
        }
    }
}

/// One end of a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Attached peer
    Resolved(ItemId),
    /// Not yet attached
    Deferred(StubTarget),
}

impl Endpoint {
    /// Peer id when resolved
    pub fn resolved(&self) -> Option<ItemId> {
        match self {
            Endpoint::Resolved(id) => Some(*id),
            Endpoint::Deferred(_) => None,
        }
    }

    /// True for stubs
    pub fn is_deferred(&self) -> bool {
        matches!(self, Endpoint::Deferred(_))
    }
}

/// A single reference held by `owner` under `attribute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    owner: ItemId,
    attribute: String,
    peer: Endpoint,
}

impl Link {
    /// Link from `owner.attribute` to `peer`
    pub fn new(owner: ItemId, attribute: &str, peer: Endpoint) -> Self {
        Self {
            owner,
            attribute: attribute.to_string(),
            peer,
        }
    }

    /// Item holding the link
    pub fn owner(&self) -> ItemId {
        self.owner
    }

    /// Attribute holding the link
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Peer end
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// The endpoint that is not `item`.
    ///
    /// Fails when `item` is neither end.
    pub fn other(&self, item: ItemId) -> Result<Endpoint> {
        if item == self.owner {
            return Ok(self.peer.clone());
        }
        if self.peer == Endpoint::Resolved(item) {
            return Ok(Endpoint::Resolved(self.owner));
        }
        Err(ItemDbError::InvalidOperation(format!(
            "{} is not an endpoint of {}.{}",
            item, self.owner, self.attribute
        )))
    }

    /// Replace the peer end in place
    pub(crate) fn reattach(&mut self, peer: Endpoint) {
        self.peer = peer;
    }
}
