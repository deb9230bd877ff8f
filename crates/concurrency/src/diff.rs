//! Change classification for refresh
//!
//! Both sides of a refresh are summarized as [`ItemDiff`]s: the local view's
//! dirty state, and the union of every committed change between the view's
//! version and the target. [`plan_merge`] compares the two and reports every
//! place they overlap as a [`ConflictSite`].
//!
//! Collection attributes are compared member by member. Disjoint member
//! changes on both sides are a splice the caller can rebase; touching the
//! same member on both sides is a collection conflict, and so is any
//! committed change to a collection whose indexes were edited locally.

use itemdb_core::{CommitRecord, ItemChange, ItemId, ItemStatus, MergeReason};
use std::collections::{BTreeMap, BTreeSet};

/// What one side changed on one item
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemDiff {
    /// Kind at the time of the change
    pub kind: Option<String>,
    /// Created on this side
    pub created: bool,
    /// Deleted on this side
    pub deleted: bool,
    /// Literal attributes written
    pub values: BTreeSet<String>,
    /// Reference attributes written
    pub refs: BTreeSet<String>,
    /// Collection members touched, per collection attribute
    pub members: BTreeMap<String, BTreeSet<ItemId>>,
    /// Collection attributes whose indexes were removed or edited by hand
    pub index_edits: BTreeSet<String>,
    /// New name, when renamed
    pub renamed: Option<String>,
    /// New parent, when moved
    pub moved: Option<Option<ItemId>>,
    /// ACLs written
    pub acls: bool,
}

impl ItemDiff {
    /// Summary of one commit-log entry.
    ///
    /// Names, parents and collection members are not in the log; the caller
    /// fills those from the store.
    pub fn from_change(change: &ItemChange) -> Self {
        Self {
            kind: change.kind.clone(),
            created: change.status.contains(ItemStatus::NEW),
            deleted: change.status.contains(ItemStatus::DELETED),
            values: change.values.iter().cloned().collect(),
            refs: change.refs.iter().cloned().collect(),
            acls: change.status.contains(ItemStatus::ADIRTY),
            ..Default::default()
        }
    }

    /// True when nothing changed
    pub fn is_empty(&self) -> bool {
        !self.created
            && !self.deleted
            && self.values.is_empty()
            && self.refs.is_empty()
            && self.renamed.is_none()
            && self.moved.is_none()
            && !self.acls
    }

    /// Fold a later change on the same side into this one
    pub fn absorb(&mut self, later: ItemDiff) {
        if later.kind.is_some() {
            self.kind = later.kind;
        }
        self.created |= later.created;
        self.deleted |= later.deleted;
        self.values.extend(later.values);
        self.refs.extend(later.refs);
        for (name, keys) in later.members {
            self.members.entry(name).or_default().extend(keys);
        }
        self.index_edits.extend(later.index_edits);
        if later.renamed.is_some() {
            self.renamed = later.renamed;
        }
        if later.moved.is_some() {
            self.moved = later.moved;
        }
        self.acls |= later.acls;
    }

    /// Status bits describing this diff
    pub fn status(&self) -> ItemStatus {
        let mut status = ItemStatus::empty();
        status.set(ItemStatus::NEW, self.created);
        status.set(ItemStatus::DELETED, self.deleted);
        status.set(ItemStatus::VDIRTY, !self.values.is_empty());
        status.set(ItemStatus::RDIRTY, !self.refs.is_empty());
        status.set(
            ItemStatus::NDIRTY,
            self.renamed.is_some() || self.moved.is_some(),
        );
        status.set(ItemStatus::ADIRTY, self.acls);
        status
    }
}

/// Every committed change in a version range, per item
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    items: BTreeMap<ItemId, ItemDiff>,
    versions: Vec<u64>,
}

impl ChangeSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one commit into the set
    pub fn absorb_record(&mut self, record: &CommitRecord) {
        for change in &record.items {
            self.absorb(change.item, ItemDiff::from_change(change));
        }
        self.versions.push(record.version);
    }

    /// Fold one item's change into the set
    pub fn absorb(&mut self, item: ItemId, diff: ItemDiff) {
        match self.items.get_mut(&item) {
            Some(existing) => existing.absorb(diff),
            None => {
                self.items.insert(item, diff);
            }
        }
    }

    /// Change for `item`
    pub fn get(&self, item: &ItemId) -> Option<&ItemDiff> {
        self.items.get(item)
    }

    /// Mutable change for `item`
    pub fn get_mut(&mut self, item: &ItemId) -> Option<&mut ItemDiff> {
        self.items.get_mut(item)
    }

    /// Items and their changes in id order
    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, &ItemDiff)> {
        self.items.iter()
    }

    /// Versions absorbed, in order
    pub fn versions(&self) -> &[u64] {
        &self.versions
    }

    /// Number of changed items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no item changed
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One place where local and committed changes overlap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictSite {
    /// Reason reported to the resolver
    pub reason: MergeReason,
    /// Attribute or property label
    pub attribute: String,
}

impl ConflictSite {
    fn new(reason: MergeReason, attribute: impl Into<String>) -> Self {
        Self {
            reason,
            attribute: attribute.into(),
        }
    }
}

/// Outcome of comparing one item's two sides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    /// Overlaps needing a resolution
    pub conflicts: Vec<ConflictSite>,
    /// Collection attributes both sides changed on disjoint members
    pub splices: Vec<String>,
}

impl MergePlan {
    /// True when the committed side can simply be adopted under the local dirt
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.splices.is_empty()
    }

    /// Combine another plan into this one
    pub fn merge(&mut self, other: MergePlan) {
        self.conflicts.extend(other.conflicts);
        self.splices.extend(other.splices);
    }
}

/// Compare a locally dirty item against its committed changes.
///
/// `is_collection` tells whether a reference attribute holds a collection.
pub fn plan_merge<F>(local: &ItemDiff, remote: &ItemDiff, is_collection: F) -> MergePlan
where
    F: Fn(&str) -> bool,
{
    let mut plan = MergePlan::default();

    if remote.deleted {
        if !local.deleted && !local.is_empty() {
            plan.conflicts.push(ConflictSite::new(MergeReason::Delete, "item"));
        }
        return plan;
    }
    if local.deleted {
        if !remote.is_empty() {
            plan.conflicts.push(ConflictSite::new(MergeReason::Change, "item"));
        }
        return plan;
    }

    for name in local.values.intersection(&remote.values) {
        plan.conflicts.push(ConflictSite::new(MergeReason::Value, name.clone()));
    }

    for name in local.refs.intersection(&remote.refs) {
        if !is_collection(name) {
            plan.conflicts.push(ConflictSite::new(MergeReason::Ref, name.clone()));
            continue;
        }
        let empty = BTreeSet::new();
        let mine = local.members.get(name).unwrap_or(&empty);
        let theirs = remote.members.get(name).unwrap_or(&empty);
        let edited = local.index_edits.contains(name) || remote.index_edits.contains(name);
        if edited || mine.intersection(theirs).next().is_some() {
            plan.conflicts
                .push(ConflictSite::new(MergeReason::Collection, name.clone()));
        } else {
            plan.splices.push(name.clone());
        }
    }

    if let (Some(mine), Some(theirs)) = (&local.renamed, &remote.renamed) {
        if mine != theirs {
            plan.conflicts.push(ConflictSite::new(MergeReason::Rename, "name"));
        }
    }
    if let (Some(mine), Some(theirs)) = (&local.moved, &remote.moved) {
        if mine != theirs {
            plan.conflicts.push(ConflictSite::new(MergeReason::Move, "parent"));
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(names: &[&str]) -> ItemDiff {
        ItemDiff {
            values: names.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_disjoint_values_are_clean() {
        let plan = plan_merge(&values(&["title"]), &values(&["director"]), |_| false);
        assert!(plan.is_clean());
    }

    #[test]
    fn test_same_value_conflicts() {
        let plan = plan_merge(&values(&["title", "year"]), &values(&["title"]), |_| false);
        assert_eq!(plan.conflicts, vec![ConflictSite::new(MergeReason::Value, "title")]);
    }

    #[test]
    fn test_remote_delete_of_dirty_item() {
        let remote = ItemDiff {
            deleted: true,
            ..Default::default()
        };
        let plan = plan_merge(&values(&["title"]), &remote, |_| false);
        assert_eq!(plan.conflicts[0].reason, MergeReason::Delete);
    }

    #[test]
    fn test_local_delete_of_changed_item() {
        let local = ItemDiff {
            deleted: true,
            ..Default::default()
        };
        let plan = plan_merge(&local, &values(&["title"]), |_| false);
        assert_eq!(plan.conflicts[0].reason, MergeReason::Change);
    }

    #[test]
    fn test_collection_members() {
        let a = ItemId::new();
        let b = ItemId::new();
        let side = |member: ItemId| ItemDiff {
            refs: ["movies".to_string()].into_iter().collect(),
            members: [("movies".to_string(), [member].into_iter().collect())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let plan = plan_merge(&side(a), &side(b), |n| n == "movies");
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.splices, vec!["movies".to_string()]);

        let plan = plan_merge(&side(a), &side(a), |n| n == "movies");
        assert_eq!(plan.conflicts[0].reason, MergeReason::Collection);
    }

    #[test]
    fn test_index_edit_blocks_splice() {
        let side = |member: ItemId| ItemDiff {
            refs: ["movies".to_string()].into_iter().collect(),
            members: [("movies".to_string(), [member].into_iter().collect())]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let mut local = side(ItemId::new());
        local.index_edits.insert("movies".to_string());
        let plan = plan_merge(&local, &side(ItemId::new()), |n| n == "movies");
        assert!(plan.splices.is_empty());
        assert_eq!(
            plan.conflicts,
            vec![ConflictSite::new(MergeReason::Collection, "movies")]
        );

        // an index edit with no member touched still overlaps
        let mut local = ItemDiff {
            refs: ["movies".to_string()].into_iter().collect(),
            ..Default::default()
        };
        local.index_edits.insert("movies".to_string());
        let plan = plan_merge(&local, &side(ItemId::new()), |n| n == "movies");
        assert_eq!(plan.conflicts[0].reason, MergeReason::Collection);
    }

    #[test]
    fn test_rename_and_move() {
        let local = ItemDiff {
            renamed: Some("a".into()),
            moved: Some(None),
            ..Default::default()
        };
        let remote = ItemDiff {
            renamed: Some("b".into()),
            moved: Some(None),
            ..Default::default()
        };
        let plan = plan_merge(&local, &remote, |_| false);
        assert_eq!(plan.conflicts, vec![ConflictSite::new(MergeReason::Rename, "name")]);
    }

    #[test]
    fn test_change_set_accumulates() {
        let item = ItemId::new();
        let mut set = ChangeSet::new();
        set.absorb(item, values(&["a"]));
        set.absorb(item, values(&["b"]));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(&item).unwrap().values.len(), 2);
        assert!(set.get(&item).unwrap().status().contains(ItemStatus::VDIRTY));
    }
}
