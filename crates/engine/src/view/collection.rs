//! Borrowed handle on one reference collection

use super::View;
use crate::collection::{Placement, RefCollection};
use crate::item::ItemFlags;
use itemdb_core::{IndexKind, ItemDbError, ItemId, Result};

/// Handle on `owner.attribute`.
///
/// Reads walk the collection lazily; writes keep the members' reverse
/// references and the sorted indexes in step.
pub struct Collection<'v> {
    view: &'v mut View,
    owner: ItemId,
    attribute: String,
    other_name: String,
}

impl<'v> Collection<'v> {
    pub(crate) fn new(view: &'v mut View, owner: ItemId, attribute: &str, other_name: String) -> Self {
        Self {
            view,
            owner,
            attribute: attribute.to_string(),
            other_name,
        }
    }

    fn read(&mut self) -> Result<&mut RefCollection> {
        self.view.read_collection(self.owner, &self.attribute)
    }

    fn write(&mut self) -> Result<&mut RefCollection> {
        self.view
            .collection_for_write(self.owner, &self.attribute, &self.other_name)
    }

    fn touched(&mut self) {
        self.view.mark_dirty(self.owner, ItemFlags::RDIRTY);
    }

    /// Owning item
    pub fn owner(&self) -> ItemId {
        self.owner
    }

    /// Attribute name
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Number of members
    pub fn len(&mut self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    /// True without members
    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.read()?.is_empty())
    }

    /// True when `member` belongs to the collection
    pub fn contains(&mut self, member: ItemId) -> Result<bool> {
        Ok(self.read()?.contains(member))
    }

    /// Members in base order
    pub fn keys(&mut self) -> Result<Vec<ItemId>> {
        self.read()?.keys()
    }

    /// First member, in base order or in `index`
    pub fn first(&mut self, index: Option<&str>) -> Result<Option<ItemId>> {
        let coll = self.read()?;
        match index {
            None => Ok(coll.first()),
            Some(name) => Ok(coll.index(name)?.get(0)),
        }
    }

    /// Last member, in base order or in `index`
    pub fn last(&mut self, index: Option<&str>) -> Result<Option<ItemId>> {
        let coll = self.read()?;
        match index {
            None => Ok(coll.last()),
            Some(name) => Ok(coll.index(name)?.get(-1)),
        }
    }

    /// Member after `member`, in base order or in `index`
    pub fn next(&mut self, member: ItemId, index: Option<&str>) -> Result<Option<ItemId>> {
        let coll = self.read()?;
        match index {
            None => coll.next(member),
            Some(name) => {
                if !coll.contains(member) {
                    return Err(not_member(coll, member));
                }
                Ok(coll.index(name)?.next(member))
            }
        }
    }

    /// Member before `member`, in base order or in `index`
    pub fn previous(&mut self, member: ItemId, index: Option<&str>) -> Result<Option<ItemId>> {
        let coll = self.read()?;
        match index {
            None => coll.previous(member),
            Some(name) => {
                if !coll.contains(member) {
                    return Err(not_member(coll, member));
                }
                Ok(coll.index(name)?.previous(member))
            }
        }
    }

    /// Member holding `alias`
    pub fn get_by_alias(&mut self, alias: &str) -> Result<Option<ItemId>> {
        Ok(self.read()?.get_by_alias(alias))
    }

    /// Alias of `member`
    pub fn alias_of(&mut self, member: ItemId) -> Result<Option<String>> {
        self.read()?.alias_of(member)
    }

    /// Member at `position` of `index`; negative positions count from the end
    pub fn get_by_index(&mut self, index: &str, position: isize) -> Result<Option<ItemId>> {
        Ok(self.read()?.index(index)?.get(position))
    }

    /// Position of `member` in `index`
    pub fn index_position(&mut self, index: &str, member: ItemId) -> Result<Option<usize>> {
        Ok(self.read()?.index(index)?.position(member))
    }

    /// Every member in `index` order
    pub fn index_keys(&mut self, index: &str) -> Result<Vec<ItemId>> {
        Ok(self.read()?.index(index)?.keys().to_vec())
    }

    /// Integer payload of `member` in `index`
    pub fn entry_value(&mut self, index: &str, member: ItemId) -> Result<i64> {
        let coll = self.read()?;
        if !coll.contains(member) {
            return Err(not_member(coll, member));
        }
        Ok(coll.index(index)?.entry_value(member))
    }

    /// Names of attached indexes
    pub fn index_names(&mut self) -> Result<Vec<String>> {
        Ok(self.read()?.index_names())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append `member`; an existing member only gets the new alias
    pub fn append(&mut self, member: ItemId, alias: Option<&str>) -> Result<()> {
        self.view
            .add_ref(self.owner, &self.attribute, member, alias)
    }

    /// Insert `member` right after `after`, or first when `None`
    pub fn insert_after(&mut self, member: ItemId, after: Option<ItemId>, alias: Option<&str>) -> Result<()> {
        let placement = match after {
            Some(a) => Placement::After(a),
            None => Placement::First,
        };
        self.view
            .insert_ref(self.owner, &self.attribute, member, placement, alias)
    }

    /// Remove `member`, clearing its reverse side
    pub fn remove(&mut self, member: ItemId) -> Result<()> {
        self.view.remove_ref(self.owner, &self.attribute, member)
    }

    /// Put `new` where `old` is
    pub fn replace(&mut self, old: ItemId, new: ItemId) -> Result<()> {
        self.view.replace_ref(self.owner, &self.attribute, old, new)
    }

    /// Set or clear the alias of `member`
    pub fn set_alias(&mut self, member: ItemId, alias: Option<&str>) -> Result<()> {
        self.write()?.set_alias(member, alias)?;
        self.touched();
        Ok(())
    }

    /// Move `member` right after `after` (first when `None`) in base order,
    /// or in the sequence index `index`
    pub fn place(&mut self, member: ItemId, after: Option<ItemId>, index: Option<&str>) -> Result<()> {
        match index {
            None => self.write()?.place(member, after)?,
            Some(name) => {
                let coll = self.write()?;
                if !matches!(coll.index_kind(name), Some(IndexKind::Sequence) | None) {
                    return Err(ItemDbError::InvalidOperation(format!(
                        "index '{}' is sorted; its order is computed",
                        name
                    )));
                }
                coll.place_in_index(name, member, after)?;
            }
        }
        self.touched();
        Ok(())
    }

    /// Attach an index holding every current member
    pub fn add_index(&mut self, name: &str, kind: IndexKind, descending: bool) -> Result<()> {
        if let IndexKind::Comparator { method } = &kind {
            self.view.shared.comparator(method)?;
        }
        self.write()?.add_index(name, kind, descending)?;
        self.touched();
        self.view.resort(self.owner, &self.attribute, None, Some(name))
    }

    /// Detach an index
    pub fn remove_index(&mut self, name: &str) -> Result<()> {
        self.write()?.remove_index(name)?;
        self.touched();
        Ok(())
    }

    /// Set the integer payload of `member` in `index`
    pub fn set_entry_value(&mut self, index: &str, member: ItemId, value: i64) -> Result<()> {
        self.write()?.set_entry_value(index, member, value)?;
        self.touched();
        Ok(())
    }
}

fn not_member(coll: &RefCollection, member: ItemId) -> ItemDbError {
    ItemDbError::NotInCollection {
        owner: coll.owner(),
        attribute: coll.attribute().to_string(),
        member,
    }
}
