//! Copying item graphs between views
//!
//! Import walks the graph reachable from a set of roots in another view
//! (possibly at another version) with an explicit worklist, then recreates
//! every visited item here under the same id. References are rebuilt
//! through the normal attach path, so both sides end up symmetric.

use super::View;
use crate::item::{Item, ItemFlags};
use crate::refs::RefValue;
use crate::values::{EntryFlags, SetMode};
use itemdb_core::{ItemDbError, ItemId, Result, Value};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

enum Copied {
    Single(Option<ItemId>),
    Members(Vec<(ItemId, Option<String>)>),
}

struct Snapshot {
    id: ItemId,
    kind: Option<String>,
    name: Option<String>,
    parent: Option<ItemId>,
    values: Vec<(String, Value)>,
    refs: Vec<(String, Copied)>,
}

impl View {
    /// Copy `roots`, their ancestors and everything they reference from
    /// `source`. Returns the ids copied, in visiting order.
    pub fn import_items(&mut self, source: &mut View, roots: &[ItemId]) -> Result<Vec<ItemId>> {
        self.ensure_open()?;
        source.ensure_open()?;
        if !std::sync::Arc::ptr_eq(&self.shared, &source.shared) {
            return Err(ItemDbError::InvalidOperation(
                "import needs a view of the same repository".into(),
            ));
        }

        let mut visited: HashSet<ItemId> = HashSet::new();
        let mut work: VecDeque<ItemId> = roots.iter().copied().collect();
        let mut snapshots = Vec::new();
        while let Some(id) = work.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let snapshot = source.snapshot(id)?;
            work.extend(snapshot.parent);
            for (_, copied) in &snapshot.refs {
                match copied {
                    Copied::Single(peer) => work.extend(*peer),
                    Copied::Members(members) => work.extend(members.iter().map(|(m, _)| *m)),
                }
            }
            snapshots.push(snapshot);
        }

        // parents first so names register under existing items
        let mut ordered = Vec::with_capacity(snapshots.len());
        let mut placed: HashSet<ItemId> = HashSet::new();
        while !snapshots.is_empty() {
            let before = snapshots.len();
            let (ready, rest): (Vec<Snapshot>, Vec<Snapshot>) = snapshots.into_iter().partition(|s| {
                s.parent
                    .map_or(true, |p| placed.contains(&p) || !visited.contains(&p))
            });
            placed.extend(ready.iter().map(|s| s.id));
            ordered.extend(ready);
            snapshots = rest;
            if snapshots.len() == before {
                return Err(ItemDbError::Corruption("cycle in item parents".into()));
            }
        }

        for snapshot in &ordered {
            self.import_header(snapshot)?;
        }
        for snapshot in &ordered {
            for (attribute, copied) in &snapshot.refs {
                match copied {
                    Copied::Single(peer) => {
                        let current = self.get_ref(snapshot.id, attribute)?;
                        if current != *peer {
                            self.set_ref(snapshot.id, attribute, *peer)?;
                        }
                    }
                    Copied::Members(members) => {
                        for (member, alias) in members {
                            self.add_ref(snapshot.id, attribute, *member, alias.as_deref())?;
                        }
                    }
                }
            }
        }
        let ids: Vec<ItemId> = ordered.iter().map(|s| s.id).collect();
        debug!(
            target: "itemdb::view",
            view = %self.name,
            from = %source.name,
            count = ids.len(),
            "Imported items"
        );
        Ok(ids)
    }

    fn snapshot(&mut self, id: ItemId) -> Result<Snapshot> {
        self.live(id)?;
        let slots: Vec<String> = match self.items.get(&id) {
            Some(item) => item.refs.names(),
            None => return Err(ItemDbError::NoSuchItem(id)),
        };
        let mut refs = Vec::new();
        for attribute in slots {
            let copied = match self
                .items
                .get_mut(&id)
                .and_then(|i| i.refs.get_mut_clean(&attribute))
            {
                Some(RefValue::Collection(c)) => {
                    let mut members = Vec::new();
                    for key in c.keys()? {
                        members.push((key, c.alias_of(key)?));
                    }
                    Copied::Members(members)
                }
                Some(RefValue::Single(link)) => Copied::Single(link.peer().resolved()),
                _ => Copied::Single(None),
            };
            refs.push((attribute, copied));
        }
        let item = self.items.get(&id).ok_or(ItemDbError::NoSuchItem(id))?;
        let values = item
            .values
            .persistent_names()
            .into_iter()
            .filter_map(|name| item.values.get(&name).cloned().map(|v| (name, v)))
            .collect();
        Ok(Snapshot {
            id,
            kind: item.kind.clone(),
            name: item.name.clone(),
            parent: item.parent,
            values,
            refs,
        })
    }

    fn import_header(&mut self, snapshot: &Snapshot) -> Result<()> {
        let id = snapshot.id;
        if !self.load(id)? {
            if self.items.contains_key(&id) {
                return Err(ItemDbError::InvalidOperation(format!(
                    "{} is deleted in view '{}'",
                    id, self.name
                )));
            }
            let mut item = Item::new(id, snapshot.kind.clone(), self.version);
            item.last_access = self.next_tick();
            self.items.insert(id, item);
            self.mark_dirty(id, ItemFlags::empty());
        }
        if let Some(name) = &snapshot.name {
            let (old_parent, old_name) = match self.items.get(&id) {
                Some(item) => (item.parent, item.name.clone()),
                None => return Err(ItemDbError::NoSuchItem(id)),
            };
            self.rehome(id, old_parent, old_name, snapshot.parent, name.clone())?;
        }
        let changed = match self.items.get_mut(&id) {
            Some(item) => {
                let mut changed = false;
                for (name, value) in &snapshot.values {
                    changed |= item
                        .values
                        .set(name, value.clone(), SetMode::Dirty, EntryFlags::empty());
                }
                changed
            }
            None => false,
        };
        if changed {
            self.mark_dirty(id, ItemFlags::VDIRTY);
        }
        Ok(())
    }
}
