//! Consistency check over the loaded items
//!
//! Verifies every cached collection's structure, that members and single
//! peers exist, that a cached peer is not older than the store at the view's
//! version, and that the peer's reverse attribute points back. Every problem
//! is logged as a warning. With repair, dangling entries are dropped and
//! stale clean peers are evicted instead of being reported.

use super::View;
use crate::item::ItemFlags;
use crate::refs::RefValue;
use itemdb_core::{ItemId, Result};
use tracing::warn;

/// Outcome of [`View::check`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Problems found and not repaired
    pub problems: Vec<String>,
    /// Dangling entries removed
    pub repaired: usize,
}

impl CheckReport {
    /// True when nothing is wrong
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }

    fn report(&mut self, id: ItemId, attribute: &str, problem: String) {
        warn!(target: "itemdb::view", item = %id, attribute, problem = %problem, "Reference check failed");
        self.problems.push(problem);
    }
}

enum Peers {
    Single(Option<ItemId>),
    Members(Vec<ItemId>),
}

impl View {
    /// Check every loaded item's references
    pub fn check(&mut self, repair: bool) -> Result<CheckReport> {
        self.ensure_open()?;
        let mut report = CheckReport::default();
        let mut ids: Vec<ItemId> = self
            .items
            .values()
            .filter(|i| !i.is_deleted())
            .map(|i| i.id)
            .collect();
        ids.sort();

        for id in ids {
            let slots: Vec<String> = match self.items.get(&id) {
                Some(item) => item.refs.names(),
                None => continue,
            };
            for attribute in slots {
                self.check_attribute(id, &attribute, repair, &mut report)?;
            }
        }
        Ok(report)
    }

    /// Check one reference attribute of `id`: structure, peer existence and
    /// freshness, and that each peer's reverse attribute holds `id`.
    ///
    /// Returns false, after a warning per problem, when anything is wrong.
    pub fn check_link(&mut self, id: ItemId, attribute: &str) -> Result<bool> {
        self.ensure_open()?;
        self.live(id)?;
        let mut report = CheckReport::default();
        self.check_attribute(id, attribute, false, &mut report)?;
        Ok(report.is_clean())
    }

    fn check_attribute(
        &mut self,
        id: ItemId,
        attribute: &str,
        repair: bool,
        report: &mut CheckReport,
    ) -> Result<()> {
        let Ok(spec) = self.ref_spec(id, attribute) else {
            report.report(id, attribute, format!("{}.{}: not a declared reference", id, attribute));
            return Ok(());
        };
        let peers = match self
            .items
            .get_mut(&id)
            .and_then(|i| i.refs.get_mut_clean(attribute))
        {
            Some(RefValue::Collection(c)) => {
                for problem in c.check_structure()? {
                    report.report(id, attribute, problem);
                }
                Peers::Members(c.keys().unwrap_or_default())
            }
            Some(RefValue::Single(link)) => Peers::Single(link.peer().resolved()),
            _ => return Ok(()),
        };
        let (peers, single) = match peers {
            Peers::Single(Some(peer)) => (vec![peer], true),
            Peers::Single(None) => return Ok(()),
            Peers::Members(members) => (members, false),
        };
        for peer in peers {
            if let Some(problem) = self.check_fresh(id, attribute, peer) {
                if repair && !self.logged.contains(&peer) {
                    self.evict_stale(peer, &problem);
                    report.repaired += 1;
                } else {
                    report.report(id, attribute, problem);
                    continue;
                }
            }
            let Some(problem) = self.check_peer(id, attribute, peer, &spec.other_name)? else {
                continue;
            };
            match (repair, single) {
                (true, true) => {
                    self.repair_single(id, attribute, &problem);
                    report.repaired += 1;
                }
                (true, false) => {
                    self.repair_member(id, attribute, peer, &problem)?;
                    report.repaired += 1;
                }
                (false, _) => report.report(id, attribute, problem),
            }
        }
        Ok(())
    }

    /// A cached committed peer must match the store at the view's version
    fn check_fresh(&self, owner: ItemId, attribute: &str, peer: ItemId) -> Option<String> {
        let item = self.items.get(&peer)?;
        if item.is_new() {
            return None;
        }
        let stored = self
            .shared
            .store
            .load_item(peer, self.version)
            .map(|(version, _)| version);
        if stored == Some(item.version) {
            return None;
        }
        Some(format!(
            "{}.{}: cached {} is at version {}, store has {}",
            owner,
            attribute,
            peer,
            item.version,
            stored.map_or_else(|| "none".to_string(), |v| v.to_string())
        ))
    }

    /// Problem with `owner.attribute -> peer`, if any
    fn check_peer(
        &mut self,
        owner: ItemId,
        attribute: &str,
        peer: ItemId,
        other_name: &str,
    ) -> Result<Option<String>> {
        if !self.load(peer)? {
            return Ok(Some(format!("{}.{}: {} does not exist", owner, attribute, peer)));
        }
        let back = match self.ref_spec(peer, other_name) {
            Ok(spec) => spec,
            Err(e) => return Ok(Some(format!("{}.{}: {}", owner, attribute, e))),
        };
        if back.other_name != attribute {
            return Ok(Some(format!(
                "{}.{}: {}.{} points back at '{}'",
                owner, attribute, peer, other_name, back.other_name
            )));
        }
        let symmetric = match self
            .items
            .get_mut(&peer)
            .and_then(|i| i.refs.get_mut_clean(other_name))
        {
            Some(RefValue::Single(link)) => link.peer().resolved() == Some(owner),
            Some(RefValue::Collection(c)) => c.contains(owner),
            _ => false,
        };
        if !symmetric {
            return Ok(Some(format!(
                "{}.{}: {}.{} does not hold {}",
                owner, attribute, peer, other_name, owner
            )));
        }
        Ok(None)
    }

    fn evict_stale(&mut self, peer: ItemId, problem: &str) {
        warn!(target: "itemdb::view", item = %peer, problem, "Evicted stale item");
        self.unload(peer);
    }

    fn repair_single(&mut self, id: ItemId, attribute: &str, problem: &str) {
        warn!(target: "itemdb::view", item = %id, attribute, problem, "Repaired dangling reference");
        if let Some(item) = self.items.get_mut(&id) {
            item.refs.set(attribute, RefValue::Empty, true);
        }
        self.mark_dirty(id, ItemFlags::RDIRTY);
    }

    fn repair_member(&mut self, id: ItemId, attribute: &str, member: ItemId, problem: &str) -> Result<()> {
        warn!(
            target: "itemdb::view",
            item = %id,
            attribute,
            member = %member,
            problem,
            "Repaired dangling collection entry"
        );
        let other = self.ref_spec(id, attribute)?.other_name;
        self.collection_for_write(id, attribute, &other)?.remove(member)?;
        self.mark_dirty(id, ItemFlags::RDIRTY);
        Ok(())
    }
}
