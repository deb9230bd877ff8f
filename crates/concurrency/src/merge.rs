//! Merge resolution
//!
//! A [`Conflict`] describes one attribute (or one item-level property) that
//! both the local view and a newer committed version changed. Resolution
//! goes through [`dispatch`], the single point that consults:
//!
//! 1. the [`Mergeable`] registered for the item's kind, then
//! 2. the caller's [`MergeResolver`].
//!
//! An answer of [`Resolution::Unresolved`] from both escalates to a merge
//! error naming the reason and attribute.

use itemdb_core::{ItemDbError, ItemId, MergeReason, Result, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One side of a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum MergeValue {
    /// Literal value, `None` when removed
    Value(Option<Value>),
    /// Single-valued reference, `None` when cleared
    Ref(Option<ItemId>),
    /// Item name
    Name(String),
    /// Item parent, `None` for a root
    Parent(Option<ItemId>),
    /// The item is deleted on this side
    Deleted,
    /// The item exists and was changed on this side
    Changed,
}

impl MergeValue {
    fn same_shape(&self, other: &MergeValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for MergeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeValue::Value(Some(v)) => write!(f, "{:?}", v),
            MergeValue::Value(None) => write!(f, "<removed>"),
            MergeValue::Ref(Some(id)) => write!(f, "-> {}", id),
            MergeValue::Ref(None) => write!(f, "-> <none>"),
            MergeValue::Name(n) => write!(f, "name {:?}", n),
            MergeValue::Parent(Some(id)) => write!(f, "parent {}", id),
            MergeValue::Parent(None) => write!(f, "parent <root>"),
            MergeValue::Deleted => write!(f, "<deleted>"),
            MergeValue::Changed => write!(f, "<changed>"),
        }
    }
}

/// A concurrent change to reconcile
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// Why the merge is needed
    pub reason: MergeReason,
    /// Item both sides changed
    pub item: ItemId,
    /// Kind of the item, used to find a [`Mergeable`]
    pub kind: Option<String>,
    /// Attribute name, or a property label such as `"name"` for item-level conflicts
    pub attribute: String,
    /// This view's uncommitted side
    pub local: MergeValue,
    /// The newer committed side
    pub incoming: MergeValue,
}

/// Answer to a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Keep the local change
    UseLocal,
    /// Adopt the committed change
    UseIncoming,
    /// Use this value instead
    Use(MergeValue),
    /// No opinion
    Unresolved,
}

/// Caller-supplied conflict resolver.
///
/// Closures `FnMut(&Conflict) -> Resolution` implement this directly.
pub trait MergeResolver {
    /// Decide one conflict
    fn resolve(&mut self, conflict: &Conflict) -> Resolution;
}

impl<F> MergeResolver for F
where
    F: FnMut(&Conflict) -> Resolution,
{
    fn resolve(&mut self, conflict: &Conflict) -> Resolution {
        self(conflict)
    }
}

/// Resolver that always adopts the committed side
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferIncoming;

impl MergeResolver for PreferIncoming {
    fn resolve(&mut self, _conflict: &Conflict) -> Resolution {
        Resolution::UseIncoming
    }
}

/// Resolver that keeps local changes, accepting remote deletions
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferLocal;

impl MergeResolver for PreferLocal {
    fn resolve(&mut self, conflict: &Conflict) -> Resolution {
        match conflict.reason {
            MergeReason::Delete => Resolution::UseIncoming,
            _ => Resolution::UseLocal,
        }
    }
}

/// Resolver with no opinion on anything
#[derive(Debug, Clone, Copy, Default)]
pub struct Decline;

impl MergeResolver for Decline {
    fn resolve(&mut self, _conflict: &Conflict) -> Resolution {
        Resolution::Unresolved
    }
}

/// Per-kind merge capability
pub trait Mergeable: Send + Sync {
    /// Decide a conflict on an item of this kind
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Kind name → [`Mergeable`]
#[derive(Clone, Default)]
pub struct MergeRegistry {
    by_kind: HashMap<String, Arc<dyn Mergeable>>,
}

impl fmt::Debug for MergeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeRegistry")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MergeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the merge capability of `kind`
    pub fn register(&mut self, kind: impl Into<String>, mergeable: Arc<dyn Mergeable>) {
        self.by_kind.insert(kind.into(), mergeable);
    }

    /// Capability of `kind`
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn Mergeable>> {
        self.by_kind.get(kind)
    }
}

/// Resolve `conflict`, returning the value to keep.
///
/// Structural collection conflicts never reach a resolver. A deletion can
/// only be accepted, and a name collision can only be fixed by a new name.
pub fn dispatch(
    registry: &MergeRegistry,
    resolver: &mut dyn MergeResolver,
    conflict: &Conflict,
) -> Result<MergeValue> {
    let fail = |message: String| {
        ItemDbError::merge(conflict.reason, conflict.item, conflict.attribute.clone(), message)
    };

    if conflict.reason == MergeReason::Collection {
        return Err(fail(
            "concurrent changes to the same collection entries cannot be merged".to_string(),
        ));
    }

    let mut resolution = Resolution::Unresolved;
    if let Some(mergeable) = conflict.kind.as_deref().and_then(|k| registry.get(k)) {
        resolution = mergeable.resolve(conflict);
    }
    if resolution == Resolution::Unresolved {
        resolution = resolver.resolve(conflict);
    }

    let chosen = match resolution {
        Resolution::UseLocal => conflict.local.clone(),
        Resolution::UseIncoming => conflict.incoming.clone(),
        Resolution::Use(value) => value,
        Resolution::Unresolved => {
            return Err(fail(format!(
                "unresolved: local {} vs incoming {}",
                conflict.local, conflict.incoming
            )))
        }
    };

    match conflict.reason {
        MergeReason::Delete if chosen != MergeValue::Deleted => {
            Err(fail("item was deleted in another view".to_string()))
        }
        MergeReason::Name => match &chosen {
            MergeValue::Name(n) if MergeValue::Name(n.clone()) != conflict.incoming => Ok(chosen),
            _ => Err(fail(format!("name {} is already taken", conflict.incoming))),
        },
        MergeReason::Change
            if !matches!(chosen, MergeValue::Deleted | MergeValue::Changed) =>
        {
            Err(fail(format!("cannot resolve a deletion with {}", chosen)))
        }
        MergeReason::Delete | MergeReason::Change => Ok(chosen),
        _ if !chosen.same_shape(&conflict.incoming) => Err(fail(format!(
            "resolution {} does not match {}",
            chosen, conflict.incoming
        ))),
        _ => Ok(chosen),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value_conflict() -> Conflict {
        Conflict {
            reason: MergeReason::Value,
            item: ItemId::new(),
            kind: Some("Movie".into()),
            attribute: "title".into(),
            local: MergeValue::Value(Some(Value::from("x"))),
            incoming: MergeValue::Value(Some(Value::from("y"))),
        }
    }

    struct KeepLongest;

    impl Mergeable for KeepLongest {
        fn resolve(&self, conflict: &Conflict) -> Resolution {
            match (&conflict.local, &conflict.incoming) {
                (MergeValue::Value(Some(Value::String(a))), MergeValue::Value(Some(Value::String(b)))) => {
                    if a.len() >= b.len() {
                        Resolution::UseLocal
                    } else {
                        Resolution::UseIncoming
                    }
                }
                _ => Resolution::Unresolved,
            }
        }
    }

    #[test]
    fn test_closure_resolver() {
        let registry = MergeRegistry::new();
        let mut seen = Vec::new();
        let mut resolver = |c: &Conflict| {
            seen.push(c.reason);
            Resolution::UseIncoming
        };
        let chosen = dispatch(&registry, &mut resolver, &value_conflict()).unwrap();
        assert_eq!(chosen, MergeValue::Value(Some(Value::from("y"))));
        assert_eq!(seen, vec![MergeReason::Value]);
    }

    #[test]
    fn test_decline_is_merge_error() {
        let err = dispatch(&MergeRegistry::new(), &mut Decline, &value_conflict()).unwrap_err();
        assert_eq!(err.merge_reason(), Some(MergeReason::Value));
        assert!(err.to_string().contains("title"));
    }

    #[test]
    fn test_mergeable_consulted_first() {
        let mut registry = MergeRegistry::new();
        registry.register("Movie", Arc::new(KeepLongest));
        let mut conflict = value_conflict();
        conflict.local = MergeValue::Value(Some(Value::from("longer")));
        let chosen = dispatch(&registry, &mut Decline, &conflict).unwrap();
        assert_eq!(chosen, conflict.local);
    }

    #[test]
    fn test_delete_only_accepts_deletion() {
        let conflict = Conflict {
            reason: MergeReason::Delete,
            item: ItemId::new(),
            kind: None,
            attribute: "item".into(),
            local: MergeValue::Changed,
            incoming: MergeValue::Deleted,
        };
        let registry = MergeRegistry::new();
        assert!(dispatch(&registry, &mut PreferIncoming, &conflict).is_ok());
        let mut keep = |_: &Conflict| Resolution::UseLocal;
        assert!(dispatch(&registry, &mut keep, &conflict).is_err());
        assert!(dispatch(&registry, &mut PreferLocal, &conflict).is_ok());
    }

    #[test]
    fn test_collection_conflict_never_resolves() {
        let mut conflict = value_conflict();
        conflict.reason = MergeReason::Collection;
        let err = dispatch(&MergeRegistry::new(), &mut PreferIncoming, &conflict).unwrap_err();
        assert_eq!(err.merge_reason(), Some(MergeReason::Collection));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut wrong = |_: &Conflict| Resolution::Use(MergeValue::Ref(None));
        assert!(dispatch(&MergeRegistry::new(), &mut wrong, &value_conflict()).is_err());
    }

    #[test]
    fn test_name_collision_needs_new_name() {
        let conflict = Conflict {
            reason: MergeReason::Name,
            item: ItemId::new(),
            kind: None,
            attribute: "name".into(),
            local: MergeValue::Name("a".into()),
            incoming: MergeValue::Name("a".into()),
        };
        let registry = MergeRegistry::new();
        assert!(dispatch(&registry, &mut PreferIncoming, &conflict).is_err());
        let mut rename = |_: &Conflict| Resolution::Use(MergeValue::Name("a-2".into()));
        assert_eq!(
            dispatch(&registry, &mut rename, &conflict).unwrap(),
            MergeValue::Name("a-2".into())
        );
    }
}
