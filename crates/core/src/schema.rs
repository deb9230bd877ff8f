//! Kinds and attribute declarations
//!
//! A [`Kind`] declares the attributes its items may carry. Reference
//! attributes name the attribute on the peer (`other_name`) that holds the
//! reverse side, which is what keeps every reference bi-directional.

use crate::error::{ItemDbError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How many peers a reference attribute holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    /// Zero or one peer
    Single,
    /// Ordered reference collection
    List,
}

/// Reference half of an attribute declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSpec {
    /// Attribute on the peer holding the reverse side
    pub other_name: String,
    /// Single peer or ordered collection
    pub cardinality: Cardinality,
}

/// Declaration of one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDef {
    /// Attribute name
    pub name: String,
    /// Catalog type name for literal values (None accepts any value)
    pub value_type: Option<String>,
    /// Set for reference attributes
    pub reference: Option<RefSpec>,
    /// Writes are rejected after the item is first committed
    pub read_only: bool,
    /// Never persisted
    pub transient: bool,
    /// Fed to the full-text indexer
    pub indexed: bool,
    /// Returned by reads when the attribute is unset
    pub default: Option<Value>,
}

impl AttributeDef {
    /// Literal-valued attribute of a catalog type
    pub fn value(name: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: Some(value_type.into()),
            reference: None,
            read_only: false,
            transient: false,
            indexed: false,
            default: None,
        }
    }

    /// Single-valued reference whose reverse side is `other_name`
    pub fn reference(name: impl Into<String>, other_name: impl Into<String>) -> Self {
        Self::with_ref(name, other_name, Cardinality::Single)
    }

    /// Collection-valued reference whose reverse side is `other_name`
    pub fn collection(name: impl Into<String>, other_name: impl Into<String>) -> Self {
        Self::with_ref(name, other_name, Cardinality::List)
    }

    fn with_ref(name: impl Into<String>, other_name: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            value_type: None,
            reference: Some(RefSpec {
                other_name: other_name.into(),
                cardinality,
            }),
            read_only: false,
            transient: false,
            indexed: false,
            default: None,
        }
    }

    /// Mark read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Mark transient
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Mark full-text indexed
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Default value for reads of an unset attribute
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    /// True for reference attributes
    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// True for collection-valued references
    pub fn is_collection(&self) -> bool {
        matches!(
            self.reference,
            Some(RefSpec {
                cardinality: Cardinality::List,
                ..
            })
        )
    }

    /// Reverse attribute name for references
    pub fn other_name(&self) -> Option<&str> {
        self.reference.as_ref().map(|r| r.other_name.as_str())
    }
}

/// Item kind: a named set of attribute declarations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kind {
    /// Kind name
    pub name: String,
    attributes: BTreeMap<String, AttributeDef>,
}

impl Kind {
    /// Empty kind
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add a declaration (builder style)
    pub fn with(mut self, attr: AttributeDef) -> Self {
        self.attributes.insert(attr.name.clone(), attr);
        self
    }

    /// Declaration by name
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.get(name)
    }

    /// All declarations in name order
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDef> {
        self.attributes.values()
    }
}

/// Registry of kinds
#[derive(Debug, Clone, Default)]
pub struct Schema {
    kinds: HashMap<String, Kind>,
}

impl Schema {
    /// Empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a kind
    pub fn define(&mut self, kind: Kind) {
        self.kinds.insert(kind.name.clone(), kind);
    }

    /// Kind by name
    pub fn kind(&self, name: &str) -> Option<&Kind> {
        self.kinds.get(name)
    }

    /// Declaration of `attr` on `kind`, if both exist
    pub fn attribute(&self, kind: Option<&str>, attr: &str) -> Option<&AttributeDef> {
        kind.and_then(|k| self.kinds.get(k)).and_then(|k| k.attribute(attr))
    }

    /// Checks that every reference names a reverse attribute that is itself a
    /// reference pointing back. Peer kinds are open, so the reverse must be
    /// declared on at least one kind.
    pub fn validate(&self) -> Result<()> {
        for kind in self.kinds.values() {
            for attr in kind.attributes() {
                let Some(spec) = &attr.reference else { continue };
                let found = self.kinds.values().any(|k| {
                    k.attribute(&spec.other_name)
                        .and_then(|a| a.other_name())
                        .map(|back| back == attr.name)
                        .unwrap_or(false)
                });
                if !found {
                    return Err(ItemDbError::Schema(format!(
                        "{}.{} names reverse '{}' which no kind declares pointing back",
                        kind.name, attr.name, spec.other_name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Kind names in sorted order
    pub fn kind_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
