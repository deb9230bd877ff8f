//! Value-type catalog
//!
//! A [`TypeCatalog`] is an explicit registry of [`ValueType`] handlers keyed
//! by type name. Every type knows how to check, hash, compare, encode and
//! decode its values. The repository owns one catalog and hands it to the
//! views and indexes that need it; there is no process-wide registry.

use crate::error::{ItemDbError, Result};
use crate::value::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handler for one family of values
pub trait ValueType: Send + Sync {
    /// Catalog key
    fn name(&self) -> &str;

    /// Whether `value` belongs to this type
    fn accepts(&self, value: &Value) -> bool;

    /// Stable hash of a value; equal values hash equal
    fn hash_value(&self, value: &Value) -> Result<u64> {
        Ok(xxhash_rust::xxh3::xxh3_64(&self.encode(&canonical(value))?))
    }

    /// Total order used by sorted indexes
    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        compare_values(a, b)
    }

    /// Encode for persistence
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(value)?)
    }

    /// Decode a persisted value
    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        let value: Value = rmp_serde::from_slice(bytes)?;
        if !self.accepts(&value) {
            return Err(ItemDbError::Corruption(format!(
                "decoded {} where {} was expected",
                value.type_name(),
                self.name()
            )));
        }
        Ok(value)
    }
}

/// Built-in handler matching one `Value` variant, or any value.
struct BuiltinType {
    name: &'static str,
    accepts: fn(&Value) -> bool,
}

impl ValueType for BuiltinType {
    fn name(&self) -> &str {
        self.name
    }

    fn accepts(&self, value: &Value) -> bool {
        (self.accepts)(value)
    }
}

/// Name of the catch-all type
pub const ANY_TYPE: &str = "Any";

/// Registry of value types
#[derive(Clone)]
pub struct TypeCatalog {
    types: HashMap<String, Arc<dyn ValueType>>,
}

impl fmt::Debug for TypeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.types.keys().collect();
        names.sort();
        f.debug_struct("TypeCatalog").field("types", &names).finish()
    }
}

impl Default for TypeCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeCatalog {
    /// Empty catalog
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
        }
    }

    /// Catalog with one type per `Value` variant plus `Any`
    pub fn builtin() -> Self {
        let builtins: [BuiltinType; 10] = [
            BuiltinType { name: ANY_TYPE, accepts: |_| true },
            BuiltinType { name: "Null", accepts: |v| matches!(v, Value::Null) },
            BuiltinType { name: "Bool", accepts: |v| matches!(v, Value::Bool(_)) },
            BuiltinType { name: "Int", accepts: |v| matches!(v, Value::Int(_)) },
            BuiltinType { name: "Float", accepts: |v| matches!(v, Value::Float(_)) },
            BuiltinType { name: "String", accepts: |v| matches!(v, Value::String(_)) },
            BuiltinType { name: "Bytes", accepts: |v| matches!(v, Value::Bytes(_)) },
            BuiltinType { name: "Array", accepts: |v| matches!(v, Value::Array(_)) },
            BuiltinType { name: "Object", accepts: |v| matches!(v, Value::Object(_)) },
            BuiltinType { name: "Set", accepts: |v| matches!(v, Value::Set(_)) },
        ];
        let mut catalog = Self::empty();
        for ty in builtins {
            catalog.register(Arc::new(ty));
        }
        catalog
    }

    /// Register or replace a type
    pub fn register(&mut self, ty: Arc<dyn ValueType>) {
        self.types.insert(ty.name().to_string(), ty);
    }

    /// Look up a type by name
    pub fn get(&self, name: &str) -> Result<&Arc<dyn ValueType>> {
        self.types
            .get(name)
            .ok_or_else(|| ItemDbError::InvalidOperation(format!("unknown value type '{}'", name)))
    }

    /// Handler for a declared type, or the built-in type of the value
    pub fn resolve(&self, declared: Option<&str>, value: &Value) -> Result<&Arc<dyn ValueType>> {
        match declared {
            Some(name) => self.get(name),
            None => self.get(value.type_name()),
        }
    }

    /// Fails unless `value` belongs to `declared`
    pub fn check(&self, declared: Option<&str>, value: &Value) -> Result<()> {
        let ty = self.resolve(declared, value)?;
        if ty.accepts(value) {
            Ok(())
        } else {
            Err(ItemDbError::InvalidOperation(format!(
                "{} is not a value of type {}",
                value.type_name(),
                ty.name()
            )))
        }
    }

    /// Hash with the declared type's handler
    pub fn hash(&self, declared: Option<&str>, value: &Value) -> Result<u64> {
        self.resolve(declared, value)?.hash_value(value)
    }

    /// Compare with the declared type's handler
    pub fn compare(&self, declared: Option<&str>, a: &Value, b: &Value) -> Ordering {
        match self.resolve(declared, a) {
            Ok(ty) => ty.compare(a, b),
            Err(_) => compare_values(a, b),
        }
    }

    /// Encode with the declared type's handler
    pub fn encode(&self, declared: Option<&str>, value: &Value) -> Result<Vec<u8>> {
        self.resolve(declared, value)?.encode(value)
    }

    /// Decode with a named handler
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Value> {
        self.get(type_name)?.decode(bytes)
    }

    /// Order-independent hash over named values
    pub fn hash_all<'a, I>(&self, values: I) -> Result<u64>
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut acc = 0u64;
        for (name, value) in values {
            let h = self.hash(None, value)?;
            let n = xxhash_rust::xxh3::xxh3_64(name.as_bytes());
            acc = acc.wrapping_add(h.rotate_left(7) ^ n);
        }
        Ok(acc)
    }
}

/// Representative of `value` under `==`: set members sorted, `-0.0`
/// folded into `0.0`
pub fn canonical(value: &Value) -> Value {
    match value {
        Value::Float(f) if *f == 0.0 => Value::Float(0.0),
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), canonical(v)))
                .collect(),
        ),
        Value::Set(members) => {
            let mut members: Vec<Value> = members.iter().map(canonical).collect();
            members.sort_by(compare_values);
            Value::Set(members)
        }
        other => other.clone(),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::String(_) => 3,
        Value::Bytes(_) => 4,
        Value::Array(_) => 5,
        Value::Set(_) => 6,
        Value::Object(_) => 7,
    }
}

/// Total order over values.
///
/// Values of different families order by family; Int and Float compare
/// numerically; NaN sorts after every other number.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Float(x), Value::Float(y)) => x.total_cmp(y),
        (Value::Int(x), Value::Float(y)) => (*x as f64).total_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.total_cmp(&(*y as f64)),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_seq(x, y),
        (Value::Set(x), Value::Set(y)) => {
            let mut x: Vec<&Value> = x.iter().collect();
            let mut y: Vec<&Value> = y.iter().collect();
            x.sort_by(|a, b| compare_values(a, b));
            y.sort_by(|a, b| compare_values(a, b));
            compare_refs(&x, &y)
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = ka.cmp(kb).then_with(|| compare_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn compare_seq(x: &[Value], y: &[Value]) -> Ordering {
    for (a, b) in x.iter().zip(y.iter()) {
        let ord = compare_values(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    x.len().cmp(&y.len())
}

fn compare_refs(x: &[&Value], y: &[&Value]) -> Ordering {
    for (a, b) in x.iter().zip(y.iter()) {
        let ord = compare_values(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    x.len().cmp(&y.len())
}
