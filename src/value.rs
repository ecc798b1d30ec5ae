//! Canonical cell value carried by the tabular context, query parameters and
//! graph-store properties.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Opaque reference to a node held by the graph store.
///
/// The engine never interprets the number; it only threads it through
/// `_id_<tag>` columns so later actions can re-attach edges.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Opaque reference to a relationship held by the graph store.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Typed value tagged with explicit type information so persisted rollback
/// logs stay unambiguous between integers and node references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Missing or undefined.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Signed 64-bit integer literal.
    Int(i64),
    /// 64-bit floating point literal.
    Float(f64),
    /// UTF-8 string literal.
    String(String),
    /// Homogeneous or mixed list.
    List(Vec<Value>),
    /// String-keyed map, as returned by literal Cypher queries.
    Map(BTreeMap<String, Value>),
    /// Store-native node reference.
    NodeRef(NodeId),
}

impl Value {
    /// Returns true when the value is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrows the string payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used by arithmetic scripts.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Node reference view; integers are accepted because some stores
    /// return identifiers as plain numbers.
    pub fn as_node(&self) -> Option<NodeId> {
        match self {
            Value::NodeRef(id) => Some(*id),
            Value::Int(v) if *v >= 0 => Some(NodeId(*v as u64)),
            _ => None,
        }
    }

    /// Partial ordering following the store's comparison rules: numbers
    /// compare across int/float, strings lexically, anything involving null
    /// or mismatched types is incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Int(_), Value::Float(_))
            | (Value::Float(_), Value::Int(_))
            | (Value::Float(_), Value::Float(_)) => self.as_f64()?.partial_cmp(&other.as_f64()?),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::NodeRef(a), Value::NodeRef(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Total order used for sorting tables: nulls first, then by type rank.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        self.compare(other)
            .unwrap_or_else(|| type_rank(self).cmp(&type_rank(other)))
    }

    /// Hashable key used by joins, grouping and distinct counts.
    pub fn key(&self) -> ValueKey {
        match self {
            Value::Null => ValueKey::Null,
            Value::Bool(b) => ValueKey::Bool(*b),
            Value::Int(v) => ValueKey::Int(*v),
            Value::Float(v) if v.fract() == 0.0 && v.abs() < i64::MAX as f64 => {
                ValueKey::Int(*v as i64)
            }
            Value::Float(v) => ValueKey::Float(v.to_bits()),
            Value::String(s) => ValueKey::String(s.clone()),
            Value::List(items) => ValueKey::List(items.iter().map(Value::key).collect()),
            Value::Map(map) => ValueKey::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.key()))
                    .collect(),
            ),
            Value::NodeRef(id) => ValueKey::Node(id.0),
        }
    }

    /// Converts a JSON document value. Objects become maps; numbers become
    /// integers when they fit.
    pub fn from_json(value: &JsonValue) -> Value {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to a plain JSON value. Node references become integers,
    /// which is how the graph store expects them as query parameters.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(v) => JsonValue::from(*v),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::NodeRef(id) => JsonValue::from(id.0),
        }
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Int(_) | Value::Float(_) => 2,
        Value::String(_) => 3,
        Value::List(_) => 4,
        Value::Map(_) => 5,
        Value::NodeRef(_) => 6,
    }
}

/// Hashable projection of [`Value`].
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ValueKey {
    /// Null key; joins never match on it.
    Null,
    /// Boolean key.
    Bool(bool),
    /// Integer key, also used for integral floats.
    Int(i64),
    /// Raw bits of a non-integral float.
    Float(u64),
    /// String key.
    String(String),
    /// List key.
    List(Vec<ValueKey>),
    /// Map key.
    Map(Vec<(String, ValueKey)>),
    /// Node reference key.
    Node(u64),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::List(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(_) => f.write_str(&self.to_json().to_string()),
            Value::NodeRef(id) => write!(f, "{}", id.0),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<NodeId> for Value {
    fn from(value: NodeId) -> Self {
        Value::NodeRef(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}
