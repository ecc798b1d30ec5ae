//! Abstract data requests: which classes to fetch, how they relate and which
//! values they must carry.
use std::collections::BTreeMap;
use std::convert::TryFrom;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::ast::EdgeDirection;
use crate::model::VALUE_PROPERTY;
use crate::value::Value;

/// A requested class.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ClassRequestRepr")]
pub struct ClassRequest {
    /// Class label.
    pub label: String,
    /// Requested through OPTIONAL MATCH when it has no relationships.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClassRequestRepr {
    Label(String),
    Full {
        label: String,
        #[serde(default)]
        optional: bool,
    },
}

impl From<ClassRequestRepr> for ClassRequest {
    fn from(repr: ClassRequestRepr) -> Self {
        match repr {
            ClassRequestRepr::Label(label) => ClassRequest {
                label,
                optional: false,
            },
            ClassRequestRepr::Full { label, optional } => ClassRequest { label, optional },
        }
    }
}

/// Relationship between two requested classes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelDescriptor {
    /// Source class label.
    pub from: String,
    /// Target class label.
    pub to: String,
    /// Edge type; defaults to the target label.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub rel_type: Option<String>,
    /// Renames the target class's tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_label: Option<String>,
    /// Compiles to OPTIONAL MATCH.
    #[serde(default)]
    pub optional: bool,
}

impl RelDescriptor {
    /// Mandatory relationship with the default type.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            rel_type: None,
            short_label: None,
            optional: false,
        }
    }

    /// Sets the edge type.
    pub fn with_type(mut self, rel_type: impl Into<String>) -> Self {
        self.rel_type = Some(rel_type.into());
        self
    }

    /// Sets the short label that renames the target tag.
    pub fn with_short_label(mut self, short: impl Into<String>) -> Self {
        self.short_label = Some(short.into());
        self
    }

    /// Marks the relationship optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Edge type actually used.
    pub fn edge_type(&self) -> &str {
        self.rel_type.as_deref().unwrap_or(&self.to)
    }
}

/// Numeric or lexical interval.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeSpec {
    /// Lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<Value>,
    /// Upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<Value>,
    /// `min <= p` instead of `min < p`.
    #[serde(default)]
    pub min_include: bool,
    /// `p <= max` instead of `p < max`.
    #[serde(default)]
    pub max_include: bool,
    /// Null values also satisfy the constraint.
    #[serde(default)]
    pub incl_null: bool,
}

/// Per-property value constraint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum Condition {
    /// Scalar equality.
    Equals(Value),
    /// List membership.
    OneOf(Vec<Value>),
    /// Negated list membership.
    NotIn(Vec<Value>),
    /// Interval test.
    Range(RangeSpec),
}

const RANGE_KEYS: [&str; 5] = ["min", "max", "min_include", "max_include", "incl_null"];

impl TryFrom<JsonValue> for Condition {
    type Error = String;

    fn try_from(json: JsonValue) -> Result<Self, Self::Error> {
        match json {
            JsonValue::Array(items) => Ok(Condition::OneOf(items.iter().map(Value::from_json).collect())),
            JsonValue::Object(map) if map.contains_key("not_in") => {
                Ok(Condition::NotIn(json_list(&map["not_in"])))
            }
            JsonValue::Object(map) if map.keys().any(|k| RANGE_KEYS.contains(&k.as_str())) => {
                let flag = |key: &str| -> Result<bool, String> {
                    match map.get(key) {
                        None | Some(JsonValue::Null) => Ok(false),
                        Some(JsonValue::Bool(b)) => Ok(*b),
                        Some(other) => Err(format!("'{key}' must be a boolean, got {other}")),
                    }
                };
                let bound = |key: &str| match map.get(key) {
                    None | Some(JsonValue::Null) => None,
                    Some(v) => Some(Value::from_json(v)),
                };
                Ok(Condition::Range(RangeSpec {
                    min: bound("min"),
                    max: bound("max"),
                    min_include: flag("min_include")?,
                    max_include: flag("max_include")?,
                    incl_null: flag("incl_null")?,
                }))
            }
            JsonValue::Object(map) => Err(format!(
                "unrecognised condition keys {:?}",
                map.keys().collect::<Vec<_>>()
            )),
            scalar => Ok(Condition::Equals(Value::from_json(&scalar))),
        }
    }
}

fn json_list(json: &JsonValue) -> Vec<Value> {
    match json {
        JsonValue::Array(items) => items.iter().map(Value::from_json).collect(),
        other => vec![Value::from_json(other)],
    }
}

impl From<Condition> for JsonValue {
    fn from(condition: Condition) -> Self {
        match condition {
            Condition::Equals(v) => v.to_json(),
            Condition::OneOf(values) => JsonValue::Array(values.iter().map(Value::to_json).collect()),
            Condition::NotIn(values) => {
                let mut map = Map::new();
                map.insert(
                    "not_in".into(),
                    JsonValue::Array(values.iter().map(Value::to_json).collect()),
                );
                JsonValue::Object(map)
            }
            Condition::Range(range) => {
                let mut map = Map::new();
                if let Some(min) = &range.min {
                    map.insert("min".into(), min.to_json());
                }
                if let Some(max) = &range.max {
                    map.insert("max".into(), max.to_json());
                }
                map.insert("min_include".into(), range.min_include.into());
                map.insert("max_include".into(), range.max_include.into());
                map.insert("incl_null".into(), range.incl_null.into());
                JsonValue::Object(map)
            }
        }
    }
}

/// Requirement that the anchor node has (or lacks) a neighbour carrying
/// certain labels.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistenceCheck {
    /// `NOT EXISTS` instead of `EXISTS`.
    #[serde(default)]
    pub negated: bool,
    /// Direction of the neighbour relationship.
    #[serde(default)]
    pub direction: EdgeDirection,
    /// Neighbour must carry one of these labels.
    #[serde(default)]
    pub include: Vec<String>,
    /// Neighbour must carry none of these labels.
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// How output columns are named.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnNaming {
    /// Short labels, renamed by relationship short labels.
    #[default]
    ShortLabel,
    /// Full class labels.
    Label,
}

/// Translation options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Accept disconnected requests as cross products.
    pub allow_unrelated_subgraphs: bool,
    /// Discover relationships from the schema when none are given.
    pub infer_rels: bool,
    /// Maximum row count; `None` is unbounded.
    pub limit: Option<i64>,
    /// Column naming mode.
    pub naming: ColumnNaming,
    /// Property projected into value columns.
    pub value_property: String,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            allow_unrelated_subgraphs: false,
            infer_rels: false,
            limit: None,
            naming: ColumnNaming::ShortLabel,
            value_property: VALUE_PROPERTY.to_owned(),
        }
    }
}

/// Complete input of the query builder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataRequest {
    /// Requested classes.
    pub classes: Vec<ClassRequest>,
    /// Explicit relationships.
    pub relationships: Vec<RelDescriptor>,
    /// Value constraints: class label → property → condition.
    pub where_map: BTreeMap<String, BTreeMap<String, Condition>>,
    /// Existence constraints keyed by class label.
    pub where_rel_map: BTreeMap<String, Vec<ExistenceCheck>>,
    /// Options.
    pub options: QueryOptions,
}

impl DataRequest {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a class.
    pub fn class(mut self, label: impl Into<String>) -> Self {
        self.classes.push(ClassRequest {
            label: label.into(),
            optional: false,
        });
        self
    }

    /// Requests a class through OPTIONAL MATCH.
    pub fn optional_class(mut self, label: impl Into<String>) -> Self {
        self.classes.push(ClassRequest {
            label: label.into(),
            optional: true,
        });
        self
    }

    /// Adds a relationship.
    pub fn relationship(mut self, rel: RelDescriptor) -> Self {
        self.relationships.push(rel);
        self
    }

    /// Adds a value constraint.
    pub fn condition(
        mut self,
        class: impl Into<String>,
        property: impl Into<String>,
        condition: Condition,
    ) -> Self {
        self.where_map
            .entry(class.into())
            .or_default()
            .insert(property.into(), condition);
        self
    }

    /// Adds an existence constraint.
    pub fn existence(mut self, class: impl Into<String>, check: ExistenceCheck) -> Self {
        self.where_rel_map.entry(class.into()).or_default().push(check);
        self
    }

    /// Sets the row limit.
    pub fn limit(mut self, limit: i64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Enables relationship inference.
    pub fn infer_rels(mut self) -> Self {
        self.options.infer_rels = true;
        self
    }

    /// Accepts disconnected requests.
    pub fn allow_unrelated_subgraphs(mut self) -> Self {
        self.options.allow_unrelated_subgraphs = true;
        self
    }

    /// True when nothing was requested.
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.relationships.is_empty()
    }
}
