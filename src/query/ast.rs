//! Structured form of a compiled data request.
//!
//! The builder lowers a [`DataRequest`](super::DataRequest) into match groups
//! made of node patterns, edge clauses and predicates. Stores that speak
//! Cypher use the rendered text; the in-memory store evaluates these
//! structures directly.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier assigned to a node binding within the query.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Var(pub String);

impl Var {
    /// Borrowed name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Node pattern `(var:Label)`.
#[derive(Clone, Debug, PartialEq)]
pub struct NodePattern {
    /// Variable bound by the pattern.
    pub var: Var,
    /// Label every bound node must carry.
    pub label: String,
}

/// Direction selector for edge traversals.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeDirection {
    /// Outgoing edges from the anchor.
    Out,
    /// Incoming edges to the anchor.
    In,
    /// Edges in either direction.
    Both,
}

impl Default for EdgeDirection {
    fn default() -> Self {
        EdgeDirection::Both
    }
}

/// Edge pattern `(from)-[:TYPE]->(to)`.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeClause {
    /// Source variable.
    pub from: Var,
    /// Destination variable.
    pub to: Var,
    /// Relationship type.
    pub edge_type: String,
}

/// Predicates attached to a match group.
#[derive(Clone, Debug, PartialEq)]
pub enum PropPredicate {
    /// `var.prop = $param`
    Eq {
        /// Variable to test.
        var: Var,
        /// Property name.
        prop: String,
        /// Expected value.
        value: Value,
        /// Bound parameter name.
        param: String,
    },
    /// `var.prop IN $param`
    In {
        /// Variable to test.
        var: Var,
        /// Property name.
        prop: String,
        /// Accepted values.
        values: Vec<Value>,
        /// Bound parameter name.
        param: String,
    },
    /// `NOT (inner)`
    Not(Box<PropPredicate>),
    /// Interval test, optionally accepting nulls.
    Range {
        /// Variable to test.
        var: Var,
        /// Property name.
        prop: String,
        /// Lower bound.
        lower: Bound<Value>,
        /// Upper bound.
        upper: Bound<Value>,
        /// Parameter names of the lower and upper bound, when bounded.
        params: (Option<String>, Option<String>),
        /// When true a null property satisfies the predicate.
        include_null: bool,
    },
    /// `[NOT] EXISTS { MATCH (var)-[]-(x) WHERE ... }`
    Exists {
        /// Anchor variable.
        var: Var,
        /// Negated existence.
        negated: bool,
        /// Direction relative to the anchor.
        direction: EdgeDirection,
        /// Neighbour must carry one of these labels (any when empty).
        include: Vec<String>,
        /// Neighbour must carry none of these labels.
        exclude: Vec<String>,
    },
}

impl PropPredicate {
    /// Variable the predicate constrains.
    pub fn var(&self) -> &Var {
        match self {
            PropPredicate::Eq { var, .. }
            | PropPredicate::In { var, .. }
            | PropPredicate::Range { var, .. }
            | PropPredicate::Exists { var, .. } => var,
            PropPredicate::Not(inner) => inner.var(),
        }
    }

    /// Property the predicate reads, if it is a value predicate.
    pub fn prop(&self) -> Option<&str> {
        match self {
            PropPredicate::Eq { prop, .. }
            | PropPredicate::In { prop, .. }
            | PropPredicate::Range { prop, .. } => Some(prop),
            PropPredicate::Not(inner) => inner.prop(),
            PropPredicate::Exists { .. } => None,
        }
    }

    /// Three-valued evaluation of a value predicate against a property
    /// value (`Value::Null` when absent). `None` stands for SQL/Cypher null,
    /// which a WHERE clause treats as false. Existence predicates need the
    /// graph and always return `None` here.
    pub fn eval_value(&self, value: &Value) -> Option<bool> {
        match self {
            PropPredicate::Eq { value: expected, .. } => values_equal(value, expected),
            PropPredicate::In { values, .. } => {
                if value.is_null() {
                    return None;
                }
                let mut saw_null = false;
                for candidate in values {
                    match values_equal(value, candidate) {
                        Some(true) => return Some(true),
                        None => saw_null = true,
                        Some(false) => {}
                    }
                }
                if saw_null {
                    None
                } else {
                    Some(false)
                }
            }
            PropPredicate::Not(inner) => inner.eval_value(value).map(|b| !b),
            PropPredicate::Range {
                lower,
                upper,
                include_null,
                ..
            } => {
                if value.is_null() {
                    return Some(*include_null);
                }
                Some(within(value, lower, upper).unwrap_or(false))
            }
            PropPredicate::Exists { .. } => None,
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> Option<bool> {
    if left.is_null() || right.is_null() {
        return None;
    }
    Some(left.key() == right.key())
}

fn within(value: &Value, lower: &Bound<Value>, upper: &Bound<Value>) -> Option<bool> {
    let lower_ok = match lower {
        Bound::Unbounded => true,
        Bound::Included(min) => value.compare(min)?.is_ge(),
        Bound::Excluded(min) => value.compare(min)?.is_gt(),
    };
    let upper_ok = match upper {
        Bound::Unbounded => true,
        Bound::Included(max) => value.compare(max)?.is_le(),
        Bound::Excluded(max) => value.compare(max)?.is_lt(),
    };
    Some(lower_ok && upper_ok)
}

/// One MATCH or OPTIONAL MATCH clause with its WHERE predicates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchGroup {
    /// True for OPTIONAL MATCH.
    pub optional: bool,
    /// Nodes first bound by this clause.
    pub nodes: Vec<NodePattern>,
    /// Edge patterns of this clause.
    pub edges: Vec<EdgeClause>,
    /// Conjunctive predicates.
    pub predicates: Vec<PropPredicate>,
}

/// What an output column carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnSource {
    /// A property of the bound node.
    Property {
        /// Property name.
        prop: String,
    },
    /// The bound node's reference.
    NodeId,
}

/// One column of the result table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputColumn {
    /// Column name.
    pub name: String,
    /// Source variable.
    pub var: Var,
    /// Source of the value.
    pub source: ColumnSource,
}
