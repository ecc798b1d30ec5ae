//! Compiled query plans and their Cypher rendering.
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::ops::Bound;

use serde_json::{Map, Value as JsonValue};
use xxhash_rust::xxh64::Xxh64;

use super::ast::{ColumnSource, EdgeDirection, MatchGroup, OutputColumn, PropPredicate};
use crate::value::Value;

/// Output of the query builder.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    /// Parameterised Cypher text.
    pub text: String,
    /// Parameter bindings referenced by `text`.
    pub params: BTreeMap<String, Value>,
    /// Result columns in order.
    pub columns: Vec<OutputColumn>,
    /// Structured clauses equivalent to `text`.
    pub groups: Vec<MatchGroup>,
    /// Row limit applied after every clause.
    pub limit: Option<usize>,
    /// Deterministic hash of text and parameters.
    pub hash: u64,
}

impl QueryPlan {
    /// Plan that fetches nothing.
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            params: BTreeMap::new(),
            columns: Vec::new(),
            groups: Vec::new(),
            limit: None,
            hash: 0,
        }
    }

    /// True when no query should be executed.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Parameters as a JSON object, as sent to a Cypher endpoint.
    pub fn params_json(&self) -> Map<String, JsonValue> {
        self.params
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    pub(crate) fn assemble(
        groups: Vec<MatchGroup>,
        columns: Vec<OutputColumn>,
        params: BTreeMap<String, Value>,
        limit: Option<usize>,
    ) -> Self {
        let text = render(&groups, &columns, limit);
        let hash = plan_hash(&text, &params);
        Self {
            text,
            params,
            columns,
            groups,
            limit,
            hash,
        }
    }
}

fn plan_hash(text: &str, params: &BTreeMap<String, Value>) -> u64 {
    let mut hasher = Xxh64::new(0);
    hasher.write(text.as_bytes());
    for (name, value) in params {
        hasher.write(name.as_bytes());
        hasher.write(value.to_json().to_string().as_bytes());
    }
    hasher.finish()
}

/// Backtick-quotes an identifier.
pub fn quote(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn render(groups: &[MatchGroup], columns: &[OutputColumn], limit: Option<usize>) -> String {
    let mut lines = Vec::new();
    for group in groups {
        let mut patterns: Vec<String> = group
            .nodes
            .iter()
            .map(|n| format!("({}:{})", quote(n.var.as_str()), quote(&n.label)))
            .collect();
        patterns.extend(group.edges.iter().map(|e| {
            format!(
                "({})-[:{}]->({})",
                quote(e.from.as_str()),
                quote(&e.edge_type),
                quote(e.to.as_str())
            )
        }));
        let keyword = if group.optional { "OPTIONAL MATCH" } else { "MATCH" };
        lines.push(format!("{keyword} {}", patterns.join(", ")));
        let conditions: Vec<String> = group.predicates.iter().filter_map(render_predicate).collect();
        if !conditions.is_empty() {
            lines.push(format!("WHERE {}", conditions.join(" AND ")));
        }
    }
    let returns: Vec<String> = columns
        .iter()
        .map(|c| match &c.source {
            ColumnSource::Property { prop } => {
                format!("{}.{} AS {}", quote(c.var.as_str()), quote(prop), quote(&c.name))
            }
            ColumnSource::NodeId => format!("id({}) AS {}", quote(c.var.as_str()), quote(&c.name)),
        })
        .collect();
    lines.push(format!("RETURN {}", returns.join(", ")));
    if let Some(limit) = limit {
        lines.push(format!("LIMIT {limit}"));
    }
    lines.join("\n")
}

fn render_predicate(predicate: &PropPredicate) -> Option<String> {
    match predicate {
        PropPredicate::Eq {
            var, prop, param, ..
        } => Some(format!("{}.{} = ${param}", quote(var.as_str()), quote(prop))),
        PropPredicate::In {
            var, prop, param, ..
        } => Some(format!("{}.{} IN ${param}", quote(var.as_str()), quote(prop))),
        PropPredicate::Not(inner) => render_predicate(inner).map(|s| format!("NOT ({s})")),
        PropPredicate::Range {
            var,
            prop,
            lower,
            upper,
            params,
            include_null,
        } => {
            let target = format!("{}.{}", quote(var.as_str()), quote(prop));
            let mut interval = Vec::new();
            if let (Some(param), Some(op)) = (&params.0, lower_op(lower)) {
                interval.push(format!("${param} {op}"));
            }
            if !interval.is_empty() || !matches!(upper, Bound::Unbounded) {
                interval.push(target.clone());
            }
            if let (Some(param), Some(op)) = (&params.1, upper_op(upper)) {
                interval.push(format!("{op} ${param}"));
            }
            match (interval.is_empty(), include_null) {
                (true, true) => None,
                (true, false) => Some(format!("{target} IS NOT NULL")),
                (false, true) => Some(format!("({target} IS NULL OR ({}))", interval.join(" "))),
                (false, false) => Some(format!(
                    "({target} IS NOT NULL AND ({}))",
                    interval.join(" ")
                )),
            }
        }
        PropPredicate::Exists {
            var,
            negated,
            direction,
            include,
            exclude,
        } => {
            let (left, right) = match direction {
                EdgeDirection::Out => ("-", "->"),
                EdgeDirection::In => ("<-", "-"),
                EdgeDirection::Both => ("-", "-"),
            };
            let any_of = |labels: &[String]| {
                let alternatives: Vec<String> =
                    labels.iter().map(|l| format!("x:{}", quote(l))).collect();
                format!("({})", alternatives.join(" OR "))
            };
            let mut inner = Vec::new();
            if !include.is_empty() {
                inner.push(any_of(include));
            }
            if !exclude.is_empty() {
                inner.push(format!("NOT {}", any_of(exclude)));
            }
            let filter = if inner.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", inner.join(" AND "))
            };
            Some(format!(
                "{}EXISTS {{MATCH ({}){left}[]{right}(x){filter}}}",
                if *negated { "NOT " } else { "" },
                quote(var.as_str()),
            ))
        }
    }
}

fn lower_op(bound: &Bound<Value>) -> Option<&'static str> {
    match bound {
        Bound::Included(_) => Some("<="),
        Bound::Excluded(_) => Some("<"),
        Bound::Unbounded => None,
    }
}

fn upper_op(bound: &Bound<Value>) -> Option<&'static str> {
    lower_op(bound)
}
