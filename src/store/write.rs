//! Typed graph mutations and their receipts.
//!
//! Every side effect an action has on the graph goes through one of these
//! variants, so compensations can be expressed in the same vocabulary and
//! persisted alongside the run.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use crate::query::quote;
use crate::table::Record;
use crate::value::{EdgeId, NodeId, Value};

/// Closed set of graph mutations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphWrite {
    /// Finds or creates one `label` node per row keyed on `rows[i][key]`;
    /// the remaining properties are set only on creation.
    MergeNodes {
        label: String,
        key: String,
        rows: Vec<Record>,
    },
    /// Creates one `label` node per row.
    CreateNodes { label: String, rows: Vec<Record> },
    /// Finds or creates one `edge_type` edge per pair.
    MergeEdges {
        edge_type: String,
        pairs: Vec<(NodeId, NodeId)>,
    },
    /// Adds `label` to the nodes.
    AddLabel { label: String, nodes: Vec<NodeId> },
    /// Removes `label` from the nodes.
    RemoveLabel { label: String, nodes: Vec<NodeId> },
    /// Sets `prop` per node; `Value::Null` removes it.
    SetProperty {
        prop: String,
        assignments: Vec<(NodeId, Value)>,
    },
    /// Removes `prop` from the nodes where it equals `sentinel`.
    ClearSentinel {
        prop: String,
        sentinel: Value,
        nodes: Vec<NodeId>,
    },
    /// Deletes edges; unknown ids are ignored.
    DeleteEdges { edges: Vec<EdgeId> },
    /// Deletes nodes together with their edges; unknown ids are ignored.
    DeleteNodes { nodes: Vec<NodeId> },
}

/// What a write did.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteReceipt {
    /// Node per input row (merges and creates).
    pub nodes: Vec<NodeId>,
    /// Edge per input pair.
    pub edges: Vec<EdgeId>,
    /// Nodes that did not exist before the write.
    pub created_nodes: Vec<NodeId>,
    /// Edges that did not exist before the write.
    pub created_edges: Vec<EdgeId>,
    /// Nodes that gained the label (AddLabel).
    pub labelled: Vec<NodeId>,
    /// Previous values (SetProperty).
    pub previous: Vec<(NodeId, Value)>,
}

/// Parameterised statement for a Cypher endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// Statement text.
    pub text: String,
    /// Parameters.
    pub params: Map<String, JsonValue>,
}

impl GraphWrite {
    /// Short operation name for logs.
    pub fn op(&self) -> &'static str {
        match self {
            GraphWrite::MergeNodes { .. } => "merge_nodes",
            GraphWrite::CreateNodes { .. } => "create_nodes",
            GraphWrite::MergeEdges { .. } => "merge_edges",
            GraphWrite::AddLabel { .. } => "add_label",
            GraphWrite::RemoveLabel { .. } => "remove_label",
            GraphWrite::SetProperty { .. } => "set_property",
            GraphWrite::ClearSentinel { .. } => "clear_sentinel",
            GraphWrite::DeleteEdges { .. } => "delete_edges",
            GraphWrite::DeleteNodes { .. } => "delete_nodes",
        }
    }

    /// Number of items the write touches.
    pub fn len(&self) -> usize {
        match self {
            GraphWrite::MergeNodes { rows, .. } | GraphWrite::CreateNodes { rows, .. } => rows.len(),
            GraphWrite::MergeEdges { pairs, .. } => pairs.len(),
            GraphWrite::AddLabel { nodes, .. }
            | GraphWrite::RemoveLabel { nodes, .. }
            | GraphWrite::ClearSentinel { nodes, .. }
            | GraphWrite::DeleteNodes { nodes } => nodes.len(),
            GraphWrite::SetProperty { assignments, .. } => assignments.len(),
            GraphWrite::DeleteEdges { edges } => edges.len(),
        }
    }

    /// True when the write touches nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cypher rendering. Statements that report per-item results return
    /// `i` (input position), `id` and, for merges, `created`.
    pub fn to_statement(&self) -> Statement {
        let mut params = Map::new();
        let text = match self {
            GraphWrite::MergeNodes { label, key, rows } => {
                params.insert("rows".into(), indexed_rows(rows));
                format!(
                    "UNWIND $rows AS row \
                     MERGE (n:{label} {{{key}: row.props[{key_str}]}}) \
                     ON CREATE SET n += row.props, n.__created = true \
                     WITH n, row, coalesce(n.__created, false) AS created \
                     REMOVE n.__created \
                     RETURN row.i AS i, id(n) AS id, created",
                    label = quote(label),
                    key = quote(key),
                    key_str = JsonValue::String(key.clone()),
                )
            }
            GraphWrite::CreateNodes { label, rows } => {
                params.insert("rows".into(), indexed_rows(rows));
                format!(
                    "UNWIND $rows AS row CREATE (n:{}) SET n = row.props \
                     RETURN row.i AS i, id(n) AS id, true AS created",
                    quote(label)
                )
            }
            GraphWrite::MergeEdges { edge_type, pairs } => {
                let pairs: Vec<JsonValue> = pairs
                    .iter()
                    .enumerate()
                    .map(|(i, (from, to))| json!({"i": i, "from": from.0, "to": to.0}))
                    .collect();
                params.insert("pairs".into(), JsonValue::Array(pairs));
                format!(
                    "UNWIND $pairs AS p \
                     MATCH (a) WHERE id(a) = p.from \
                     MATCH (b) WHERE id(b) = p.to \
                     MERGE (a)-[r:{}]->(b) \
                     ON CREATE SET r.__created = true \
                     WITH r, p, coalesce(r.__created, false) AS created \
                     REMOVE r.__created \
                     RETURN p.i AS i, id(r) AS id, created",
                    quote(edge_type)
                )
            }
            GraphWrite::AddLabel { label, nodes } => {
                params.insert("ids".into(), node_ids(nodes));
                format!(
                    "UNWIND $ids AS nid MATCH (n) WHERE id(n) = nid \
                     WITH n, NOT n:{label} AS created SET n:{label} \
                     RETURN id(n) AS id, created",
                    label = quote(label)
                )
            }
            GraphWrite::RemoveLabel { label, nodes } => {
                params.insert("ids".into(), node_ids(nodes));
                format!("MATCH (n) WHERE id(n) IN $ids REMOVE n:{}", quote(label))
            }
            GraphWrite::SetProperty { prop, assignments } => {
                let rows: Vec<JsonValue> = assignments
                    .iter()
                    .map(|(id, value)| json!({"id": id.0, "value": value.to_json()}))
                    .collect();
                params.insert("rows".into(), JsonValue::Array(rows));
                format!(
                    "UNWIND $rows AS row MATCH (n) WHERE id(n) = row.id \
                     WITH n, row, n.{prop} AS previous SET n.{prop} = row.value \
                     RETURN id(n) AS id, previous",
                    prop = quote(prop)
                )
            }
            GraphWrite::ClearSentinel {
                prop,
                sentinel,
                nodes,
            } => {
                params.insert("ids".into(), node_ids(nodes));
                params.insert("sentinel".into(), sentinel.to_json());
                format!(
                    "MATCH (n) WHERE id(n) IN $ids AND n.{prop} = $sentinel SET n.{prop} = null",
                    prop = quote(prop)
                )
            }
            GraphWrite::DeleteEdges { edges } => {
                let ids: Vec<JsonValue> = edges.iter().map(|e| e.0.into()).collect();
                params.insert("ids".into(), JsonValue::Array(ids));
                "MATCH ()-[r]->() WHERE id(r) IN $ids DELETE r".to_owned()
            }
            GraphWrite::DeleteNodes { nodes } => {
                params.insert("ids".into(), node_ids(nodes));
                "MATCH (n) WHERE id(n) IN $ids DETACH DELETE n".to_owned()
            }
        };
        Statement { text, params }
    }
}

fn indexed_rows(rows: &[Record]) -> JsonValue {
    JsonValue::Array(
        rows.iter()
            .enumerate()
            .map(|(i, row)| {
                let props: Map<String, JsonValue> = row
                    .iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect();
                json!({"i": i, "props": props})
            })
            .collect(),
    )
}

fn node_ids(nodes: &[NodeId]) -> JsonValue {
    JsonValue::Array(nodes.iter().map(|n| n.0.into()).collect())
}
