//! Neo4j over its transactional HTTP endpoint.
//!
//! Every call is one auto-committed transaction against
//! `{url}/db/{database}/tx/commit`.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use super::{GraphStore, GraphWrite, Params, Statement, WriteReceipt};
use crate::error::{Error, ResolutionError, Result};
use crate::model::document::{EdgeRecord, MethodDocument, NodeRecord};
use crate::model::{edges, labels, Schema};
use crate::query::{quote, ColumnSource, QueryPlan};
use crate::table::Table;
use crate::value::{EdgeId, NodeId, Value};

/// Connection settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Neo4jSettings {
    /// Base URL, e.g. `http://localhost:7474`.
    pub url: String,
    /// Database name.
    pub database: String,
    /// Basic-auth user.
    pub user: Option<String>,
    /// Basic-auth password.
    pub password: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Graph store backed by a Neo4j server.
#[derive(Debug)]
pub struct Neo4jHttp {
    settings: Neo4jSettings,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    #[serde(default)]
    row: Vec<JsonValue>,
    #[serde(default)]
    graph: Option<TxGraph>,
}

#[derive(Debug, Default, Deserialize)]
struct TxGraph {
    #[serde(default)]
    nodes: Vec<TxNode>,
    #[serde(default)]
    relationships: Vec<TxRel>,
}

#[derive(Debug, Deserialize)]
struct TxNode {
    id: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    properties: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct TxRel {
    id: String,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(rename = "startNode")]
    start: String,
    #[serde(rename = "endNode")]
    end: String,
    #[serde(default)]
    properties: Map<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

impl Neo4jHttp {
    /// Builds the HTTP client.
    pub fn new(settings: Neo4jSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::store(format!("failed to build http client: {e}")))?;
        Ok(Self { settings, client })
    }

    /// Settings in use.
    pub fn settings(&self) -> &Neo4jSettings {
        &self.settings
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/db/{}/tx/commit",
            self.settings.url.trim_end_matches('/'),
            self.settings.database
        )
    }

    fn post(&self, statements: &[Statement], contents: &str) -> Result<Vec<TxResult>> {
        let body = json!({
            "statements": statements
                .iter()
                .map(|s| json!({
                    "statement": s.text,
                    "parameters": s.params,
                    "resultDataContents": [contents],
                }))
                .collect::<Vec<_>>(),
        });
        let mut request = self.client.post(self.endpoint()).json(&body);
        if let Some(user) = &self.settings.user {
            request = request.basic_auth(user, self.settings.password.as_deref());
        }
        let response = request
            .send()
            .map_err(|e| Error::store(format!("failed to reach {}: {e}", self.settings.url)))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(Error::store(format!("neo4j http error {status}: {text}")));
        }
        let parsed: TxResponse = response
            .json()
            .map_err(|e| Error::store(format!("malformed neo4j response: {e}")))?;
        if let Some(err) = parsed.errors.first() {
            return Err(Error::store(format!("{}: {}", err.code, err.message)));
        }
        Ok(parsed.results)
    }

    fn run_one(&self, statement: Statement) -> Result<TxResult> {
        debug!(statement = %statement.text, "store.neo4j.statement");
        self.post(std::slice::from_ref(&statement), "row")?
            .into_iter()
            .next()
            .ok_or_else(|| Error::store("neo4j returned no result"))
    }

    fn graph_document(&self, name: &str, statements: &[Statement]) -> Result<MethodDocument> {
        let mut nodes: BTreeMap<String, TxNode> = BTreeMap::new();
        let mut rels: BTreeMap<String, TxRel> = BTreeMap::new();
        for result in self.post(statements, "graph")? {
            for row in result.data {
                let graph = row.graph.unwrap_or_default();
                for node in graph.nodes {
                    nodes.entry(node.id.clone()).or_insert(node);
                }
                for rel in graph.relationships {
                    rels.entry(rel.id.clone()).or_insert(rel);
                }
            }
        }
        let record_ids: HashMap<String, String> = nodes
            .values()
            .map(|n| {
                let method_id = n
                    .labels
                    .iter()
                    .any(|l| l == labels::METHOD)
                    .then(|| n.properties.get("id").and_then(JsonValue::as_str))
                    .flatten();
                let record = method_id.map(str::to_owned).unwrap_or_else(|| format!("n{}", n.id));
                (n.id.clone(), record)
            })
            .collect();
        let record_of = |id: &str| record_ids.get(id).cloned().unwrap_or_else(|| format!("n{id}"));
        Ok(MethodDocument {
            name: name.to_owned(),
            relationships: rels
                .values()
                .filter(|r| record_ids.contains_key(&r.start) && record_ids.contains_key(&r.end))
                .map(|r| EdgeRecord {
                    id: format!("e{}", r.id),
                    from: record_of(&r.start),
                    to: record_of(&r.end),
                    edge_type: r.rel_type.clone(),
                    properties: r.properties.clone(),
                })
                .collect(),
            nodes: nodes
                .into_values()
                .map(|n| NodeRecord {
                    id: record_of(&n.id),
                    labels: n.labels,
                    properties: n.properties,
                })
                .collect(),
        })
    }
}

fn table_from_result(result: TxResult) -> Result<Table> {
    let mut table = Table::new(result.columns);
    for row in result.data {
        table.push_row(row.row.iter().map(Value::from_json).collect())?;
    }
    Ok(table)
}

fn column_ints(result: &TxResult, column: &str) -> Vec<Option<i64>> {
    let Some(idx) = result.columns.iter().position(|c| c == column) else {
        return Vec::new();
    };
    result
        .data
        .iter()
        .map(|row| row.row.get(idx).and_then(JsonValue::as_i64))
        .collect()
}

fn column_values(result: &TxResult, column: &str) -> Vec<Value> {
    let Some(idx) = result.columns.iter().position(|c| c == column) else {
        return Vec::new();
    };
    result
        .data
        .iter()
        .map(|row| row.row.get(idx).map(Value::from_json).unwrap_or(Value::Null))
        .collect()
}

impl GraphStore for Neo4jHttp {
    fn fetch(&self, plan: &QueryPlan) -> Result<Table> {
        let mut table = Table::new(plan.columns.iter().map(|c| c.name.clone()));
        if plan.is_empty() {
            return Ok(table);
        }
        let result = self.run_one(Statement {
            text: plan.text.clone(),
            params: plan.params_json(),
        })?;
        for row in &result.data {
            let values = plan
                .columns
                .iter()
                .enumerate()
                .map(|(idx, column)| {
                    let value = row.row.get(idx).map(Value::from_json).unwrap_or(Value::Null);
                    match (&column.source, value.as_node()) {
                        (ColumnSource::NodeId, Some(id)) => Value::NodeRef(id),
                        _ => value,
                    }
                })
                .collect();
            table.push_row(values)?;
        }
        debug!(hash = plan.hash, rows = table.len(), "store.neo4j.fetched");
        Ok(table)
    }

    fn run_cypher(&mut self, text: &str, params: &Params) -> Result<Table> {
        table_from_result(self.run_one(Statement {
            text: text.to_owned(),
            params: params.clone(),
        })?)
    }

    fn apply(&mut self, write: &GraphWrite) -> Result<WriteReceipt> {
        let mut receipt = WriteReceipt::default();
        if write.is_empty() {
            return Ok(receipt);
        }
        let result = self.run_one(write.to_statement())?;
        let ids = column_ints(&result, "id");
        let created: Vec<bool> = column_values(&result, "created")
            .iter()
            .map(|v| matches!(v, Value::Bool(true)))
            .collect();
        match write {
            GraphWrite::MergeNodes { .. } | GraphWrite::CreateNodes { .. } => {
                let positions = column_ints(&result, "i");
                let mut by_position: Vec<(i64, NodeId, bool)> = positions
                    .iter()
                    .zip(&ids)
                    .zip(&created)
                    .filter_map(|((i, id), c)| Some(((*i)?, NodeId((*id)? as u64), *c)))
                    .collect();
                by_position.sort_by_key(|(i, _, _)| *i);
                for (_, id, was_created) in by_position {
                    receipt.nodes.push(id);
                    if was_created {
                        receipt.created_nodes.push(id);
                    }
                }
            }
            GraphWrite::MergeEdges { .. } => {
                let positions = column_ints(&result, "i");
                let mut by_position: Vec<(i64, EdgeId, bool)> = positions
                    .iter()
                    .zip(&ids)
                    .zip(&created)
                    .filter_map(|((i, id), c)| Some(((*i)?, EdgeId((*id)? as u64), *c)))
                    .collect();
                by_position.sort_by_key(|(i, _, _)| *i);
                for (_, id, was_created) in by_position {
                    receipt.edges.push(id);
                    if was_created {
                        receipt.created_edges.push(id);
                    }
                }
            }
            GraphWrite::AddLabel { .. } => {
                for (id, was_added) in ids.iter().zip(&created) {
                    if let Some(id) = id {
                        receipt.nodes.push(NodeId(*id as u64));
                        if *was_added {
                            receipt.labelled.push(NodeId(*id as u64));
                        }
                    }
                }
            }
            GraphWrite::SetProperty { .. } => {
                for (id, previous) in ids.iter().zip(column_values(&result, "previous")) {
                    if let Some(id) = id {
                        receipt.nodes.push(NodeId(*id as u64));
                        receipt.previous.push((NodeId(*id as u64), previous));
                    }
                }
            }
            _ => {}
        }
        debug!(op = write.op(), items = write.len(), "store.neo4j.write");
        Ok(receipt)
    }

    fn load_method(&self, root_id: &str) -> Result<MethodDocument> {
        let mut params = Params::new();
        params.insert("id".into(), JsonValue::String(root_id.to_owned()));
        let statement = Statement {
            text: format!(
                "MATCH (root:{method} {{id: $id}})-[:{action}*0..]->(m:{method}) \
                 OPTIONAL MATCH p1 = (m)-[]->(x) \
                 OPTIONAL MATCH p2 = (x)-[:{from}|{to}|{terms}]->(y) \
                 OPTIONAL MATCH p3 = (y)-[:{terms}]->(z) \
                 RETURN m, p1, p2, p3",
                method = quote(labels::METHOD),
                action = quote(edges::METHOD_ACTION),
                from = quote(edges::FROM),
                to = quote(edges::TO),
                terms = quote(edges::HAS_CONTROLLED_TERM),
            ),
            params,
        };
        let doc = self.graph_document(root_id, &[statement])?;
        if doc.root().is_none() {
            return Err(ResolutionError::MethodNotFound {
                id: root_id.to_owned(),
            }
            .into());
        }
        Ok(doc)
    }

    fn load_schema(&self) -> Result<Schema> {
        let statements = [
            Statement {
                text: format!(
                    "MATCH (c:{class}) OPTIONAL MATCH p = (c)-[:{terms}]->(:{term}) RETURN c, p",
                    class = quote(labels::CLASS),
                    terms = quote(edges::HAS_CONTROLLED_TERM),
                    term = quote(labels::TERM),
                ),
                params: Params::new(),
            },
            Statement {
                text: format!(
                    "MATCH p = (:{rel})-[:{from}|{to}]->(:{class}) RETURN p",
                    rel = quote(labels::RELATIONSHIP),
                    from = quote(edges::FROM),
                    to = quote(edges::TO),
                    class = quote(labels::CLASS),
                ),
                params: Params::new(),
            },
            Statement {
                text: format!(
                    "MATCH p = (:{term})-[:{same}]->(:{term}) RETURN p",
                    term = quote(labels::TERM),
                    same = quote(edges::SAME_AS),
                ),
                params: Params::new(),
            },
        ];
        Ok(Schema::from_document(&self.graph_document("", &statements)?))
    }

    fn import_method(&mut self, doc: &MethodDocument) -> Result<()> {
        let nodes: Vec<JsonValue> = doc
            .nodes
            .iter()
            .map(|n| json!({"key": n.id, "labels": n.labels, "props": n.properties}))
            .collect();
        let rels: Vec<JsonValue> = doc
            .relationships
            .iter()
            .map(|r| json!({"from": r.from, "to": r.to, "type": r.edge_type, "props": r.properties}))
            .collect();
        let mut params = Params::new();
        params.insert("nodes".into(), JsonValue::Array(nodes));
        params.insert("rels".into(), JsonValue::Array(rels));
        // Requires APOC for dynamic labels and relationship types.
        let statement = Statement {
            text: "UNWIND $nodes AS node \
                   CALL apoc.merge.node(node.labels, \
                     CASE WHEN 'Method' IN node.labels THEN {id: node.props.id} \
                          WHEN 'Class' IN node.labels THEN {label: node.props.label} \
                          ELSE {__import_key: node.key} END, \
                     node.props) YIELD node AS n \
                   WITH collect({key: node.key, n: n}) AS imported \
                   UNWIND $rels AS rel \
                   WITH rel, [x IN imported WHERE x.key = rel.from][0].n AS a, \
                        [x IN imported WHERE x.key = rel.to][0].n AS b \
                   CALL apoc.merge.relationship(a, rel.type, {}, rel.props, b, {}) YIELD rel AS r \
                   RETURN count(r) AS linked"
                .to_owned(),
            params,
        };
        self.run_one(statement)?;
        debug!(document = %doc.name, nodes = doc.nodes.len(), "store.neo4j.imported");
        Ok(())
    }
}
