//! In-process property graph.
//!
//! Evaluates compiled plans natively with Cypher null semantics: a mandatory
//! clause drops rows it cannot satisfy, an optional clause binds its new
//! variables to null instead. Literal statements are served by handlers
//! registered per statement text.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use super::{GraphStore, GraphWrite, Params, WriteReceipt};
use crate::error::{Error, ResolutionError, Result};
use crate::model::document::{EdgeRecord, MethodDocument, NodeRecord};
use crate::model::schema::class_from_record;
use crate::model::{edges, labels, Schema, VALUE_PROPERTY};
use crate::query::{ColumnSource, EdgeDirection, MatchGroup, PropPredicate, QueryPlan};
use crate::table::{Record, Table};
use crate::value::{EdgeId, NodeId, Value};

/// Handler answering one literal statement.
pub type CypherHandler = Box<dyn Fn(&Params) -> Result<Table> + Send + Sync>;

/// Node stored by [`MemoryGraph`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemoryNode {
    /// Labels.
    pub labels: BTreeSet<String>,
    /// Properties.
    pub props: BTreeMap<String, Value>,
}

impl MemoryNode {
    /// Property value, null when absent.
    pub fn prop(&self, key: &str) -> Value {
        self.props.get(key).cloned().unwrap_or(Value::Null)
    }
}

#[derive(Clone, Debug, PartialEq)]
struct MemoryEdge {
    from: NodeId,
    to: NodeId,
    edge_type: String,
    props: BTreeMap<String, Value>,
}

type Binding = HashMap<String, Option<NodeId>>;

/// Property graph held in memory.
#[derive(Default)]
pub struct MemoryGraph {
    nodes: BTreeMap<NodeId, MemoryNode>,
    edges: BTreeMap<EdgeId, MemoryEdge>,
    next_node: u64,
    next_edge: u64,
    handlers: Vec<(String, CypherHandler)>,
    statements: Vec<String>,
}

impl fmt::Debug for MemoryGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGraph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl MemoryGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node.
    pub fn add_node<'a>(
        &mut self,
        node_labels: &[&str],
        props: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.nodes.insert(
            id,
            MemoryNode {
                labels: node_labels.iter().map(|l| (*l).to_owned()).collect(),
                props: props
                    .into_iter()
                    .filter(|(_, v)| !v.is_null())
                    .map(|(k, v)| (k.to_owned(), v))
                    .collect(),
            },
        );
        id
    }

    /// Inserts an edge.
    pub fn add_edge(&mut self, from: NodeId, edge_type: &str, to: NodeId) -> EdgeId {
        let id = EdgeId(self.next_edge);
        self.next_edge += 1;
        self.edges.insert(
            id,
            MemoryEdge {
                from,
                to,
                edge_type: edge_type.to_owned(),
                props: BTreeMap::new(),
            },
        );
        id
    }

    /// Registers the answer to a literal statement.
    pub fn on_cypher<F>(&mut self, text: &str, handler: F)
    where
        F: Fn(&Params) -> Result<Table> + Send + Sync + 'static,
    {
        self.handlers.push((text.trim().to_owned(), Box::new(handler)));
    }

    /// Statements executed through [`GraphStore::run_cypher`], in order.
    pub fn executed(&self) -> &[String] {
        &self.statements
    }

    /// Node by id.
    pub fn node(&self, id: NodeId) -> Option<&MemoryNode> {
        self.nodes.get(&id)
    }

    /// Ids of nodes carrying `label`, in creation order.
    pub fn nodes_with_label(&self, label: &str) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.labels.contains(label))
            .map(|(id, _)| *id)
            .collect()
    }

    /// First `label` node whose `prop` equals `value`.
    pub fn find_node(&self, label: &str, prop: &str, value: &Value) -> Option<NodeId> {
        let key = value.key();
        self.nodes
            .iter()
            .find(|(_, n)| n.labels.contains(label) && n.prop(prop).key() == key)
            .map(|(id, _)| *id)
    }

    /// `(from, to)` pairs of every `edge_type` edge.
    pub fn edges_of_type(&self, edge_type: &str) -> Vec<(NodeId, NodeId)> {
        self.edges
            .values()
            .filter(|e| e.edge_type == edge_type)
            .map(|e| (e.from, e.to))
            .collect()
    }

    /// True when `from -[edge_type]-> to` exists.
    pub fn has_edge(&self, from: NodeId, edge_type: &str, to: NodeId) -> bool {
        self.find_edge(from, edge_type, to).is_some()
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    fn find_edge(&self, from: NodeId, edge_type: &str, to: NodeId) -> Option<EdgeId> {
        self.edges
            .iter()
            .find(|(_, e)| e.from == from && e.to == to && e.edge_type == edge_type)
            .map(|(id, _)| *id)
    }

    fn prop(&self, id: NodeId, key: &str) -> Value {
        self.nodes
            .get(&id)
            .map(|n| n.prop(key))
            .unwrap_or(Value::Null)
    }

    fn has_label(&self, id: NodeId, label: &str) -> bool {
        self.nodes
            .get(&id)
            .map_or(false, |n| n.labels.contains(label))
    }

    fn neighbours(&self, id: NodeId, direction: EdgeDirection) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.values().filter_map(move |e| match direction {
            EdgeDirection::Out if e.from == id => Some(e.to),
            EdgeDirection::In if e.to == id => Some(e.from),
            EdgeDirection::Both if e.from == id => Some(e.to),
            EdgeDirection::Both if e.to == id => Some(e.from),
            _ => None,
        })
    }

    fn predicate_holds(&self, predicate: &PropPredicate, binding: &Binding) -> bool {
        let node = binding.get(predicate.var().as_str()).copied().flatten();
        match predicate {
            PropPredicate::Exists {
                negated,
                direction,
                include,
                exclude,
                ..
            } => {
                let Some(id) = node else {
                    return false;
                };
                let found = self.neighbours(id, *direction).any(|n| {
                    (include.is_empty() || include.iter().any(|l| self.has_label(n, l)))
                        && !exclude.iter().any(|l| self.has_label(n, l))
                });
                found != *negated
            }
            _ => {
                let value = match (node, predicate.prop()) {
                    (Some(id), Some(prop)) => self.prop(id, prop),
                    _ => Value::Null,
                };
                predicate.eval_value(&value) == Some(true)
            }
        }
    }

    fn group_holds(&self, group: &MatchGroup, binding: &Binding) -> bool {
        let bound = |var: &str| binding.get(var).copied().flatten();
        group.edges.iter().all(|edge| {
            match (bound(edge.from.as_str()), bound(edge.to.as_str())) {
                (Some(a), Some(b)) => self.find_edge(a, &edge.edge_type, b).is_some(),
                _ => false,
            }
        }) && group
            .predicates
            .iter()
            .all(|p| self.predicate_holds(p, binding))
    }

    fn assign(&self, group: &MatchGroup, idx: usize, current: &mut Binding, out: &mut Vec<Binding>) {
        let Some(pattern) = group.nodes.get(idx) else {
            if self.group_holds(group, current) {
                out.push(current.clone());
            }
            return;
        };
        let var = pattern.var.as_str();
        if let Some(bound) = current.get(var).copied() {
            if bound.map_or(false, |id| self.has_label(id, &pattern.label)) {
                self.assign(group, idx + 1, current, out);
            }
            return;
        }
        for (&id, node) in &self.nodes {
            if !node.labels.contains(&pattern.label) {
                continue;
            }
            current.insert(var.to_owned(), Some(id));
            let local_ok = group
                .predicates
                .iter()
                .filter(|p| p.var().as_str() == var)
                .all(|p| self.predicate_holds(p, current));
            if local_ok {
                self.assign(group, idx + 1, current, out);
            }
            current.remove(var);
        }
    }

    fn write_nodes(&mut self, label: &str, key: Option<&str>, rows: &[Record]) -> WriteReceipt {
        let mut receipt = WriteReceipt::default();
        for row in rows {
            let existing = key.and_then(|key| {
                let value = row.get(key).cloned().unwrap_or(Value::Null);
                self.find_node(label, key, &value)
            });
            let id = match existing {
                Some(id) => id,
                None => {
                    let id = self.add_node(&[label], row.iter().map(|(k, v)| (k.as_str(), v.clone())));
                    receipt.created_nodes.push(id);
                    id
                }
            };
            receipt.nodes.push(id);
        }
        receipt
    }

    fn closure_of(&self, root: NodeId) -> BTreeSet<NodeId> {
        let mut keep = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let is = |label: &str| node.labels.contains(label);
            for edge in self.edges.values() {
                let next = if edge.from == id {
                    let follow = is(labels::METHOD)
                        || (is(labels::RELATIONSHIP)
                            && (edge.edge_type == edges::FROM || edge.edge_type == edges::TO))
                        || (is(labels::CLASS) && edge.edge_type == edges::HAS_CONTROLLED_TERM)
                        || (is(labels::TERM) && edge.edge_type == edges::SAME_AS);
                    follow.then_some(edge.to)
                } else if edge.to == id && is(labels::TERM) {
                    let follow =
                        edge.edge_type == edges::SAME_AS || edge.edge_type == edges::HAS_CONTROLLED_TERM;
                    follow.then_some(edge.from)
                } else {
                    None
                };
                if let Some(next) = next {
                    if keep.insert(next) {
                        queue.push_back(next);
                    }
                }
            }
        }
        keep
    }

    fn record_id(&self, id: NodeId) -> String {
        match self.nodes.get(&id) {
            Some(node) if node.labels.contains(labels::METHOD) => match node.props.get("id") {
                Some(Value::String(method_id)) => method_id.clone(),
                _ => id.to_string(),
            },
            _ => id.to_string(),
        }
    }

    fn snapshot(&self, name: &str, keep: &BTreeSet<NodeId>) -> MethodDocument {
        let json_props = |props: &BTreeMap<String, Value>| -> Map<String, JsonValue> {
            props.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()
        };
        let nodes = keep
            .iter()
            .filter_map(|id| {
                let node = self.nodes.get(id)?;
                Some(NodeRecord {
                    id: self.record_id(*id),
                    labels: node.labels.iter().cloned().collect(),
                    properties: json_props(&node.props),
                })
            })
            .collect();
        let relationships = self
            .edges
            .iter()
            .filter(|(_, e)| keep.contains(&e.from) && keep.contains(&e.to))
            .map(|(id, e)| EdgeRecord {
                id: id.to_string(),
                from: self.record_id(e.from),
                to: self.record_id(e.to),
                edge_type: e.edge_type.clone(),
                properties: json_props(&e.props),
            })
            .collect();
        MethodDocument {
            name: name.to_owned(),
            nodes,
            relationships,
        }
    }

    fn find_method(&self, method_id: &str) -> Option<NodeId> {
        self.find_node(labels::METHOD, "id", &Value::from(method_id))
    }

    fn existing_term(&self, class: NodeId, label: &str) -> Option<NodeId> {
        self.edges
            .values()
            .filter(|e| e.from == class && e.edge_type == edges::HAS_CONTROLLED_TERM)
            .map(|e| e.to)
            .find(|t| self.prop(*t, VALUE_PROPERTY).as_str() == Some(label))
    }

    fn existing_relationship(&self, rel_type: &Value, from: NodeId, to: NodeId) -> Option<NodeId> {
        self.nodes_with_label(labels::RELATIONSHIP).into_iter().find(|r| {
            self.prop(*r, "relationship_type").key() == rel_type.key()
                && self.has_edge(*r, edges::FROM, from)
                && self.has_edge(*r, edges::TO, to)
        })
    }
}

fn props_of(record: &NodeRecord) -> Vec<(&str, Value)> {
    record
        .properties
        .iter()
        .map(|(k, v)| (k.as_str(), Value::from_json(v)))
        .collect()
}

impl GraphStore for MemoryGraph {
    fn fetch(&self, plan: &QueryPlan) -> Result<Table> {
        let mut table = Table::new(plan.columns.iter().map(|c| c.name.clone()));
        if plan.is_empty() {
            return Ok(table);
        }
        let mut bindings: Vec<Binding> = vec![Binding::new()];
        for group in &plan.groups {
            let mut next = Vec::with_capacity(bindings.len());
            for binding in &bindings {
                let mut matches = Vec::new();
                let mut current = binding.clone();
                self.assign(group, 0, &mut current, &mut matches);
                if matches.is_empty() && group.optional {
                    let mut padded = binding.clone();
                    for pattern in &group.nodes {
                        padded.entry(pattern.var.0.clone()).or_insert(None);
                    }
                    next.push(padded);
                } else {
                    next.extend(matches);
                }
            }
            bindings = next;
        }
        if let Some(limit) = plan.limit {
            bindings.truncate(limit);
        }
        for binding in &bindings {
            let row = plan
                .columns
                .iter()
                .map(|column| {
                    match (&column.source, binding.get(column.var.as_str()).copied().flatten()) {
                        (_, None) => Value::Null,
                        (ColumnSource::NodeId, Some(id)) => Value::NodeRef(id),
                        (ColumnSource::Property { prop }, Some(id)) => self.prop(id, prop),
                    }
                })
                .collect();
            table.push_row(row)?;
        }
        debug!(hash = plan.hash, rows = table.len(), "store.memory.fetched");
        Ok(table)
    }

    fn run_cypher(&mut self, text: &str, params: &Params) -> Result<Table> {
        let text = text.trim();
        self.statements.push(text.to_owned());
        let handler = self
            .handlers
            .iter()
            .find(|(known, _)| known == text)
            .map(|(_, handler)| handler)
            .ok_or_else(|| Error::store(format!("no handler registered for statement: {text}")))?;
        handler(params)
    }

    fn apply(&mut self, write: &GraphWrite) -> Result<WriteReceipt> {
        let mut receipt = WriteReceipt::default();
        match write {
            GraphWrite::MergeNodes { label, key, rows } => {
                receipt = self.write_nodes(label, Some(key), rows);
            }
            GraphWrite::CreateNodes { label, rows } => {
                receipt = self.write_nodes(label, None, rows);
            }
            GraphWrite::MergeEdges { edge_type, pairs } => {
                for &(from, to) in pairs {
                    if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
                        return Err(Error::store(format!(
                            "cannot link {from} -[{edge_type}]-> {to}: unknown node"
                        )));
                    }
                    let id = match self.find_edge(from, edge_type, to) {
                        Some(id) => id,
                        None => {
                            let id = self.add_edge(from, edge_type, to);
                            receipt.created_edges.push(id);
                            id
                        }
                    };
                    receipt.edges.push(id);
                }
            }
            GraphWrite::AddLabel { label, nodes } => {
                for id in nodes {
                    let node = self
                        .nodes
                        .get_mut(id)
                        .ok_or_else(|| Error::store(format!("cannot label unknown node {id}")))?;
                    if node.labels.insert(label.clone()) {
                        receipt.labelled.push(*id);
                    }
                    receipt.nodes.push(*id);
                }
            }
            GraphWrite::RemoveLabel { label, nodes } => {
                for id in nodes {
                    if let Some(node) = self.nodes.get_mut(id) {
                        node.labels.remove(label);
                    }
                }
            }
            GraphWrite::SetProperty { prop, assignments } => {
                for (id, value) in assignments {
                    let node = self
                        .nodes
                        .get_mut(id)
                        .ok_or_else(|| Error::store(format!("cannot update unknown node {id}")))?;
                    let previous = if value.is_null() {
                        node.props.remove(prop)
                    } else {
                        node.props.insert(prop.clone(), value.clone())
                    };
                    receipt.previous.push((*id, previous.unwrap_or(Value::Null)));
                    receipt.nodes.push(*id);
                }
            }
            GraphWrite::ClearSentinel {
                prop,
                sentinel,
                nodes,
            } => {
                let key = sentinel.key();
                for id in nodes {
                    if let Some(node) = self.nodes.get_mut(id) {
                        if node.props.get(prop).map(Value::key).as_ref() == Some(&key) {
                            node.props.remove(prop);
                        }
                    }
                }
            }
            GraphWrite::DeleteEdges { edges: ids } => {
                for id in ids {
                    self.edges.remove(id);
                }
            }
            GraphWrite::DeleteNodes { nodes } => {
                for id in nodes {
                    if self.nodes.remove(id).is_some() {
                        self.edges.retain(|_, e| e.from != *id && e.to != *id);
                    }
                }
            }
        }
        debug!(
            op = write.op(),
            items = write.len(),
            created_nodes = receipt.created_nodes.len(),
            created_edges = receipt.created_edges.len(),
            "store.memory.write"
        );
        Ok(receipt)
    }

    fn load_method(&self, root_id: &str) -> Result<MethodDocument> {
        let root = self
            .find_method(root_id)
            .ok_or_else(|| ResolutionError::MethodNotFound {
                id: root_id.to_owned(),
            })?;
        Ok(self.snapshot(root_id, &self.closure_of(root)))
    }

    fn load_schema(&self) -> Result<Schema> {
        let keep: BTreeSet<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, n)| {
                n.labels.contains(labels::CLASS)
                    || n.labels.contains(labels::RELATIONSHIP)
                    || n.labels.contains(labels::TERM)
            })
            .map(|(id, _)| *id)
            .collect();
        Ok(Schema::from_document(&self.snapshot("", &keep)))
    }

    fn import_method(&mut self, doc: &MethodDocument) -> Result<()> {
        let mut mapped: HashMap<&str, NodeId> = HashMap::new();
        for record in doc.methods() {
            if self.find_method(&record.id).is_some() {
                return Err(ResolutionError::DuplicateId {
                    id: record.id.clone(),
                }
                .into());
            }
        }
        for record in &doc.nodes {
            if let Some(class) = class_from_record(record) {
                let existing = self.nodes_with_label(labels::CLASS).into_iter().find(|id| {
                    let node = &self.nodes[id];
                    node.prop("label").as_str() == Some(class.label.as_str())
                        || node.prop(VALUE_PROPERTY).as_str() == Some(class.label.as_str())
                });
                let labels_of: Vec<&str> = record.labels.iter().map(String::as_str).collect();
                let id = existing.unwrap_or_else(|| self.add_node(&labels_of, props_of(record)));
                mapped.insert(&record.id, id);
            }
        }
        for record in doc.nodes.iter().filter(|n| n.has_label(labels::TERM)) {
            let owner = doc
                .incoming(&record.id, edges::HAS_CONTROLLED_TERM)
                .find_map(|(_, class)| mapped.get(class.id.as_str()).copied());
            let existing = match (owner, record.prop_str(VALUE_PROPERTY)) {
                (Some(class), Some(label)) => self.existing_term(class, label),
                _ => None,
            };
            let labels_of: Vec<&str> = record.labels.iter().map(String::as_str).collect();
            let id = existing.unwrap_or_else(|| self.add_node(&labels_of, props_of(record)));
            mapped.insert(&record.id, id);
        }
        for record in doc.nodes.iter().filter(|n| n.has_label(labels::RELATIONSHIP)) {
            let endpoint = |edge_type: &str| {
                doc.outgoing(&record.id, edge_type)
                    .find_map(|(_, class)| mapped.get(class.id.as_str()).copied())
            };
            let rel_type = record
                .properties
                .get("relationship_type")
                .map(Value::from_json)
                .unwrap_or(Value::Null);
            let existing = match (endpoint(edges::FROM), endpoint(edges::TO)) {
                (Some(from), Some(to)) => self.existing_relationship(&rel_type, from, to),
                _ => None,
            };
            let labels_of: Vec<&str> = record.labels.iter().map(String::as_str).collect();
            let id = existing.unwrap_or_else(|| self.add_node(&labels_of, props_of(record)));
            mapped.insert(&record.id, id);
        }
        for record in &doc.nodes {
            if mapped.contains_key(record.id.as_str()) {
                continue;
            }
            let labels_of: Vec<&str> = record.labels.iter().map(String::as_str).collect();
            let id = self.add_node(&labels_of, props_of(record));
            mapped.insert(&record.id, id);
        }
        for edge in &doc.relationships {
            let (Some(&from), Some(&to)) = (mapped.get(edge.from.as_str()), mapped.get(edge.to.as_str())) else {
                return Err(ResolutionError::DanglingEdge {
                    edge_type: edge.edge_type.clone(),
                    node: edge.from.clone(),
                }
                .into());
            };
            let id = match self.find_edge(from, &edge.edge_type, to) {
                Some(id) => id,
                None => self.add_edge(from, &edge.edge_type, to),
            };
            if let Some(stored) = self.edges.get_mut(&id) {
                stored.props.extend(
                    edge.properties
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v))),
                );
            }
        }
        debug!(
            document = %doc.name,
            nodes = doc.nodes.len(),
            edges = doc.relationships.len(),
            "store.memory.imported"
        );
        Ok(())
    }
}
