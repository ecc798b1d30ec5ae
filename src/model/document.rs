//! Self-contained method definition documents.
//!
//! A document is a list of node records and relationship records in the
//! familiar `{nodes, relationships}` JSON layout. Method nodes use their
//! method id as record id; every other record id is a document-local key.
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use super::{edges, labels};
use crate::error::{Result, ResolutionError};

/// One node of a method document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Record id. For Method nodes this is the method id.
    pub id: String,
    /// Node labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Node properties.
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
}

impl NodeRecord {
    /// Node with labels and no properties.
    pub fn new(id: impl Into<String>, labels: &[&str]) -> Self {
        Self {
            id: id.into(),
            labels: labels.iter().map(|l| (*l).to_owned()).collect(),
            properties: Map::new(),
        }
    }

    /// True when the node carries `label`.
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// True for Method nodes.
    pub fn is_method(&self) -> bool {
        self.has_label(labels::METHOD)
    }

    /// String property.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(JsonValue::as_str)
    }

    /// Boolean property; accepts `"true"`/`"false"` strings as written by
    /// diagram editors.
    pub fn prop_bool(&self, key: &str) -> Option<bool> {
        json_bool(self.properties.get(key)?)
    }

    /// The `type` property of a Method node.
    pub fn method_type(&self) -> Option<&str> {
        self.prop_str("type")
    }
}

/// One relationship of a method document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Optional record id.
    #[serde(default)]
    pub id: String,
    /// Source record id.
    #[serde(rename = "fromId")]
    pub from: String,
    /// Target record id.
    #[serde(rename = "toId")]
    pub to: String,
    /// Relationship type.
    #[serde(rename = "type")]
    pub edge_type: String,
    /// Relationship properties.
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
}

impl EdgeRecord {
    /// Edge without properties.
    pub fn new(from: impl Into<String>, edge_type: &str, to: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            from: from.into(),
            to: to.into(),
            edge_type: edge_type.to_owned(),
            properties: Map::new(),
        }
    }

    /// String property.
    pub fn prop_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(JsonValue::as_str)
    }

    /// Boolean property.
    pub fn prop_bool(&self, key: &str) -> Option<bool> {
        json_bool(self.properties.get(key)?)
    }
}

pub(crate) fn json_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Method definition plus the metadata nodes it references.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodDocument {
    /// Document name; equals the root method id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Node records.
    pub nodes: Vec<NodeRecord>,
    /// Relationship records.
    #[serde(default)]
    pub relationships: Vec<EdgeRecord>,
}

impl MethodDocument {
    /// Parses a document. A non-empty `name` in the text wins over the
    /// supplied one.
    pub fn from_json_str(name: &str, text: &str) -> Result<Self> {
        let mut doc: MethodDocument = serde_json::from_str(text)?;
        if doc.name.is_empty() {
            doc.name = name.to_owned();
        }
        doc.normalize_method_ids();
        Ok(doc)
    }

    /// Reads a document from disk; the file stem is its name.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_json_str(&name, &text)
    }

    /// Pretty JSON rendering.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Looks up a record by id.
    pub fn node(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Outgoing edges of `id` with the given type, paired with their targets.
    pub fn outgoing<'a>(
        &'a self,
        id: &'a str,
        edge_type: &'a str,
    ) -> impl Iterator<Item = (&'a EdgeRecord, &'a NodeRecord)> + 'a {
        self.relationships
            .iter()
            .filter(move |e| e.from == id && e.edge_type == edge_type)
            .filter_map(move |e| self.node(&e.to).map(|n| (e, n)))
    }

    /// Incoming edges of `id` with the given type, paired with their sources.
    pub fn incoming<'a>(
        &'a self,
        id: &'a str,
        edge_type: &'a str,
    ) -> impl Iterator<Item = (&'a EdgeRecord, &'a NodeRecord)> + 'a {
        self.relationships
            .iter()
            .filter(move |e| e.to == id && e.edge_type == edge_type)
            .filter_map(move |e| self.node(&e.from).map(|n| (e, n)))
    }

    /// Method records.
    pub fn methods(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter().filter(|n| n.is_method())
    }

    /// Root Method record.
    pub fn root(&self) -> Option<&NodeRecord> {
        self.node(&self.name).filter(|n| n.is_method())
    }

    /// Structural checks: unique ids, resolvable edges, a root named after
    /// the document, every method attached to the root.
    pub fn validate(&self) -> std::result::Result<(), ResolutionError> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(ResolutionError::DuplicateId {
                    id: node.id.clone(),
                });
            }
        }
        for edge in &self.relationships {
            for end in [&edge.from, &edge.to] {
                if !seen.contains(end.as_str()) {
                    return Err(ResolutionError::DanglingEdge {
                        edge_type: edge.edge_type.clone(),
                        node: end.clone(),
                    });
                }
            }
        }
        if self.root().is_none() {
            return Err(ResolutionError::MissingRoot {
                name: self.name.clone(),
            });
        }
        let reachable = self.method_parents()?;
        for method in self.methods() {
            if method.id != self.name && !reachable.contains_key(method.id.as_str()) {
                return Err(ResolutionError::Unreachable {
                    id: method.id.clone(),
                    root: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Rewrites ids so the document can live next to other studies' copies.
    ///
    /// The root becomes `{study}_{root}`; every descendant becomes
    /// `{new parent id}_{id}`. Methods get `id` and `parent_id` properties;
    /// other records are prefixed with the study id.
    pub fn scoped_to_study(&self, study: &str) -> std::result::Result<Self, ResolutionError> {
        self.validate()?;
        let parents = self.method_parents()?;
        let mut renamed: HashMap<String, String> = HashMap::new();
        let mut parent_of: HashMap<String, String> = HashMap::new();
        let root_id = format!("{study}_{}", self.name);
        renamed.insert(self.name.clone(), root_id.clone());
        parent_of.insert(self.name.clone(), study.to_owned());

        let mut queue = VecDeque::from([self.name.clone()]);
        while let Some(parent) = queue.pop_front() {
            let parent_new = renamed[&parent].clone();
            for (_, child) in self.outgoing(&parent, edges::METHOD_ACTION) {
                renamed.insert(child.id.clone(), format!("{parent_new}_{}", child.id));
                parent_of.insert(child.id.clone(), parent_new.clone());
                queue.push_back(child.id.clone());
            }
        }
        debug_assert_eq!(renamed.len(), parents.len() + 1);

        let new_id = |id: &str| -> String {
            renamed
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("{study}_{id}"))
        };
        let nodes = self
            .nodes
            .iter()
            .map(|node| {
                let mut node = node.clone();
                if let Some(parent) = parent_of.get(&node.id) {
                    node.properties
                        .insert("parent_id".into(), JsonValue::String(parent.clone()));
                    node.id = new_id(&node.id);
                    node.properties
                        .insert("id".into(), JsonValue::String(node.id.clone()));
                } else {
                    node.id = new_id(&node.id);
                }
                node
            })
            .collect();
        let relationships = self
            .relationships
            .iter()
            .map(|edge| EdgeRecord {
                id: if edge.id.is_empty() {
                    String::new()
                } else {
                    format!("{study}_{}", edge.id)
                },
                from: new_id(&edge.from),
                to: new_id(&edge.to),
                edge_type: edge.edge_type.clone(),
                properties: edge.properties.clone(),
            })
            .collect();
        Ok(MethodDocument {
            name: root_id,
            nodes,
            relationships,
        })
    }

    /// Child → parent map over METHOD_ACTION edges reachable from the root.
    fn method_parents(&self) -> std::result::Result<BTreeMap<&str, &str>, ResolutionError> {
        let mut parents: BTreeMap<&str, &str> = BTreeMap::new();
        let mut queue = VecDeque::from([self.name.as_str()]);
        while let Some(parent) = queue.pop_front() {
            for (_, child) in self.outgoing(parent, edges::METHOD_ACTION) {
                if child.id == self.name || parents.insert(&child.id, parent).is_some() {
                    return Err(ResolutionError::BrokenChain {
                        parent: parent.to_owned(),
                        at: child.id.clone(),
                    });
                }
                queue.push_back(&child.id);
            }
        }
        Ok(parents)
    }

    /// Method nodes written by diagram editors keep their method id in
    /// `properties.id`; promote it to the record id.
    fn normalize_method_ids(&mut self) {
        let mut renames: HashMap<String, String> = HashMap::new();
        for node in &mut self.nodes {
            if !node.is_method() {
                continue;
            }
            if let Some(method_id) = node.prop_str("id").map(str::to_owned) {
                if method_id != node.id {
                    renames.insert(std::mem::replace(&mut node.id, method_id.clone()), method_id);
                }
            }
        }
        if renames.is_empty() {
            return;
        }
        for edge in &mut self.relationships {
            if let Some(id) = renames.get(&edge.from) {
                edge.from = id.clone();
            }
            if let Some(id) = renames.get(&edge.to) {
                edge.to = id.clone();
            }
        }
    }
}
