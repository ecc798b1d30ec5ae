//! Class/relationship/term graph used for tag resolution, relationship
//! inference and controlled-term lookups.
use std::collections::{BTreeMap, HashMap, VecDeque};

use serde_json::Value as JsonValue;

use super::document::{MethodDocument, NodeRecord};
use super::{edges, labels, ClassNode, RelationshipNode, TermNode, VALUE_PROPERTY};

/// Property holding a term's submission code.
pub const TERM_CODE_PROPERTY: &str = "Term Code";

/// In-memory view of the schema metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Schema {
    classes: BTreeMap<String, ClassNode>,
    relationships: Vec<RelationshipNode>,
    terms: Vec<TermNode>,
    same_as: Vec<(usize, usize)>,
}

impl Schema {
    /// Empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a class.
    pub fn with_class(mut self, class: ClassNode) -> Self {
        self.classes.insert(class.label.clone(), class);
        self
    }

    /// Adds a relationship; unknown endpoint classes are added bare.
    pub fn with_relationship(mut self, rel: RelationshipNode) -> Self {
        for label in [&rel.from, &rel.to] {
            if !self.classes.contains_key(label) {
                self.classes.insert(label.clone(), ClassNode::new(label.clone()));
            }
        }
        self.relationships.push(rel);
        self
    }

    /// Adds a controlled term to `class`.
    pub fn with_term(mut self, class: &str, label: &str, code: Option<&str>) -> Self {
        self.terms.push(TermNode {
            code: code.map(str::to_owned),
            label: label.to_owned(),
            class: class.to_owned(),
        });
        self
    }

    /// Declares two existing terms equivalent.
    pub fn with_same_as(mut self, (class_a, term_a): (&str, &str), (class_b, term_b): (&str, &str)) -> Self {
        if let (Some(a), Some(b)) = (self.term_index(class_a, term_a), self.term_index(class_b, term_b)) {
            self.same_as.push((a, b));
        }
        self
    }

    /// Class by label.
    pub fn class(&self, label: &str) -> Option<&ClassNode> {
        self.classes.get(label)
    }

    /// All classes ordered by label.
    pub fn classes(&self) -> impl Iterator<Item = &ClassNode> {
        self.classes.values()
    }

    /// All relationships in declaration order.
    pub fn relationships(&self) -> &[RelationshipNode] {
        &self.relationships
    }

    /// Tag of a class: its short label, or the label itself for classes the
    /// schema does not know.
    pub fn tag_of<'a>(&'a self, label: &'a str) -> &'a str {
        self.classes.get(label).map(ClassNode::tag).unwrap_or(label)
    }

    /// Controlled terms of a class.
    pub fn terms_of<'a>(&'a self, class: &'a str) -> impl Iterator<Item = &'a TermNode> + 'a {
        self.terms.iter().filter(move |t| t.class == class)
    }

    /// Relationships joining two classes, in either direction.
    pub fn relationships_between<'a>(
        &'a self,
        a: &'a str,
        b: &'a str,
    ) -> impl Iterator<Item = &'a RelationshipNode> + 'a {
        self.relationships
            .iter()
            .filter(move |r| (r.from == a && r.to == b) || (r.from == b && r.to == a))
    }

    /// Shortest chain of relationships connecting two classes, treating
    /// relationships as undirected. Ties resolve in declaration order.
    pub fn shortest_path(&self, from: &str, to: &str) -> Option<Vec<&RelationshipNode>> {
        if from == to {
            return Some(Vec::new());
        }
        let mut came_from: HashMap<&str, (usize, &str)> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for (idx, rel) in self.relationships.iter().enumerate() {
                let next = if rel.from == current {
                    rel.to.as_str()
                } else if rel.to == current {
                    rel.from.as_str()
                } else {
                    continue;
                };
                if next == from || came_from.contains_key(next) {
                    continue;
                }
                came_from.insert(next, (idx, current));
                if next == to {
                    let mut path = Vec::new();
                    let mut cursor = to;
                    while cursor != from {
                        let (idx, prev) = came_from[cursor];
                        path.push(&self.relationships[idx]);
                        cursor = prev;
                    }
                    path.reverse();
                    return Some(path);
                }
                queue.push_back(next);
            }
        }
        None
    }

    /// `(from term, to term)` label pairs declared SAME_AS between two
    /// classes' controlled terms.
    pub fn same_as_pairs(&self, from_class: &str, to_class: &str) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for &(a, b) in &self.same_as {
            let (ta, tb) = (&self.terms[a], &self.terms[b]);
            if ta.class == from_class && tb.class == to_class {
                pairs.push((ta.label.clone(), tb.label.clone()));
            } else if tb.class == from_class && ta.class == to_class {
                pairs.push((tb.label.clone(), ta.label.clone()));
            }
        }
        pairs.sort();
        pairs.dedup();
        pairs
    }

    fn term_index(&self, class: &str, label: &str) -> Option<usize> {
        self.terms
            .iter()
            .position(|t| t.class == class && t.label == label)
    }

    /// Collects every Class, Relationship and Term record of a document.
    pub fn from_document(doc: &MethodDocument) -> Self {
        let mut schema = Schema::new();
        let mut class_label_by_id: HashMap<&str, String> = HashMap::new();
        for node in &doc.nodes {
            if let Some(class) = class_from_record(node) {
                class_label_by_id.insert(&node.id, class.label.clone());
                schema.classes.insert(class.label.clone(), class);
            }
        }
        for node in doc.nodes.iter().filter(|n| n.has_label(labels::RELATIONSHIP)) {
            if let Some(rel) = relationship_from_record(doc, node) {
                schema.relationships.push(rel);
            }
        }
        let mut term_idx_by_id: HashMap<&str, usize> = HashMap::new();
        for node in doc.nodes.iter().filter(|n| n.has_label(labels::TERM)) {
            let Some(label) = node.prop_str(VALUE_PROPERTY) else {
                continue;
            };
            let owner = doc
                .incoming(&node.id, edges::HAS_CONTROLLED_TERM)
                .find_map(|(_, class)| class_label_by_id.get(class.id.as_str()).cloned());
            let Some(class) = owner else {
                continue;
            };
            term_idx_by_id.insert(&node.id, schema.terms.len());
            schema.terms.push(TermNode {
                code: node.prop_str(TERM_CODE_PROPERTY).map(str::to_owned),
                label: label.to_owned(),
                class,
            });
        }
        for edge in doc.relationships.iter().filter(|e| e.edge_type == edges::SAME_AS) {
            if let (Some(&a), Some(&b)) = (
                term_idx_by_id.get(edge.from.as_str()),
                term_idx_by_id.get(edge.to.as_str()),
            ) {
                schema.same_as.push((a, b));
            }
        }
        schema
    }
}

/// Reads a Class record.
pub fn class_from_record(node: &NodeRecord) -> Option<ClassNode> {
    if !node.has_label(labels::CLASS) {
        return None;
    }
    let label = node.prop_str("label").or_else(|| node.prop_str(VALUE_PROPERTY))?;
    Some(ClassNode {
        label: label.to_owned(),
        short_label: node.prop_str("short_label").map(str::to_owned),
        data_type: node.prop_str("data_type").map(str::to_owned),
        derived: node.prop_bool("derived").unwrap_or(false),
    })
}

/// Reads a Relationship record together with its FROM/TO classes.
pub fn relationship_from_record(doc: &MethodDocument, node: &NodeRecord) -> Option<RelationshipNode> {
    let from = doc
        .outgoing(&node.id, edges::FROM)
        .find_map(|(_, class)| class_from_record(class))?;
    let to = doc
        .outgoing(&node.id, edges::TO)
        .find_map(|(_, class)| class_from_record(class))?;
    let text = |key: &str| -> Option<String> {
        match node.properties.get(key)? {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    };
    Some(RelationshipNode {
        relationship_type: text("relationship_type"),
        label: text("label"),
        short_label: text("short_label"),
        from: from.label,
        to: to.label,
    })
}
