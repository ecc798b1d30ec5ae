//! AssignLabel and BuildUri.

use rustc_hash::FxHashSet;
use tracing::debug;

use super::{require_column, ActionEnv, Applied, ClassRef, Metadata};
use crate::error::{ResolutionError, Result};
use crate::model::{edges, NodeRecord};
use crate::query::{id_column, uri_column};
use crate::store::GraphWrite;
use crate::table::Table;
use crate::value::{NodeId, Value};

/// Property URIs are stored under.
pub const URI_PROPERTY: &str = "uri";

/// Distinct node references of a column, in first-seen order.
pub(crate) fn distinct_nodes<'v>(values: impl IntoIterator<Item = &'v Value>) -> Vec<NodeId> {
    let mut seen = FxHashSet::default();
    values
        .into_iter()
        .filter_map(Value::as_node)
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Adds a label to the nodes of an identifier column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignLabel {
    /// Class whose `_id_` column selects the nodes.
    pub on: ClassRef,
    /// Class whose label is added.
    pub target: ClassRef,
}

impl AssignLabel {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let on = meta.class(node, edges::ON)?;
        let target = meta.class(node, edges::CLASS)?;
        Ok(Self {
            on: meta.tags.class_ref(&on),
            target: meta.tags.class_ref(&target),
        })
    }

    pub(crate) fn apply(&self, id: &str, env: &mut ActionEnv<'_>, mut table: Table) -> Result<Applied> {
        let ids: Vec<Value> = require_column(&table, id, &id_column(&self.on.tag))?
            .into_iter()
            .cloned()
            .collect();
        let nodes = distinct_nodes(&ids);
        let mut compensation = Vec::new();
        if !nodes.is_empty() {
            let receipt = env.store.apply(&GraphWrite::AddLabel {
                label: self.target.label.clone(),
                nodes,
            })?;
            debug!(action = %id, label = %self.target.label, labelled = receipt.labelled.len(), "actions.assign_label");
            if !receipt.labelled.is_empty() {
                compensation.push(GraphWrite::RemoveLabel {
                    label: self.target.label.clone(),
                    nodes: receipt.labelled,
                });
            }
        }
        if let Some(values) = table.column(&self.on.tag) {
            let values: Vec<Value> = values.into_iter().cloned().collect();
            table.set_column(self.target.tag.clone(), values)?;
        }
        table.set_column(id_column(&self.target.tag), ids)?;
        Ok(Applied {
            table,
            compensation,
        })
    }
}

/// Computes URI columns from identifying columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildUri {
    /// Leading URI segment.
    pub prefix: String,
    /// Classes that receive a `_uri_<tag>` column.
    pub targets: Vec<ClassRef>,
    /// Tags of the identifying columns.
    pub by: Vec<String>,
    /// Tags appended after `_label_`.
    pub labels: Vec<String>,
    /// Also write the URI onto the target nodes.
    pub store_on_existing_nodes: bool,
}

impl BuildUri {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let sorted = |edge_type: &str| {
            let mut classes = meta.classes(node, edge_type);
            classes.sort_by(|a, b| a.label.cmp(&b.label));
            classes.dedup_by(|a, b| a.label == b.label);
            classes
        };
        let targets: Vec<ClassRef> = sorted(edges::URI_FOR)
            .iter()
            .map(|class| meta.tags.class_ref(class))
            .collect();
        if targets.is_empty() {
            return Err(ResolutionError::missing(&node.id, "URI_FOR classes"));
        }
        let by: Vec<String> = sorted(edges::URI_BY)
            .iter()
            .map(|class| meta.tags.tag(class))
            .collect();
        let labels: Vec<String> = sorted(edges::URI_LABEL)
            .iter()
            .map(|class| meta.tags.tag(class))
            .collect();
        if by.is_empty() && labels.is_empty() {
            return Err(ResolutionError::missing(&node.id, "URI_BY or URI_LABEL classes"));
        }
        Ok(Self {
            prefix: node.prop_str("prefix").unwrap_or_default().to_owned(),
            targets,
            by,
            labels,
            store_on_existing_nodes: node.prop_bool("store_on_existing_nodes").unwrap_or(false),
        })
    }

    /// URI of one row for `target`.
    pub fn render(&self, target: &str, by_values: &[&Value]) -> String {
        let parts: Vec<String> = self
            .by
            .iter()
            .zip(by_values)
            .map(|(tag, value)| format!("{tag}:{value}"))
            .collect();
        let mut uri = format!("{}_{}_by_{}", self.prefix, target, parts.join("/"));
        if !self.labels.is_empty() {
            uri.push_str("_label_");
            uri.push_str(&self.labels.join("/"));
        }
        uri
    }

    pub(crate) fn apply(&self, id: &str, env: &mut ActionEnv<'_>, mut table: Table) -> Result<Applied> {
        let columns: Vec<Vec<Value>> = self
            .by
            .iter()
            .map(|tag| {
                require_column(&table, id, tag).map(|values| values.into_iter().cloned().collect())
            })
            .collect::<Result<_>>()?;
        let mut compensation = Vec::new();
        for target in &self.targets {
            let uris: Vec<Value> = (0..table.len())
                .map(|row| {
                    let values: Vec<&Value> = columns.iter().map(|column| &column[row]).collect();
                    Value::String(self.render(&target.tag, &values))
                })
                .collect();
            if self.store_on_existing_nodes {
                let ids = require_column(&table, id, &id_column(&target.tag))?;
                let mut seen = FxHashSet::default();
                let assignments: Vec<(NodeId, Value)> = ids
                    .into_iter()
                    .zip(&uris)
                    .filter_map(|(node, uri)| Some((node.as_node()?, uri.clone())))
                    .filter(|(node, _)| seen.insert(*node))
                    .collect();
                if !assignments.is_empty() {
                    let receipt = env.store.apply(&GraphWrite::SetProperty {
                        prop: URI_PROPERTY.to_owned(),
                        assignments,
                    })?;
                    compensation.push(GraphWrite::SetProperty {
                        prop: URI_PROPERTY.to_owned(),
                        assignments: receipt.previous,
                    });
                }
            }
            debug!(action = %id, target = %target.tag, rows = uris.len(), "actions.build_uri");
            table.set_column(uri_column(&target.tag), uris)?;
        }
        compensation.reverse();
        Ok(Applied {
            table,
            compensation,
        })
    }
}
