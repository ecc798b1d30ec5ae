//! Link and LinkStat: the actions that create entities and relationships.

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use super::label::URI_PROPERTY;
use super::{require_column, ActionEnv, Applied, ClassRef, Metadata};
use crate::error::{Error, ResolutionError, Result};
use crate::model::{edges, NodeRecord, Schema, VALUE_PROPERTY};
use crate::query::{id_column, uri_column};
use crate::store::GraphWrite;
use crate::table::{Record, Table};
use crate::value::{EdgeId, NodeId, Value};

/// Stand-in for missing values while they take part in a merge key.
pub const NAN_SENTINEL: &str = "CLD_NAN";

/// Where the nodes of one link endpoint come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointSource {
    /// Existing nodes from the `_id_<column>` column.
    Ids,
    /// Nodes merged or created from the `<column>` values, or from
    /// `_uri_<column>` when `on_uri` is set.
    Values {
        /// Reuse nodes with the same key.
        merge: bool,
        /// Key nodes on their `uri` property.
        on_uri: bool,
    },
    /// One node carrying a fixed controlled term.
    Pinned(String),
}

/// One side of a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Endpoint class.
    pub class: ClassRef,
    /// Column tag holding the endpoint's values and identifiers.
    pub column: String,
    /// Node source.
    pub source: EndpointSource,
}

impl Endpoint {
    /// Endpoint reading existing identifiers from the class's own column.
    pub fn ids(class: ClassRef) -> Self {
        let column = class.tag.clone();
        Self {
            class,
            column,
            source: EndpointSource::Ids,
        }
    }

    /// Endpoint whose nodes are derived from column values.
    pub fn values(class: ClassRef, merge: bool, on_uri: bool) -> Self {
        let column = class.tag.clone();
        Self {
            class,
            column,
            source: EndpointSource::Values { merge, on_uri },
        }
    }

    /// Endpoint pinned to one term.
    pub fn pinned(class: ClassRef, term: impl Into<String>) -> Self {
        let column = class.tag.clone();
        Self {
            class,
            column,
            source: EndpointSource::Pinned(term.into()),
        }
    }
}

/// Creates relationships between the entities of two classes.
///
/// Null values merge onto one blank node per run. The blank node loses its
/// sentinel value once the run ends, so a later run merging nulls again
/// creates another blank node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    /// Source side.
    pub from: Endpoint,
    /// Target side.
    pub to: Endpoint,
    /// Relationship type.
    pub edge_type: String,
}

/// `(from by value, to by value, merge, on uri)` for a `how` mode.
fn parse_how(how: Option<&str>) -> std::result::Result<(bool, bool, bool, bool), String> {
    Ok(match how.unwrap_or("") {
        "" => (false, false, false, false),
        "merge" | "merge_to" => (false, true, true, false),
        "merge_from" => (true, false, true, false),
        "create" | "create_to" => (false, true, false, false),
        "create_from" => (true, false, false, false),
        "merge_on_uri" => (false, true, true, true),
        "merge_from_on_uri" => (true, false, true, true),
        other => return Err(format!("unknown link mode '{other}'")),
    })
}

impl Link {
    /// Link configured by a `how` mode and optional pinned terms.
    pub fn configure(
        from: ClassRef,
        to: ClassRef,
        edge_type: impl Into<String>,
        how: Option<&str>,
        from_value: Option<String>,
        to_value: Option<String>,
    ) -> std::result::Result<Self, String> {
        let (from_by_value, to_by_value, merge, on_uri) = parse_how(how)?;
        let side = |class: ClassRef, by_value: bool, pinned: Option<String>| match pinned {
            Some(term) => Endpoint::pinned(class, term),
            None if by_value => Endpoint::values(class, merge, on_uri),
            None => Endpoint::ids(class),
        };
        Ok(Self {
            from: side(from, from_by_value, from_value),
            to: side(to, to_by_value, to_value),
            edge_type: edge_type.into(),
        })
    }

    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let link = meta.doc.outgoing(&node.id, edges::LINK).next();
        let (from, to, edge_type, options) = match link {
            Some((edge, rel)) => {
                let from = meta.class(rel, edges::FROM)?;
                let to = meta.class(rel, edges::TO)?;
                let edge_type = rel
                    .prop_str("relationship_type")
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&to.label)
                    .to_owned();
                (from, to, edge_type, &edge.properties)
            }
            None => {
                let from = meta.class(node, edges::FROM)?;
                let to = meta.class(node, edges::TO)?;
                let edge_type = node
                    .prop_str("relationship_type")
                    .filter(|t| !t.is_empty())
                    .unwrap_or(&to.label)
                    .to_owned();
                (from, to, edge_type, &node.properties)
            }
        };
        let option = |key: &str| -> Option<String> {
            options
                .get(key)
                .and_then(|v| v.as_str())
                .or_else(|| node.prop_str(key))
                .filter(|v| !v.is_empty())
                .map(str::to_owned)
        };
        let pinned = |edge_type: &str| -> Option<String> {
            meta.doc
                .outgoing(&node.id, edge_type)
                .find_map(|(_, term)| term.prop_str(VALUE_PROPERTY).map(str::to_owned))
        };
        let mut link = Link::configure(
            meta.tags.class_ref(&from),
            meta.tags.class_ref(&to),
            edge_type,
            option("how").as_deref(),
            pinned(edges::FROM_VALUE),
            pinned(edges::TO_VALUE),
        )
        .map_err(|reason| ResolutionError::invalid(&node.id, "how", reason))?;
        if let Some(column) = option("from_column") {
            link.from.column = column;
        }
        if let Some(column) = option("to_column") {
            link.to.column = column;
        }
        Ok(link)
    }

    pub(crate) fn apply(&self, id: &str, env: &mut ActionEnv<'_>, mut table: Table) -> Result<Applied> {
        if table.is_empty() {
            debug!(action = %id, "actions.link.empty");
            return Ok(Applied::pure(table));
        }
        let mut created_nodes = Vec::new();
        let resolved = resolve_endpoint(&self.from, id, env, &mut table, &mut created_nodes)
            .and_then(|from| {
                resolve_endpoint(&self.to, id, env, &mut table, &mut created_nodes)
                    .map(|to| (from, to))
            });
        let (from, to) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                discard(env, id, Vec::new(), created_nodes);
                return Err(err);
            }
        };

        let mut seen = FxHashSet::default();
        let pairs: Vec<(NodeId, NodeId)> = from
            .iter()
            .zip(&to)
            .filter_map(|(a, b)| Some(((*a)?, (*b)?)))
            .filter(|pair| seen.insert(*pair))
            .collect();
        let mut created_edges: Vec<EdgeId> = Vec::new();
        if !pairs.is_empty() {
            match env.store.apply(&GraphWrite::MergeEdges {
                edge_type: self.edge_type.clone(),
                pairs,
            }) {
                Ok(receipt) => created_edges = receipt.created_edges,
                Err(err) => {
                    discard(env, id, Vec::new(), created_nodes);
                    return Err(err);
                }
            }
        }
        debug!(
            action = %id,
            edge_type = %self.edge_type,
            created_edges = created_edges.len(),
            created_nodes = created_nodes.len(),
            "actions.link.applied"
        );
        Ok(Applied {
            table,
            compensation: compensation(created_edges, created_nodes),
        })
    }
}

fn compensation(created_edges: Vec<EdgeId>, created_nodes: Vec<NodeId>) -> Vec<GraphWrite> {
    let mut writes = Vec::new();
    if !created_edges.is_empty() {
        writes.push(GraphWrite::DeleteEdges {
            edges: created_edges,
        });
    }
    if !created_nodes.is_empty() {
        writes.push(GraphWrite::DeleteNodes {
            nodes: created_nodes,
        });
    }
    writes
}

/// Entities a LinkStat has created so far.
#[derive(Default)]
struct Created {
    nodes: Vec<NodeId>,
    edges: Vec<EdgeId>,
}

/// Removes edges and nodes an action created before it failed.
fn discard(env: &mut ActionEnv<'_>, id: &str, created_edges: Vec<EdgeId>, created_nodes: Vec<NodeId>) {
    for write in compensation(created_edges, created_nodes) {
        if let Err(err) = env.store.apply(&write) {
            warn!(action = %id, op = write.op(), error = %err, "actions.link.cleanup_failed");
        }
    }
}

/// Fails when a derived value is not one of the class's terms.
fn check_compliant<'v>(
    schema: &Schema,
    class: &str,
    values: impl IntoIterator<Item = &'v Value>,
) -> Result<()> {
    let terms: FxHashSet<&str> = schema.terms_of(class).map(|t| t.label.as_str()).collect();
    if terms.is_empty() {
        return Ok(());
    }
    for value in values {
        if value.is_null() {
            continue;
        }
        let text = value.to_string();
        if !terms.contains(text.as_str()) {
            return Err(Error::NonCompliantValue {
                class: class.to_owned(),
                value: text,
            });
        }
    }
    Ok(())
}

/// Node per row for one endpoint; writes `_id_<column>` when nodes were
/// derived rather than read.
fn resolve_endpoint(
    end: &Endpoint,
    id: &str,
    env: &mut ActionEnv<'_>,
    table: &mut Table,
    created: &mut Vec<NodeId>,
) -> Result<Vec<Option<NodeId>>> {
    let label = &end.class.label;
    let ids = match &end.source {
        EndpointSource::Ids => {
            return Ok(require_column(table, id, &id_column(&end.column))?
                .into_iter()
                .map(Value::as_node)
                .collect())
        }
        EndpointSource::Pinned(term) => {
            let term = Value::from(term.as_str());
            check_compliant(env.schema, label, [&term])?;
            let mut row = Record::new();
            row.insert(env.value_property.to_owned(), term);
            let receipt = env.store.apply(&GraphWrite::MergeNodes {
                label: label.clone(),
                key: env.value_property.to_owned(),
                rows: vec![row],
            })?;
            created.extend(receipt.created_nodes);
            let node = receipt
                .nodes
                .first()
                .copied()
                .ok_or_else(|| Error::store(format!("merging the '{label}' term returned no node")))?;
            vec![Some(node); table.len()]
        }
        EndpointSource::Values { merge, on_uri } => {
            let values: Vec<Value> = if *on_uri {
                table
                    .column(&end.column)
                    .map(|col| col.into_iter().cloned().collect())
                    .unwrap_or_else(|| vec![Value::Null; table.len()])
            } else {
                require_column(table, id, &end.column)?
                    .into_iter()
                    .cloned()
                    .collect()
            };
            check_compliant(env.schema, label, &values)?;
            let uris: Option<Vec<Value>> = if *on_uri {
                Some(
                    require_column(table, id, &uri_column(&end.column))?
                        .into_iter()
                        .cloned()
                        .collect(),
                )
            } else {
                None
            };

            let mut rows = Vec::new();
            let mut positions = Vec::with_capacity(values.len());
            let mut used_sentinel = false;
            for (idx, value) in values.into_iter().enumerate() {
                let value = if value.is_null() {
                    used_sentinel = true;
                    Value::from(NAN_SENTINEL)
                } else {
                    value
                };
                let mut row = Record::new();
                if let Some(uris) = &uris {
                    if uris[idx].is_null() {
                        positions.push(None);
                        continue;
                    }
                    row.insert(URI_PROPERTY.to_owned(), uris[idx].clone());
                }
                row.insert(env.value_property.to_owned(), value);
                positions.push(Some(rows.len()));
                rows.push(row);
            }
            if rows.is_empty() {
                vec![None; positions.len()]
            } else {
                let key = if *on_uri {
                    URI_PROPERTY
                } else {
                    env.value_property
                };
                let write = if *merge {
                    GraphWrite::MergeNodes {
                        label: label.clone(),
                        key: key.to_owned(),
                        rows,
                    }
                } else {
                    GraphWrite::CreateNodes {
                        label: label.clone(),
                        rows,
                    }
                };
                let receipt = env.store.apply(&write)?;
                created.extend(receipt.created_nodes.iter().copied());
                if used_sentinel && !receipt.created_nodes.is_empty() {
                    env.store.apply(&GraphWrite::ClearSentinel {
                        prop: env.value_property.to_owned(),
                        sentinel: Value::from(NAN_SENTINEL),
                        nodes: receipt.created_nodes.clone(),
                    })?;
                }
                positions
                    .into_iter()
                    .map(|pos| pos.and_then(|p| receipt.nodes.get(p).copied()))
                    .collect()
            }
        }
    };
    let column: Vec<Value> = ids
        .iter()
        .map(|node| node.map(Value::NodeRef).unwrap_or(Value::Null))
        .collect();
    table.set_column(id_column(&end.column), column)?;
    Ok(ids)
}

/// Merges one entity per statistic value and links the dimension entities
/// to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkStat {
    /// Statistic classes; each needs `<tag>` and `_uri_<tag>` columns.
    pub statistics: Vec<ClassRef>,
    /// Dimension classes; each needs an `_id_<tag>` column.
    pub dimensions: Vec<ClassRef>,
}

impl LinkStat {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let statistics: Vec<ClassRef> = meta
            .classes(node, edges::STATISTIC)
            .iter()
            .map(|class| meta.tags.class_ref(class))
            .collect();
        if statistics.is_empty() {
            return Err(ResolutionError::missing(&node.id, "STATISTIC classes"));
        }
        let dimensions = meta
            .classes(node, edges::DIMENSION)
            .iter()
            .map(|class| meta.tags.class_ref(class))
            .collect();
        Ok(Self {
            statistics,
            dimensions,
        })
    }

    pub(crate) fn apply(&self, id: &str, env: &mut ActionEnv<'_>, mut table: Table) -> Result<Applied> {
        if table.is_empty() {
            return Ok(Applied::pure(table));
        }
        let dimension_ids: Vec<Vec<Option<NodeId>>> = self
            .dimensions
            .iter()
            .map(|dim| {
                require_column(&table, id, &id_column(&dim.tag))
                    .map(|values| values.into_iter().map(Value::as_node).collect())
            })
            .collect::<Result<_>>()?;
        let mut created = Created::default();
        for stat in &self.statistics {
            if let Err(err) = self.link_statistic(stat, id, env, &mut table, &dimension_ids, &mut created) {
                discard(env, id, created.edges, created.nodes);
                return Err(err);
            }
        }
        let Created {
            nodes: created_nodes,
            edges: created_edges,
        } = created;
        debug!(
            action = %id,
            created_nodes = created_nodes.len(),
            created_edges = created_edges.len(),
            "actions.link_stat.applied"
        );
        Ok(Applied {
            table,
            compensation: compensation(created_edges, created_nodes),
        })
    }

    /// Merges one statistic's nodes and hangs them off every dimension.
    fn link_statistic(
        &self,
        stat: &ClassRef,
        id: &str,
        env: &mut ActionEnv<'_>,
        table: &mut Table,
        dimension_ids: &[Vec<Option<NodeId>>],
        created: &mut Created,
    ) -> Result<()> {
        let uris: Vec<Value> = require_column(table, id, &uri_column(&stat.tag))?
            .into_iter()
            .cloned()
            .collect();
        let values: Vec<Value> = require_column(table, id, &stat.tag)?
            .into_iter()
            .cloned()
            .collect();
        let mut rows = Vec::new();
        let mut positions = Vec::with_capacity(uris.len());
        for (uri, value) in uris.into_iter().zip(values) {
            if uri.is_null() {
                positions.push(None);
                continue;
            }
            let mut row = Record::new();
            row.insert(URI_PROPERTY.to_owned(), uri);
            row.insert(env.value_property.to_owned(), value);
            positions.push(Some(rows.len()));
            rows.push(row);
        }
        let receipt = env.store.apply(&GraphWrite::MergeNodes {
            label: stat.label.clone(),
            key: URI_PROPERTY.to_owned(),
            rows,
        })?;
        created.nodes.extend(receipt.created_nodes.iter().copied());
        let stat_ids: Vec<Option<NodeId>> = positions
            .into_iter()
            .map(|pos| pos.and_then(|p| receipt.nodes.get(p).copied()))
            .collect();

        let mut seen = FxHashSet::default();
        let mut pairs = Vec::new();
        let mut incomplete = 0usize;
        for (row, stat_id) in stat_ids.iter().enumerate() {
            let Some(stat_id) = stat_id else { continue };
            for dims in dimension_ids {
                match dims[row] {
                    Some(dim) if seen.insert((dim, *stat_id)) => pairs.push((dim, *stat_id)),
                    Some(_) => {}
                    None => incomplete += 1,
                }
            }
        }
        if incomplete > 0 {
            warn!(action = %id, statistic = %stat.tag, missing = incomplete, "actions.link_stat.missing_dimensions");
        }
        if !pairs.is_empty() {
            let receipt = env.store.apply(&GraphWrite::MergeEdges {
                edge_type: stat.label.clone(),
                pairs,
            })?;
            created.edges.extend(receipt.created_edges);
        }
        let column: Vec<Value> = stat_ids
            .iter()
            .map(|node| node.map(Value::NodeRef).unwrap_or(Value::Null))
            .collect();
        table.set_column(id_column(&stat.tag), column)?;
        Ok(())
    }
}
