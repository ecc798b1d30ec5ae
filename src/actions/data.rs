//! GetData (with its Filter metadata) and RunCypher.

use std::collections::BTreeMap;
use std::convert::TryFrom;

use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use super::{ActionEnv, Metadata};
use crate::error::{ResolutionError, Result};
use crate::model::schema::{class_from_record, relationship_from_record};
use crate::model::{edges, NodeRecord, VALUE_PROPERTY};
use crate::query::{
    ClassRequest, Condition, DataRequest, EdgeDirection, ExistenceCheck, QueryBuilder, QueryOptions,
    RelDescriptor,
};
use crate::store::Params;
use crate::table::Table;
use crate::value::Value;

const RANGE_PROPERTIES: [&str; 5] = ["min", "max", "min_include", "max_include", "incl_null"];

/// Fetches a table through the query builder.
#[derive(Clone, Debug, PartialEq)]
pub struct GetData {
    /// Compiled request, including the constraints of following Filters.
    pub request: DataRequest,
}

impl GetData {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
        filters: &[&NodeRecord],
    ) -> std::result::Result<Self, ResolutionError> {
        let classes: Vec<ClassRequest> = meta
            .doc
            .outgoing(&node.id, edges::SOURCE_CLASS)
            .filter_map(|(edge, target)| {
                let class = class_from_record(target)?;
                Some(ClassRequest {
                    label: class.label,
                    optional: edge.prop_bool("optional").unwrap_or(false),
                })
            })
            .collect();
        let mut relationships = Vec::new();
        for (edge, target) in meta.doc.outgoing(&node.id, edges::SOURCE_RELATIONSHIP) {
            let rel = relationship_from_record(meta.doc, target).ok_or_else(|| {
                ResolutionError::missing(&node.id, format!("FROM/TO classes of relationship '{}'", target.id))
            })?;
            let optional = edge
                .prop_bool("optional")
                .or_else(|| target.prop_bool("optional"))
                .unwrap_or(false);
            relationships.push(RelDescriptor {
                from: rel.from,
                to: rel.to,
                rel_type: rel.relationship_type,
                short_label: rel.short_label,
                optional,
            });
        }
        if classes.is_empty() && relationships.is_empty() {
            return Err(ResolutionError::missing(
                &node.id,
                "SOURCE_CLASS or SOURCE_RELATIONSHIP edges",
            ));
        }

        let allow_unrelated_subgraphs = node.prop_bool("allow_unrelated_subgraphs").unwrap_or(false);
        let infer_rels = relationships.is_empty() && classes.len() > 1 && !allow_unrelated_subgraphs;
        let mut request = DataRequest {
            classes,
            relationships,
            where_map: BTreeMap::new(),
            where_rel_map: BTreeMap::new(),
            options: QueryOptions {
                allow_unrelated_subgraphs,
                infer_rels,
                limit: None,
                naming: meta.naming,
                value_property: meta.value_property.to_owned(),
            },
        };
        for filter in filters {
            apply_filter(meta, filter, &mut request)?;
        }
        Ok(Self { request })
    }

    pub(crate) fn apply(&self, env: &mut ActionEnv<'_>) -> Result<Table> {
        let mut request = self.request.clone();
        if env.limit.is_some() {
            request.options.limit = env.limit;
        }
        let plan = QueryBuilder::new(env.schema).build(&request)?;
        if plan.is_empty() {
            return Ok(Table::empty());
        }
        let table = env.store.fetch(&plan)?;
        debug!(hash = plan.hash, rows = table.len(), "actions.get_data.fetched");
        Ok(table)
    }
}

/// Folds one Filter node's ON/ON_VALUE/FILTER_RELATIONSHIP metadata into
/// `request`.
fn apply_filter(
    meta: &Metadata<'_>,
    filter: &NodeRecord,
    request: &mut DataRequest,
) -> std::result::Result<(), ResolutionError> {
    let on: Vec<_> = meta
        .doc
        .outgoing(&filter.id, edges::ON)
        .filter_map(|(edge, target)| {
            class_from_record(target).map(|class| (edge, class))
        })
        .collect();
    let values: Vec<(Option<String>, String)> = meta
        .doc
        .outgoing(&filter.id, edges::ON_VALUE)
        .filter_map(|(_, term)| {
            let label = term.prop_str(VALUE_PROPERTY)?.to_owned();
            let owner = meta
                .doc
                .incoming(&term.id, edges::HAS_CONTROLLED_TERM)
                .find_map(|(_, class)| class_from_record(class))
                .map(|class| class.label);
            Some((owner, label))
        })
        .collect();

    for (edge, class) in &on {
        let property = edge
            .prop_str("property")
            .unwrap_or(meta.value_property)
            .to_owned();
        let range: Map<String, JsonValue> = edge
            .properties
            .iter()
            .filter(|(key, _)| RANGE_PROPERTIES.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let condition = if !range.is_empty() {
            Condition::try_from(JsonValue::Object(range))
                .map_err(|reason| ResolutionError::invalid(&filter.id, "range", reason))?
        } else {
            let mine: Vec<&str> = values
                .iter()
                .filter(|(owner, _)| match owner {
                    Some(owner) => owner == &class.label,
                    None => on.len() == 1,
                })
                .map(|(_, label)| label.as_str())
                .collect();
            if mine.is_empty() {
                return Err(ResolutionError::missing(
                    &filter.id,
                    format!("ON_VALUE terms for '{}'", class.label),
                ));
            }
            if property == meta.value_property {
                check_terms(meta, &filter.id, &class.label, &mine)?;
            }
            let mut list: Vec<Value> = mine.into_iter().map(Value::from).collect();
            if edge.prop_bool("not_in").unwrap_or(false) {
                Condition::NotIn(list)
            } else if list.len() == 1 {
                Condition::Equals(list.remove(0))
            } else {
                Condition::OneOf(list)
            }
        };
        request
            .where_map
            .entry(class.label.clone())
            .or_default()
            .insert(property, condition);
    }

    for (edge, target) in meta.doc.outgoing(&filter.id, edges::FILTER_RELATIONSHIP) {
        let Some(anchor) = class_from_record(target) else {
            continue;
        };
        let include = label_list(edge.properties.get("only_related_to"));
        let mut exclude = label_list(edge.properties.get("exclude"));
        if !include.is_empty() && !exclude.contains(&anchor.label) {
            exclude.push(anchor.label.clone());
        }
        let direction = match edge.prop_str("direction") {
            None | Some("any") | Some("both") => EdgeDirection::Both,
            Some("out") => EdgeDirection::Out,
            Some("in") => EdgeDirection::In,
            Some(other) => {
                return Err(ResolutionError::invalid(
                    &filter.id,
                    "direction",
                    format!("expected any, out or in, got '{other}'"),
                ))
            }
        };
        request
            .where_rel_map
            .entry(anchor.label)
            .or_default()
            .push(ExistenceCheck {
                negated: edge.prop_bool("negated").unwrap_or(false),
                direction,
                include,
                exclude,
            });
    }
    Ok(())
}

fn check_terms(
    meta: &Metadata<'_>,
    id: &str,
    class: &str,
    values: &[&str],
) -> std::result::Result<(), ResolutionError> {
    let terms: Vec<&str> = meta.schema.terms_of(class).map(|t| t.label.as_str()).collect();
    if terms.is_empty() {
        return Ok(());
    }
    match values.iter().find(|v| !terms.contains(v)) {
        Some(value) => Err(ResolutionError::UnknownTerm {
            id: id.to_owned(),
            class: class.to_owned(),
            value: (*value).to_owned(),
        }),
        None => Ok(()),
    }
}

fn label_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        Some(JsonValue::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(JsonValue::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_owned))
            .collect(),
        _ => Vec::new(),
    }
}

/// Literal statement against the store.
#[derive(Clone, Debug, PartialEq)]
pub struct RunCypher {
    /// Statement text.
    pub query: String,
    /// Bound parameters.
    pub params: Params,
    /// Pass the context rows as `$data`.
    pub include_data: bool,
    /// Replace the context with the statement's result.
    pub update_df: bool,
    /// Strip `var.` prefixes from returned column names.
    pub remove_col_prefixes: bool,
}

impl RunCypher {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let query = node
            .prop_str("query")
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ResolutionError::missing(&node.id, "'query' property"))?;
        Ok(Self {
            query: query.to_owned(),
            params: meta.object_prop(node, "params")?,
            include_data: node.prop_bool("include_data").unwrap_or(false),
            update_df: node.prop_bool("update_df").unwrap_or(false),
            remove_col_prefixes: node.prop_bool("remove_col_prefixes").unwrap_or(true),
        })
    }

    pub(crate) fn apply(&self, env: &mut ActionEnv<'_>, table: Table) -> Result<Table> {
        let mut params = self.params.clone();
        if self.include_data {
            params.insert("data".into(), JsonValue::Array(table.to_json_records()));
        }
        let mut result = env.store.run_cypher(&self.query, &params)?;
        debug!(rows = result.len(), update = self.update_df, "actions.run_cypher.done");
        if !self.update_df {
            return Ok(table);
        }
        if self.remove_col_prefixes {
            let renames: BTreeMap<String, String> = result
                .columns()
                .iter()
                .filter_map(|name| {
                    let (_, short) = name.rsplit_once('.')?;
                    Some((name.clone(), short.to_owned()))
                })
                .collect();
            result.rename_columns(&renames)?;
        }
        Ok(result)
    }
}
