//! Primitive pipeline steps.
//!
//! Each Method node of a resolved chain becomes one [`Action`]. An action is
//! built from its metadata once, at resolution time, and then applied to the
//! tabular context by the executor. Mutating actions report the
//! [`GraphWrite`]s that undo their effects; the executor keeps those until
//! the run either finishes or fails.

mod branch;
mod data;
mod label;
mod link;
mod script;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::{Map, Value as JsonValue};

pub use branch::{BranchCombine, BranchLoad, BranchSave, BranchStore};
pub use data::{GetData, RunCypher};
pub use label::{AssignLabel, BuildUri};
pub use link::{Endpoint, EndpointSource, Link, LinkStat, NAN_SENTINEL};
pub use script::{CallApi, RunScript};

use crate::error::{Error, ResolutionError, Result};
use crate::model::schema::class_from_record;
use crate::model::{ClassNode, MethodDocument, MethodType, NodeRecord, Schema};
use crate::query::{ColumnNaming, DataRequest};
use crate::scripts::ScriptRunner;
use crate::store::{GraphStore, GraphWrite};
use crate::table::Table;

/// Class referenced by an action, with the tag its columns use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassRef {
    /// Class label.
    pub label: String,
    /// Column tag.
    pub tag: String,
}

impl ClassRef {
    /// Reference with an explicit tag.
    pub fn new(label: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tag: tag.into(),
        }
    }
}

/// Column tags in effect at one point of a chain.
///
/// A GetData relationship with a short label renames its `to` class for
/// every later action that references that class.
#[derive(Clone, Debug, Default)]
pub struct Tags {
    overrides: HashMap<String, String>,
}

impl Tags {
    /// Tag of `class`.
    pub fn tag(&self, class: &ClassNode) -> String {
        self.overrides
            .get(&class.label)
            .cloned()
            .unwrap_or_else(|| class.tag().to_owned())
    }

    /// Tag of a class known only by label.
    pub fn tag_of(&self, schema: &Schema, label: &str) -> String {
        match self.overrides.get(label) {
            Some(tag) => tag.clone(),
            None => schema.tag_of(label).to_owned(),
        }
    }

    /// Reference to `class` with its current tag.
    pub fn class_ref(&self, class: &ClassNode) -> ClassRef {
        ClassRef::new(class.label.clone(), self.tag(class))
    }

    /// Records the renames a request introduces.
    pub fn observe(&mut self, request: &DataRequest) {
        if request.options.naming != ColumnNaming::ShortLabel {
            return;
        }
        for rel in &request.relationships {
            if let Some(short) = &rel.short_label {
                self.overrides.insert(rel.to.clone(), short.clone());
            }
        }
    }
}

/// Read-only view used while building actions from Method nodes.
#[derive(Clone, Copy)]
pub struct Metadata<'a> {
    /// Document holding the chain.
    pub doc: &'a MethodDocument,
    /// Schema for tags and controlled terms.
    pub schema: &'a Schema,
    /// Tags in effect at the action.
    pub tags: &'a Tags,
    /// Property projected into value columns.
    pub value_property: &'a str,
    /// Column naming mode.
    pub naming: ColumnNaming,
}

impl<'a> Metadata<'a> {
    /// Classes reached from `node` over `edge_type`, in document order.
    pub(crate) fn classes(&self, node: &NodeRecord, edge_type: &str) -> Vec<ClassNode> {
        self.doc
            .outgoing(&node.id, edge_type)
            .filter_map(|(_, target)| class_from_record(target))
            .collect()
    }

    /// Exactly one class over `edge_type`.
    pub(crate) fn class(
        &self,
        node: &NodeRecord,
        edge_type: &str,
    ) -> std::result::Result<ClassNode, ResolutionError> {
        self.classes(node, edge_type)
            .into_iter()
            .next()
            .ok_or_else(|| ResolutionError::missing(&node.id, format!("{edge_type} class")))
    }

    /// JSON object property; accepts an object or its JSON text.
    pub(crate) fn object_prop(
        &self,
        node: &NodeRecord,
        key: &str,
    ) -> std::result::Result<Map<String, JsonValue>, ResolutionError> {
        match node.properties.get(key) {
            None | Some(JsonValue::Null) => Ok(Map::new()),
            Some(JsonValue::Object(map)) => Ok(map.clone()),
            Some(JsonValue::String(text)) if text.trim().is_empty() => Ok(Map::new()),
            Some(JsonValue::String(text)) => match serde_json::from_str(text) {
                Ok(JsonValue::Object(map)) => Ok(map),
                Ok(other) => Err(ResolutionError::invalid(
                    &node.id,
                    key,
                    format!("expected an object, got {other}"),
                )),
                Err(err) => Err(ResolutionError::invalid(&node.id, key, err.to_string())),
            },
            Some(other) => Err(ResolutionError::invalid(
                &node.id,
                key,
                format!("expected an object, got {other}"),
            )),
        }
    }
}

/// Bounded retry for remote calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Pause before the second attempt; grows linearly.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Collaborators an action may use while applying.
pub struct ActionEnv<'a> {
    /// Graph store.
    pub store: &'a mut dyn GraphStore,
    /// Schema for controlled-term checks.
    pub schema: &'a Schema,
    /// Runner for RunScript.
    pub scripts: &'a dyn ScriptRunner,
    /// Runner for CallAPI.
    pub remote: &'a dyn ScriptRunner,
    /// Branch snapshots of the run.
    pub branches: &'a mut BranchStore,
    /// CallAPI retry policy.
    pub retry: RetryPolicy,
    /// Per-repository branch overrides for CallAPI.
    pub repo_branches: &'a BTreeMap<String, String>,
    /// Run-level row limit for GetData.
    pub limit: Option<i64>,
    /// Property holding entity values.
    pub value_property: &'a str,
}

/// Result of applying one action.
#[derive(Debug)]
pub struct Applied {
    /// Next tabular context.
    pub table: Table,
    /// Writes that undo the action, in execution order.
    pub compensation: Vec<GraphWrite>,
}

impl Applied {
    fn pure(table: Table) -> Self {
        Self {
            table,
            compensation: Vec::new(),
        }
    }
}

/// One executable step.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Query the graph.
    GetData(GetData),
    /// Local registered function.
    RunScript(RunScript),
    /// Literal statement.
    RunCypher(RunCypher),
    /// Remote function with retries.
    CallApi(CallApi),
    /// Extra label on existing nodes.
    AssignLabel(AssignLabel),
    /// Relationships between two classes' entities.
    Link(Link),
    /// Statistic entities linked to their dimensions.
    LinkStat(LinkStat),
    /// URI columns.
    BuildUri(BuildUri),
    /// Snapshot the context.
    BranchSave(BranchSave),
    /// Restore a snapshot.
    BranchLoad(BranchLoad),
    /// Join snapshots into the context.
    BranchCombine(BranchCombine),
}

impl Action {
    /// Method type this action was built from.
    pub fn kind(&self) -> MethodType {
        match self {
            Action::GetData(_) => MethodType::GetData,
            Action::RunScript(_) => MethodType::RunScript,
            Action::RunCypher(_) => MethodType::RunCypher,
            Action::CallApi(_) => MethodType::CallApi,
            Action::AssignLabel(_) => MethodType::AssignClass,
            Action::Link(_) => MethodType::Link,
            Action::LinkStat(_) => MethodType::LinkStat,
            Action::BuildUri(_) => MethodType::BuildUri,
            Action::BranchSave(_) => MethodType::BranchSave,
            Action::BranchLoad(_) => MethodType::BranchLoad,
            Action::BranchCombine(_) => MethodType::BranchCombine,
        }
    }

    /// True when applying the action writes to the graph.
    pub fn is_mutating(&self) -> bool {
        match self {
            Action::AssignLabel(_) | Action::Link(_) | Action::LinkStat(_) => true,
            Action::BuildUri(build) => build.store_on_existing_nodes,
            _ => false,
        }
    }

    /// Builds the action for a Method node of a primitive type.
    pub fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
        kind: MethodType,
        filters: &[&NodeRecord],
    ) -> std::result::Result<Self, ResolutionError> {
        let action = match kind {
            MethodType::GetData => Action::GetData(GetData::from_metadata(meta, node, filters)?),
            MethodType::RunScript => Action::RunScript(RunScript::from_metadata(meta, node)?),
            MethodType::RunCypher => Action::RunCypher(RunCypher::from_metadata(meta, node)?),
            MethodType::CallApi => Action::CallApi(CallApi::from_metadata(meta, node)?),
            MethodType::AssignClass => Action::AssignLabel(AssignLabel::from_metadata(meta, node)?),
            MethodType::Link => Action::Link(Link::from_metadata(meta, node)?),
            MethodType::LinkStat => Action::LinkStat(LinkStat::from_metadata(meta, node)?),
            MethodType::BuildUri => Action::BuildUri(BuildUri::from_metadata(meta, node)?),
            MethodType::BranchSave => Action::BranchSave(BranchSave::from_metadata(node)),
            MethodType::BranchLoad => Action::BranchLoad(BranchLoad::from_metadata(meta, node)?),
            MethodType::BranchCombine => {
                Action::BranchCombine(BranchCombine::from_metadata(meta, node)?)
            }
            MethodType::Filter
            | MethodType::ApplyStat
            | MethodType::Decode
            | MethodType::SubjectLevelLink => {
                return Err(ResolutionError::Placement {
                    id: node.id.clone(),
                    reason: format!("'{kind}' is not an executable action"),
                })
            }
        };
        Ok(action)
    }

    /// Applies the action to `table`.
    pub fn apply(&self, id: &str, env: &mut ActionEnv<'_>, table: Table) -> Result<Applied> {
        match self {
            Action::GetData(action) => action.apply(env).map(Applied::pure),
            Action::RunScript(action) => action.apply(env, table).map(Applied::pure),
            Action::RunCypher(action) => action.apply(env, table).map(Applied::pure),
            Action::CallApi(action) => action.apply(id, env, table).map(Applied::pure),
            Action::AssignLabel(action) => action.apply(id, env, table),
            Action::Link(action) => action.apply(id, env, table),
            Action::LinkStat(action) => action.apply(id, env, table),
            Action::BuildUri(action) => action.apply(id, env, table),
            Action::BranchSave(action) => {
                env.branches.save(&action.key, &table);
                Ok(Applied::pure(table))
            }
            Action::BranchLoad(action) => env.branches.load(&action.key).map(Applied::pure),
            Action::BranchCombine(action) => {
                env.branches.combine(&action.keys, table).map(Applied::pure)
            }
        }
    }
}

/// Column values of `table`, or a missing-column error naming `action`.
pub(crate) fn require_column<'t>(
    table: &'t Table,
    action: &str,
    column: &str,
) -> Result<Vec<&'t crate::value::Value>> {
    table
        .column(column)
        .ok_or_else(|| Error::missing_column(action, column))
}
