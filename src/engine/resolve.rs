//! Method document → ordered list of primitive actions.

use tracing::debug;

use super::chain::{ChainIndex, MethodIdx};
use super::expand;
use crate::actions::{Action, Metadata, Tags};
use crate::error::ResolutionError;
use crate::model::{MethodDocument, MethodType, Schema, VALUE_PROPERTY};
use crate::query::ColumnNaming;
use crate::scripts::ScriptRunner;

/// One executable action of a resolved chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Step {
    /// Method id, or a generated id for SuperMethod expansions.
    pub id: String,
    /// The action.
    pub action: Action,
}

impl Step {
    /// Pairs an id with an action.
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }
}

/// Flattened chain ready for execution.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedMethod {
    /// Root method id.
    pub root: String,
    /// Actions in execution order.
    pub steps: Vec<Step>,
}

impl ResolvedMethod {
    /// Number of actions that write to the graph.
    pub fn mutating(&self) -> usize {
        self.steps.iter().filter(|s| s.action.is_mutating()).count()
    }
}

/// Builds [`ResolvedMethod`]s against a schema and the available runners.
pub struct Resolver<'a> {
    schema: &'a Schema,
    scripts: &'a dyn ScriptRunner,
    remote: &'a dyn ScriptRunner,
    value_property: &'a str,
    naming: ColumnNaming,
}

impl<'a> Resolver<'a> {
    /// Resolver with the default value property and short-label naming.
    pub fn new(
        schema: &'a Schema,
        scripts: &'a dyn ScriptRunner,
        remote: &'a dyn ScriptRunner,
    ) -> Self {
        Self {
            schema,
            scripts,
            remote,
            value_property: VALUE_PROPERTY,
            naming: ColumnNaming::ShortLabel,
        }
    }

    /// Overrides the property projected into value columns.
    pub fn with_value_property(mut self, value_property: &'a str) -> Self {
        self.value_property = value_property;
        self
    }

    /// Overrides the column naming mode.
    pub fn with_naming(mut self, naming: ColumnNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Checks the document, orders its chains, expands SuperMethods and
    /// verifies every script reference.
    pub fn resolve(&self, doc: &MethodDocument) -> Result<ResolvedMethod, ResolutionError> {
        doc.validate()?;
        let index = ChainIndex::build(doc)?;
        let mut tags = Tags::default();
        let mut steps = Vec::new();
        self.resolve_group(doc, &index, index.root(), &mut tags, &mut steps)?;
        for step in &steps {
            self.check_script(step)?;
        }
        debug!(root = %doc.name, methods = index.len(), steps = steps.len(), "engine.resolve.done");
        Ok(ResolvedMethod {
            root: doc.name.clone(),
            steps,
        })
    }

    fn resolve_group(
        &self,
        doc: &MethodDocument,
        index: &ChainIndex<'_>,
        parent: MethodIdx,
        tags: &mut Tags,
        steps: &mut Vec<Step>,
    ) -> Result<(), ResolutionError> {
        let children = index.children(parent);
        let kinds = children
            .iter()
            .map(|&child| {
                let node = index.node(child);
                match node.method_type().filter(|t| !t.is_empty()) {
                    None => Ok(None),
                    Some(text) => text.parse::<MethodType>().map(Some).map_err(|kind| {
                        ResolutionError::UnknownType {
                            id: node.id.clone(),
                            kind,
                        }
                    }),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut position = 0;
        while position < children.len() {
            let child = children[position];
            let node = index.node(child);
            let kind = match kinds[position] {
                Some(kind) => kind,
                None if index.children(child).is_empty() => {
                    return Err(ResolutionError::missing(&node.id, "'type' property"));
                }
                None => {
                    debug!(method = %node.id, "engine.resolve.nested");
                    self.resolve_group(doc, index, child, tags, steps)?;
                    position += 1;
                    continue;
                }
            };
            if !index.children(child).is_empty() {
                return Err(ResolutionError::Placement {
                    id: node.id.clone(),
                    reason: format!("a '{kind}' action cannot own child actions"),
                });
            }
            let meta = Metadata {
                doc,
                schema: self.schema,
                tags,
                value_property: self.value_property,
                naming: self.naming,
            };
            match kind {
                MethodType::GetData => {
                    if position != 0 {
                        return Err(ResolutionError::Placement {
                            id: node.id.clone(),
                            reason: "get_data must be the first action of its chain".into(),
                        });
                    }
                    let mut end = position + 1;
                    while end < children.len() && kinds[end] == Some(MethodType::Filter) {
                        end += 1;
                    }
                    let filters: Vec<_> = children[position + 1..end]
                        .iter()
                        .map(|&f| index.node(f))
                        .collect();
                    let action = Action::from_metadata(&meta, node, kind, &filters)?;
                    if let Action::GetData(get) = &action {
                        tags.observe(&get.request);
                    }
                    steps.push(Step::new(node.id.clone(), action));
                    position = end;
                    continue;
                }
                MethodType::Filter => {
                    return Err(ResolutionError::Placement {
                        id: node.id.clone(),
                        reason: "filter must directly follow get_data".into(),
                    });
                }
                kind if kind.is_super() => {
                    let expanded = expand::expand(kind, &meta, node)?;
                    debug!(method = %node.id, kind = %kind, generated = expanded.len(), "engine.resolve.expanded");
                    steps.extend(expanded);
                }
                kind => {
                    let action = Action::from_metadata(&meta, node, kind, &[])?;
                    steps.push(Step::new(node.id.clone(), action));
                }
            }
            position += 1;
        }
        Ok(())
    }

    fn check_script(&self, step: &Step) -> Result<(), ResolutionError> {
        let (runner, call) = match &step.action {
            Action::RunScript(run) => (self.scripts, &run.call),
            Action::CallApi(api) => (self.remote, &api.call),
            _ => return Ok(()),
        };
        runner
            .check(call)
            .map_err(|_| ResolutionError::UnregisteredScript {
                id: step.id.clone(),
                package: call.package.clone(),
                script: call.script.clone(),
            })
    }
}
