//! Executor: threads one table through a resolved chain and compensates
//! graph writes when a step fails.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::resolve::{ResolvedMethod, Resolver};
use crate::actions::{ActionEnv, BranchStore, RetryPolicy};
use crate::error::{Error, ResolutionError, Result};
use crate::model::{MethodDocument, MethodType, Schema, VALUE_PROPERTY};
use crate::query::ColumnNaming;
use crate::scripts::{ScriptRegistry, ScriptRunner};
use crate::store::{GraphStore, GraphWrite};
use crate::table::Table;

/// Per-run settings.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOptions {
    /// Row limit applied to every GetData of the run.
    pub limit: Option<i64>,
    /// When false, graph-writing actions are skipped.
    pub apply_changes: bool,
    /// Repository → branch overrides for CallAPI.
    pub repo_branches: BTreeMap<String, String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: None,
            apply_changes: true,
            repo_branches: BTreeMap::new(),
        }
    }
}

impl RunOptions {
    /// Options for a run that leaves the graph untouched.
    pub fn dry_run() -> Self {
        Self {
            apply_changes: false,
            ..Self::default()
        }
    }
}

/// Lifecycle of one action within a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Not dispatched yet.
    Pending,
    /// Being applied.
    Running,
    /// Applied; its writes stay unless a later action fails.
    Applied,
    /// Apply failed; the run stopped here.
    Failed,
    /// Its writes were compensated.
    RolledBack,
    /// Not applied because the run does not write to the graph.
    Skipped,
    /// Compensation failed; the store is partially compensated.
    RollbackFailed,
}

impl ActionState {
    /// Name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionState::Pending => "pending",
            ActionState::Running => "running",
            ActionState::Applied => "applied",
            ActionState::Failed => "failed",
            ActionState::RolledBack => "rolled_back",
            ActionState::Skipped => "skipped",
            ActionState::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Action id.
    pub id: String,
    /// Action kind.
    pub kind: MethodType,
    /// Final state.
    pub state: ActionState,
    /// Rows of the context after the action.
    pub rows: Option<usize>,
    /// Whether the action writes to the graph.
    pub mutating: bool,
    /// Wall time of the apply step.
    pub elapsed_ms: u64,
}

/// Compensation of one applied action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollbackEntry {
    /// Action id.
    pub action_id: String,
    /// Action kind.
    pub kind: MethodType,
    /// When the action was applied.
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    /// Writes that undo the action, in order.
    pub writes: Vec<GraphWrite>,
}

/// Compensations registered by a run, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RollbackLog {
    /// Root method of the run.
    pub root: String,
    /// Entries in registration order.
    pub entries: Vec<RollbackEntry>,
}

impl RollbackLog {
    /// True when the run wrote nothing that needs undoing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pretty JSON text.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a log written by [`RollbackLog::to_json_string`].
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Result of a successful run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    /// Final context.
    pub table: Table,
    /// One record per resolved action.
    pub records: Vec<ActionRecord>,
    /// Compensations of the run's writes.
    pub rollback_log: RollbackLog,
}

/// One compensation that failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackFailure {
    /// Action whose compensation failed.
    pub action_id: String,
    /// Error text.
    pub error: String,
}

/// Details of a failed run.
#[derive(Debug)]
pub struct RunFailure {
    /// Failing action.
    pub action_id: String,
    /// Its kind.
    pub kind: MethodType,
    /// Position in the resolved chain.
    pub index: usize,
    /// Underlying error.
    pub cause: Error,
    /// Records of every action, including rolled-back ones.
    pub records: Vec<ActionRecord>,
    /// Compensations that failed; empty for a clean rollback.
    pub rollback_errors: Vec<RollbackFailure>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action '{}' ({}) at position {} failed: {}",
            self.action_id, self.kind, self.index, self.cause
        )?;
        if !self.rollback_errors.is_empty() {
            write!(f, "; {} compensation(s) failed:", self.rollback_errors.len())?;
            for failure in &self.rollback_errors {
                write!(f, " [{}: {}]", failure.action_id, failure.error)?;
            }
        }
        Ok(())
    }
}

/// Runs methods stored in a graph store.
pub struct Engine<S: GraphStore> {
    store: S,
    scripts: ScriptRegistry,
    remote: Option<Box<dyn ScriptRunner>>,
    retry: RetryPolicy,
    value_property: String,
    naming: ColumnNaming,
}

impl<S: GraphStore> Engine<S> {
    /// Engine with the built-in scripts; CallAPI runs them locally too.
    pub fn new(store: S) -> Self {
        Self {
            store,
            scripts: ScriptRegistry::with_builtins(),
            remote: None,
            retry: RetryPolicy::default(),
            value_property: VALUE_PROPERTY.to_owned(),
            naming: ColumnNaming::ShortLabel,
        }
    }

    /// Replaces the local script registry.
    pub fn with_scripts(mut self, scripts: ScriptRegistry) -> Self {
        self.scripts = scripts;
        self
    }

    /// Runner used by CallAPI.
    pub fn with_remote(mut self, remote: Box<dyn ScriptRunner>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// CallAPI retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Property projected into value columns.
    pub fn with_value_property(mut self, value_property: impl Into<String>) -> Self {
        self.value_property = value_property.into();
        self
    }

    /// Column naming mode.
    pub fn with_naming(mut self, naming: ColumnNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Underlying store, mutably.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Consumes the engine.
    pub fn into_store(self) -> S {
        self.store
    }

    fn remote(&self) -> &dyn ScriptRunner {
        match &self.remote {
            Some(remote) => remote.as_ref(),
            None => &self.scripts,
        }
    }

    /// Resolves `doc` against `schema` without touching the store.
    pub fn resolve(
        &self,
        doc: &MethodDocument,
        schema: &Schema,
    ) -> std::result::Result<ResolvedMethod, ResolutionError> {
        Resolver::new(schema, &self.scripts, self.remote())
            .with_value_property(&self.value_property)
            .with_naming(self.naming)
            .resolve(doc)
    }

    /// Loads, resolves and executes the method rooted at `root_id`.
    pub fn run(&mut self, root_id: &str, options: &RunOptions) -> Result<RunOutcome> {
        let doc = self.store.load_method(root_id)?;
        let schema = self.store.load_schema()?;
        let resolved = self.resolve(&doc, &schema)?;
        info!(
            root = %root_id,
            steps = resolved.steps.len(),
            mutating = resolved.mutating(),
            apply_changes = options.apply_changes,
            "engine.run.start"
        );
        self.execute(&resolved, &schema, options)
    }

    /// Executes an already resolved chain.
    pub fn execute(
        &mut self,
        resolved: &ResolvedMethod,
        schema: &Schema,
        options: &RunOptions,
    ) -> Result<RunOutcome> {
        let mut records: Vec<ActionRecord> = resolved
            .steps
            .iter()
            .map(|step| ActionRecord {
                id: step.id.clone(),
                kind: step.action.kind(),
                state: ActionState::Pending,
                rows: None,
                mutating: step.action.is_mutating(),
                elapsed_ms: 0,
            })
            .collect();
        let mut log = RollbackLog {
            root: resolved.root.clone(),
            entries: Vec::new(),
        };
        let mut owners: Vec<usize> = Vec::new();
        let mut table = Table::empty();
        let mut branches = BranchStore::default();

        let remote: &dyn ScriptRunner = match &self.remote {
            Some(remote) => remote.as_ref(),
            None => &self.scripts,
        };
        let failure = {
            let mut env = ActionEnv {
                store: &mut self.store,
                schema,
                scripts: &self.scripts,
                remote,
                branches: &mut branches,
                retry: self.retry,
                repo_branches: &options.repo_branches,
                limit: options.limit,
                value_property: &self.value_property,
            };
            let mut failure = None;
            for (index, step) in resolved.steps.iter().enumerate() {
                let record = &mut records[index];
                if record.mutating && !options.apply_changes {
                    record.state = ActionState::Skipped;
                    record.rows = Some(table.len());
                    debug!(action = %step.id, kind = %record.kind, "engine.action.skipped");
                    continue;
                }
                record.state = ActionState::Running;
                debug!(action = %step.id, kind = %record.kind, index, "engine.action.running");
                let started = Instant::now();
                let outcome = step.action.apply(&step.id, &mut env, mem::take(&mut table));
                record.elapsed_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(applied) => {
                        table = applied.table;
                        record.state = ActionState::Applied;
                        record.rows = Some(table.len());
                        info!(
                            action = %step.id,
                            kind = %record.kind,
                            rows = table.len(),
                            elapsed_ms = record.elapsed_ms,
                            "engine.action.applied"
                        );
                        if !applied.compensation.is_empty() {
                            owners.push(index);
                            log.entries.push(RollbackEntry {
                                action_id: step.id.clone(),
                                kind: record.kind,
                                applied_at: OffsetDateTime::now_utc(),
                                writes: applied.compensation,
                            });
                        }
                    }
                    Err(cause) => {
                        record.state = ActionState::Failed;
                        warn!(action = %step.id, kind = %record.kind, error = %cause, "engine.action.failed");
                        failure = Some((index, cause));
                        break;
                    }
                }
            }
            failure
        };

        let Some((index, cause)) = failure else {
            info!(root = %resolved.root, rows = table.len(), writes = log.entries.len(), "engine.run.done");
            return Ok(RunOutcome {
                table,
                records,
                rollback_log: log,
            });
        };

        let results = compensate(&mut self.store, &log);
        let mut rollback_errors = Vec::new();
        for (owner, result) in owners.iter().rev().zip(results) {
            match result {
                Ok(()) => records[*owner].state = ActionState::RolledBack,
                Err(failure) => {
                    records[*owner].state = ActionState::RollbackFailed;
                    rollback_errors.push(failure);
                }
            }
        }
        let step = &resolved.steps[index];
        let failure = Box::new(RunFailure {
            action_id: step.id.clone(),
            kind: step.action.kind(),
            index,
            cause,
            records,
            rollback_errors,
        });
        if failure.rollback_errors.is_empty() {
            Err(Error::ActionFailed(failure))
        } else {
            Err(Error::PartialRollback(failure))
        }
    }

    /// Replays a persisted rollback log, newest entry first.
    pub fn rollback(&mut self, log: &RollbackLog) -> Vec<RollbackFailure> {
        compensate(&mut self.store, log)
            .into_iter()
            .filter_map(|result| result.err())
            .collect()
    }
}

/// Applies every entry's writes, newest entry first. One result per entry,
/// in the order processed; a failing entry does not stop the others.
fn compensate<S: GraphStore>(
    store: &mut S,
    log: &RollbackLog,
) -> Vec<std::result::Result<(), RollbackFailure>> {
    log.entries
        .iter()
        .rev()
        .map(|entry| {
            for write in &entry.writes {
                if let Err(err) = store.apply(write) {
                    warn!(action = %entry.action_id, error = %err, "engine.rollback.failed");
                    return Err(RollbackFailure {
                        action_id: entry.action_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
            debug!(action = %entry.action_id, writes = entry.writes.len(), "engine.rollback.applied");
            Ok(())
        })
        .collect()
}
