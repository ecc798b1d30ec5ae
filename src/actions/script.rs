//! RunScript and CallAPI.

use std::thread;

use tracing::{debug, warn};

use super::{ActionEnv, Metadata};
use crate::error::{ResolutionError, Result};
use crate::model::NodeRecord;
use crate::scripts::{ScriptCall, BUILTIN_PACKAGE};
use crate::table::Table;

fn script_call(
    meta: &Metadata<'_>,
    node: &NodeRecord,
) -> std::result::Result<ScriptCall, ResolutionError> {
    let script = node
        .prop_str("script")
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolutionError::missing(&node.id, "'script' property"))?;
    let package = node
        .prop_str("package")
        .filter(|p| !p.is_empty())
        .unwrap_or(BUILTIN_PACKAGE);
    Ok(ScriptCall::new(package, script, meta.object_prop(node, "params")?))
}

/// Runs a registered function locally.
#[derive(Clone, Debug, PartialEq)]
pub struct RunScript {
    /// Function and parameters.
    pub call: ScriptCall,
}

impl RunScript {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        Ok(Self {
            call: script_call(meta, node)?,
        })
    }

    pub(crate) fn apply(&self, env: &mut ActionEnv<'_>, table: Table) -> Result<Table> {
        debug!(function = %self.call.qualified_name(), rows = table.len(), "actions.run_script");
        env.scripts.invoke(&self.call, table)
    }
}

/// Runs a function through the remote runner, retrying transient failures.
#[derive(Clone, Debug, PartialEq)]
pub struct CallApi {
    /// Function, parameters and source coordinates.
    pub call: ScriptCall,
}

impl CallApi {
    pub(crate) fn from_metadata(
        meta: &Metadata<'_>,
        node: &NodeRecord,
    ) -> std::result::Result<Self, ResolutionError> {
        let mut call = script_call(meta, node)?;
        call.repo = node.prop_str("repo").map(str::to_owned);
        call.branch = node.prop_str("branch").map(str::to_owned);
        call.path = node.prop_str("path").map(str::to_owned);
        Ok(Self { call })
    }

    /// Call with the run's repository branch override applied.
    pub fn effective_call(&self, env: &ActionEnv<'_>) -> ScriptCall {
        let mut call = self.call.clone();
        if let Some(branch) = call.repo.as_ref().and_then(|repo| env.repo_branches.get(repo)) {
            call.branch = Some(branch.clone());
        }
        call
    }

    pub(crate) fn apply(&self, id: &str, env: &mut ActionEnv<'_>, table: Table) -> Result<Table> {
        let call = self.effective_call(env);
        let attempts = env.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match env.remote.invoke(&call, table.clone()) {
                Ok(result) => return Ok(result),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let pause = env.retry.backoff * attempt;
                    warn!(
                        action = %id,
                        attempt,
                        error = %err,
                        backoff_ms = pause.as_millis() as u64,
                        "engine.call_api.retry"
                    );
                    thread::sleep(pause);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
