//! Script registry and runners.
//!
//! RunScript and CallAPI never evaluate free-form code: a callable is a
//! function registered under `(package, script)` taking the current table
//! and a parameter object and returning the next table. The registry itself
//! is the local runner; [`HttpRemote`] forwards calls to a remote service.

pub mod basic_df_ops;
mod remote;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

pub use remote::{HttpRemote, RemoteSettings};

use crate::error::{Error, Result};
use crate::table::Table;

/// Script parameters.
pub type ScriptParams = Map<String, JsonValue>;

/// Registered callable.
pub type ScriptFn = Arc<dyn Fn(Table, &ScriptParams) -> Result<Table> + Send + Sync>;

/// Package holding the built-in table operations.
pub const BUILTIN_PACKAGE: &str = "basic_df_ops";

/// One script invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScriptCall {
    /// Package name.
    pub package: String,
    /// Function name.
    pub script: String,
    /// Keyword parameters.
    pub params: ScriptParams,
    /// Source repository (remote calls).
    pub repo: Option<String>,
    /// Repository branch (remote calls).
    pub branch: Option<String>,
    /// Path of the implementation inside the repository (remote calls).
    pub path: Option<String>,
}

impl ScriptCall {
    /// Call of `package.script` with parameters.
    pub fn new(package: impl Into<String>, script: impl Into<String>, params: ScriptParams) -> Self {
        Self {
            package: package.into(),
            script: script.into(),
            params,
            ..Self::default()
        }
    }

    /// `package.script`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.package, self.script)
    }
}

/// Executes script calls.
pub trait ScriptRunner {
    /// Fails when the runner cannot serve `call`.
    fn check(&self, call: &ScriptCall) -> Result<()>;

    /// Runs `call` over `table`.
    fn invoke(&self, call: &ScriptCall, table: Table) -> Result<Table>;
}

/// Static mapping from `(package, script)` to functions.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: BTreeMap<(String, String), ScriptFn>,
}

impl fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.scripts.keys().map(|(p, s)| format!("{p}.{s}")))
            .finish()
    }
}

impl ScriptRegistry {
    /// Registry without any function.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry holding the built-in package.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        basic_df_ops::register(&mut registry);
        registry
    }

    /// Registers or replaces a function.
    pub fn register<F>(&mut self, package: &str, script: &str, function: F)
    where
        F: Fn(Table, &ScriptParams) -> Result<Table> + Send + Sync + 'static,
    {
        self.scripts
            .insert((package.to_owned(), script.to_owned()), Arc::new(function));
    }

    /// Looks up a function.
    pub fn get(&self, package: &str, script: &str) -> Option<&ScriptFn> {
        self.scripts.get(&(package.to_owned(), script.to_owned()))
    }

    /// True when `package.script` is registered.
    pub fn contains(&self, package: &str, script: &str) -> bool {
        self.get(package, script).is_some()
    }

    /// Registered names as `package.script`.
    pub fn names(&self) -> Vec<String> {
        self.scripts.keys().map(|(p, s)| format!("{p}.{s}")).collect()
    }
}

impl ScriptRunner for ScriptRegistry {
    fn check(&self, call: &ScriptCall) -> Result<()> {
        if self.contains(&call.package, &call.script) {
            Ok(())
        } else {
            Err(Error::ScriptNotFound {
                package: call.package.clone(),
                script: call.script.clone(),
            })
        }
    }

    fn invoke(&self, call: &ScriptCall, table: Table) -> Result<Table> {
        let function = self
            .get(&call.package, &call.script)
            .ok_or_else(|| Error::ScriptNotFound {
                package: call.package.clone(),
                script: call.script.clone(),
            })?;
        function(table, &call.params).map_err(|err| match err {
            Error::Script { .. } | Error::ScriptNotFound { .. } => err,
            other => Error::Script {
                package: call.package.clone(),
                script: call.script.clone(),
                message: other.to_string(),
            },
        })
    }
}
