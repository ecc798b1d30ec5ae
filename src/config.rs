//! TOML configuration with environment overrides.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::RetryPolicy;
use crate::engine::RunOptions;
use crate::model::VALUE_PROPERTY;
use crate::query::ColumnNaming;
use crate::scripts::RemoteSettings;
use crate::store::Neo4jSettings;

pub const ENV_STORE_URL: &str = "DERIVATION_STORE_URL";
pub const ENV_STORE_USER: &str = "DERIVATION_STORE_USER";
pub const ENV_STORE_PASSWORD: &str = "DERIVATION_STORE_PASSWORD";
pub const ENV_REMOTE_TOKEN: &str = "DERIVATION_REMOTE_TOKEN";

/// Everything the CLI needs to build an engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub query: QuerySection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:7474".into(),
            database: "neo4j".into(),
            user: None,
            password: None,
            timeout_ms: 30_000,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMode {
    /// CallAPI runs registered scripts in-process.
    #[default]
    Local,
    /// CallAPI posts to `endpoint`.
    Http,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub mode: RemoteMode,
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub default_branch: Option<String>,
    pub branches: BTreeMap<String, String>,
}

impl Default for RemoteSection {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            mode: RemoteMode::Local,
            endpoint: None,
            token: None,
            timeout_ms: 60_000,
            max_attempts: retry.max_attempts,
            backoff_ms: retry.backoff.as_millis() as u64,
            default_branch: None,
            branches: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySection {
    pub value_property: String,
    pub naming: ColumnNaming,
}

impl Default for QuerySection {
    fn default() -> Self {
        Self {
            value_property: VALUE_PROPERTY.into(),
            naming: ColumnNaming::ShortLabel,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub limit: Option<i64>,
    pub apply_changes: bool,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            limit: None,
            apply_changes: true,
        }
    }
}

impl EngineConfig {
    /// Reads `explicit`, else the default location. A missing file yields
    /// defaults. Environment overrides are applied last.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let mut config = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => EngineConfig::default(),
        };
        config.path = path;
        config.apply_env(|key| env::var(key).ok());
        Ok(config)
    }

    /// Parses TOML text without touching the environment.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Overrides credentials and the store URL from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_STORE_URL) {
            self.store.url = url;
        }
        if let Some(user) = lookup(ENV_STORE_USER) {
            self.store.user = Some(user);
        }
        if let Some(password) = lookup(ENV_STORE_PASSWORD) {
            self.store.password = Some(password);
        }
        if let Some(token) = lookup(ENV_REMOTE_TOKEN) {
            self.remote.token = Some(token);
        }
    }

    /// File the configuration was read from or will be written to.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes pretty TOML to the load path or the default location.
    pub fn persist(&self) -> Result<PathBuf, ConfigError> {
        let target = match &self.path {
            Some(path) => path.clone(),
            None => default_config_path().ok_or(ConfigError::NoConfigPath)?,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized =
            toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }

    pub fn neo4j_settings(&self) -> Neo4jSettings {
        Neo4jSettings {
            url: self.store.url.clone(),
            database: self.store.database.clone(),
            user: self.store.user.clone(),
            password: self.store.password.clone(),
            timeout: Duration::from_millis(self.store.timeout_ms),
        }
    }

    /// Settings of the HTTP runner; `None` in local mode.
    pub fn remote_settings(&self) -> Result<Option<RemoteSettings>, ConfigError> {
        if self.remote.mode == RemoteMode::Local {
            return Ok(None);
        }
        let endpoint = self
            .remote
            .endpoint
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or(ConfigError::Missing {
                key: "remote.endpoint",
            })?;
        Ok(Some(RemoteSettings {
            endpoint,
            token: self.remote.token.clone(),
            timeout: Duration::from_millis(self.remote.timeout_ms),
            default_branch: self.remote.default_branch.clone(),
        }))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.remote.max_attempts.max(1),
            backoff: Duration::from_millis(self.remote.backoff_ms),
        }
    }

    /// Run options from the `[run]` section and the per-repository branches.
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            limit: self.run.limit,
            apply_changes: self.run.apply_changes,
            repo_branches: self.remote.branches.clone(),
        }
    }
}

fn read_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config key '{key}' is required")]
    Missing { key: &'static str },
    #[error("no config directory found; pass --config")]
    NoConfigPath,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("derivation").join("config.toml"))
}
