//! Remote script execution over HTTP.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use super::{ScriptCall, ScriptRunner};
use crate::error::{Error, Result};
use crate::table::Table;

/// Endpoint and credentials of the remote runner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteSettings {
    /// Base URL; calls go to `{endpoint}/run`.
    pub endpoint: String,
    /// Bearer token.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Branch sent for calls that name a repository but no branch.
    pub default_branch: Option<String>,
}

/// Runner that ships the table and parameters to a remote service.
#[derive(Debug)]
pub struct HttpRemote {
    settings: RemoteSettings,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    #[serde(default)]
    data: Option<Vec<JsonValue>>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpRemote {
    /// Builds the HTTP client.
    pub fn new(settings: RemoteSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::Remote {
                function: String::new(),
                message: format!("failed to build http client: {e}"),
                retryable: false,
            })?;
        Ok(Self { settings, client })
    }

    fn url(&self) -> String {
        format!("{}/run", self.settings.endpoint.trim_end_matches('/'))
    }
}

impl ScriptRunner for HttpRemote {
    fn check(&self, call: &ScriptCall) -> Result<()> {
        if call.package.is_empty() || call.script.is_empty() {
            return Err(Error::ScriptNotFound {
                package: call.package.clone(),
                script: call.script.clone(),
            });
        }
        Ok(())
    }

    fn invoke(&self, call: &ScriptCall, table: Table) -> Result<Table> {
        let function = call.qualified_name();
        let body = json!({
            "function": call.script,
            "package": call.package,
            "repo": call.repo,
            "branch": call.branch.as_ref().or(self.settings.default_branch.as_ref()),
            "path": call.path,
            "params": call.params,
            "data": table.to_json_records(),
        });
        let mut request = self.client.post(self.url()).json(&body);
        if let Some(token) = &self.settings.token {
            request = request.bearer_auth(token);
        }
        debug!(function = %function, rows = table.len(), "scripts.remote.request");
        let response = request.send().map_err(|e| Error::Remote {
            function: function.clone(),
            message: e.to_string(),
            retryable: e.is_timeout() || e.is_connect() || e.is_request(),
        })?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(Error::Remote {
                function,
                message: format!("http {status}: {text}"),
                retryable: status.is_server_error() || status.as_u16() == 429,
            });
        }
        let parsed: RunResponse = response.json().map_err(|e| Error::Remote {
            function: function.clone(),
            message: format!("malformed response: {e}"),
            retryable: false,
        })?;
        if let Some(message) = parsed.error {
            return Err(Error::Script {
                package: call.package.clone(),
                script: call.script.clone(),
                message,
            });
        }
        Table::from_json_records(&parsed.data.unwrap_or_default())
    }
}
