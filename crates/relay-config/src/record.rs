use std::collections::HashMap;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Transport type of an upstream MCP service.
///
/// Serialized with snake_case tags so config and API payloads use
/// `type = "stdio"` etc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Child process speaking JSON-RPC on stdin/stdout.
    Stdio,
    /// Remote server reached over Server-Sent Events.
    Sse,
    /// Remote server reached over the streamable HTTP protocol.
    StreamableHttp,
}

impl ServiceType {
    /// Short human-readable label for the transport type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        }
    }

    /// Returns true for transports that talk to a remote URL.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Sse | Self::StreamableHttp)
    }
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One registered upstream service as supplied by the record store.
///
/// `command` doubles as the executable name for stdio services and the
/// upstream URL for the HTTP-based transports. The `*_json` columns carry
/// optional JSON documents; the `decoded_*` accessors never fail: malformed
/// content is logged and replaced by an empty container so a bad row can
/// still be proxied with defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub installed_version: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_envs_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_details_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

impl Default for ServiceType {
    fn default() -> Self {
        Self::Stdio
    }
}

impl ServiceRecord {
    /// Ordered argument list for stdio services.
    pub fn decoded_args(&self) -> Vec<String> {
        decode_json_column(self.args_json.as_deref(), "args_json", &self.name)
    }

    /// Environment overrides for stdio services, applied on top of the
    /// process environment.
    pub fn decoded_envs(&self) -> HashMap<String, String> {
        decode_json_column(self.default_envs_json.as_deref(), "default_envs_json", &self.name)
    }

    /// HTTP headers for sse / streamable_http services.
    pub fn decoded_headers(&self) -> HashMap<String, String> {
        decode_json_column(self.headers_json.as_deref(), "headers_json", &self.name)
    }

    /// Checks the per-transport command invariant: stdio needs an executable
    /// name, remote transports need an http(s) URL.
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            bail!(
                "service '{}' ({}): 'command' must not be empty",
                self.name,
                self.service_type
            );
        }
        if self.service_type.is_remote()
            && !(self.command.starts_with("http://") || self.command.starts_with("https://"))
        {
            bail!(
                "service '{}' ({}): 'command' must be an http(s) URL, got '{}'",
                self.name,
                self.service_type,
                self.command
            );
        }
        Ok(())
    }
}

fn decode_json_column<T>(raw: Option<&str>, column: &str, service: &str) -> T
where
    T: DeserializeOwned + Default,
{
    let Some(raw) = raw else {
        return T::default();
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return T::default();
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                service = %service,
                column,
                error = %error,
                "malformed JSON column, falling back to empty"
            );
            T::default()
        }
    }
}
