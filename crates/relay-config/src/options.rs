use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const OPT_SERVER_ADDRESS: &str = "server_address";
pub const OPT_HEARTBEAT_INTERVAL_SECS: &str = "heartbeat_interval_secs";
pub const OPT_HEARTBEAT_TIMEOUT_SECS: &str = "heartbeat_timeout_secs";
pub const OPT_HEARTBEAT_JITTER_SECS: &str = "heartbeat_jitter_secs";

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_JITTER_SECS: u64 = 0;

/// `[options]` section of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_jitter_secs: Option<u64>,
}

/// Live option map shared across the runtime.
///
/// Values are looked up on every use rather than captured at startup, so an
/// admin update takes effect on the next heartbeat tick without restarting
/// anything. Absent or unparsable values fall back to the documented
/// defaults.
#[derive(Debug, Default)]
pub struct RuntimeOptions {
    values: RwLock<HashMap<String, String>>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(options: &OptionsFile) -> Self {
        let runtime = Self::new();
        if let Some(address) = &options.server_address {
            runtime.set(OPT_SERVER_ADDRESS, address.clone());
        }
        if let Some(secs) = options.heartbeat_interval_secs {
            runtime.set(OPT_HEARTBEAT_INTERVAL_SECS, secs.to_string());
        }
        if let Some(secs) = options.heartbeat_timeout_secs {
            runtime.set(OPT_HEARTBEAT_TIMEOUT_SECS, secs.to_string());
        }
        if let Some(secs) = options.heartbeat_jitter_secs {
            runtime.set(OPT_HEARTBEAT_JITTER_SECS, secs.to_string());
        }
        runtime
    }

    pub fn set(&self, key: &str, value: String) {
        self.values
            .write()
            .expect("options lock poisoned")
            .insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .expect("options lock poisoned")
            .get(key)
            .cloned()
    }

    /// External base URL advertised to reconnecting clients. Empty when the
    /// host has not configured one.
    pub fn server_address(&self) -> String {
        self.get(OPT_SERVER_ADDRESS).unwrap_or_default()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.duration_secs(OPT_HEARTBEAT_INTERVAL_SECS, DEFAULT_HEARTBEAT_INTERVAL_SECS)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.duration_secs(OPT_HEARTBEAT_TIMEOUT_SECS, DEFAULT_HEARTBEAT_TIMEOUT_SECS)
    }

    pub fn heartbeat_jitter(&self) -> Duration {
        self.duration_secs(OPT_HEARTBEAT_JITTER_SECS, DEFAULT_HEARTBEAT_JITTER_SECS)
    }

    fn duration_secs(&self, key: &str, default_secs: u64) -> Duration {
        let secs = self
            .get(key)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(default_secs);
        Duration::from_secs(secs)
    }
}
