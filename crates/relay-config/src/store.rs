use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::options::OptionsFile;
use crate::record::{ServiceRecord, ServiceType};

/// Record store surface consumed by the runtime.
///
/// The runtime reads enabled records at startup, fetches single records on
/// demand and writes health status back through `update_service`.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get_service_by_id(&self, id: i64) -> Result<Option<ServiceRecord>>;
    async fn update_service(&self, record: &ServiceRecord) -> Result<()>;
    async fn get_enabled_services(&self) -> Result<Vec<ServiceRecord>>;
}

/// One `[[services]]` entry in the config file.
///
/// Carries typed args/env/headers for ergonomic TOML; `into_record`
/// synthesizes the JSON columns of the canonical [`ServiceRecord`].
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceEntry {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl ServiceEntry {
    pub fn into_record(self) -> ServiceRecord {
        let args_json = (!self.args.is_empty())
            .then(|| serde_json::to_string(&self.args).expect("string vec serializes"));
        let default_envs_json = (!self.env.is_empty())
            .then(|| serde_json::to_string(&self.env).expect("string map serializes"));
        let headers_json = (!self.headers.is_empty())
            .then(|| serde_json::to_string(&self.headers).expect("string map serializes"));

        ServiceRecord {
            id: self.id,
            display_name: self.display_name.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            installed_version: self.version.unwrap_or_default(),
            enabled: self.enabled,
            service_type: self.service_type,
            command: self.command,
            args_json,
            default_envs_json,
            headers_json,
            health_status: None,
            health_details_json: None,
            last_health_check: None,
        }
    }
}

/// Top-level config file: `[options]` plus `[[services]]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub options: OptionsFile,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::load_from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))
    }

    pub fn load_from_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        for entry in &config.services {
            let record = entry.clone().into_record();
            record.validate()?;
        }
        Ok(config)
    }
}

/// Store backed by the config file, with in-memory health write-backs.
///
/// The TOML file is configuration input, not a database: `update_service`
/// keeps the new record in memory so subsequent reads observe the health
/// columns, but nothing is written back to disk.
pub struct TomlServiceStore {
    records: RwLock<HashMap<i64, ServiceRecord>>,
}

impl TomlServiceStore {
    pub fn new(config: &RelayConfig) -> Self {
        let records = config
            .services
            .iter()
            .map(|entry| {
                let record = entry.clone().into_record();
                (record.id, record)
            })
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }
}

#[async_trait]
impl ServiceStore for TomlServiceStore {
    async fn get_service_by_id(&self, id: i64) -> Result<Option<ServiceRecord>> {
        Ok(self
            .records
            .read()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn update_service(&self, record: &ServiceRecord) -> Result<()> {
        self.records
            .write()
            .expect("store lock poisoned")
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_enabled_services(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .records
            .read()
            .expect("store lock poisoned")
            .values()
            .filter(|record| record.enabled)
            .cloned()
            .collect())
    }
}

/// In-memory store used by tests and embedding hosts.
#[derive(Default)]
pub struct MemoryServiceStore {
    records: RwLock<HashMap<i64, ServiceRecord>>,
}

impl MemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ServiceRecord) {
        self.records
            .write()
            .expect("store lock poisoned")
            .insert(record.id, record);
    }
}

#[async_trait]
impl ServiceStore for MemoryServiceStore {
    async fn get_service_by_id(&self, id: i64) -> Result<Option<ServiceRecord>> {
        Ok(self
            .records
            .read()
            .expect("store lock poisoned")
            .get(&id)
            .cloned())
    }

    async fn update_service(&self, record: &ServiceRecord) -> Result<()> {
        self.records
            .write()
            .expect("store lock poisoned")
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get_enabled_services(&self) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .records
            .read()
            .expect("store lock poisoned")
            .values()
            .filter(|record| record.enabled)
            .cloned()
            .collect())
    }
}
