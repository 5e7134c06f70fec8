use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rmcp::model::{Implementation, Tool};
use serde_json::{Map, Value};

use relay_config::{ServiceRecord, ServiceType};

use crate::cache::ToolsListCache;
use crate::health::{HealthStatus, ServiceHealth};
use crate::instance::{InstanceCache, SharedMcpInstance};
use crate::keys;

const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_HEALTH_CHECK_TIMEOUT_SECS: &str = "health_check_timeout_secs";

/// A proxied upstream as seen by the manager and the health checker.
#[async_trait]
pub trait ProxiedService: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> &str;
    fn service_type(&self) -> ServiceType;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
    /// Deep health probe. `Ok` carries the observed health (which may be
    /// unhealthy); `Err` means the probe itself could not run.
    async fn check_health(&self) -> Result<ServiceHealth>;
    fn get_health(&self) -> ServiceHealth;
    fn get_config(&self) -> Map<String, Value>;
    fn update_config(&self, config: Map<String, Value>) -> Result<()>;
    fn health_check_timeout(&self) -> Duration;
    fn get_tools(&self) -> Vec<Tool>;
    fn server_info(&self) -> Option<Implementation>;
}

/// Bookkeeping shared by every service implementation: identity, running
/// flag, config map and the mutable health snapshot.
pub struct BaseService {
    id: i64,
    name: String,
    service_type: ServiceType,
    running: AtomicBool,
    config: RwLock<Map<String, Value>>,
    health: RwLock<ServiceHealth>,
}

impl BaseService {
    pub fn new(id: i64, name: String, service_type: ServiceType) -> Self {
        Self {
            id,
            name,
            service_type,
            running: AtomicBool::new(false),
            config: RwLock::new(Map::new()),
            health: RwLock::new(ServiceHealth::default()),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flips the running flag; transitioning to running stamps the start
    /// time on the health snapshot.
    pub fn set_running(&self, running: bool) {
        let was_running = self.running.swap(running, Ordering::SeqCst);
        if running && !was_running {
            let mut health = self.health.write().expect("health lock poisoned");
            health.start_time = Some(Utc::now());
            health.up_time_seconds = 0;
        }
    }

    pub fn health(&self) -> ServiceHealth {
        self.health.read().expect("health lock poisoned").clone()
    }

    pub fn set_health(&self, health: ServiceHealth) {
        *self.health.write().expect("health lock poisoned") = health;
    }

    /// Applies one health observation under the warning-level rule.
    pub fn update_health(&self, status: HealthStatus, response_time_ms: u64, error_message: &str) {
        self.health
            .write()
            .expect("health lock poisoned")
            .apply(status, response_time_ms, error_message);
    }

    pub fn with_health<F: FnOnce(&mut ServiceHealth)>(&self, mutate: F) {
        mutate(&mut self.health.write().expect("health lock poisoned"));
    }

    pub fn config(&self) -> Map<String, Value> {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Merges the given keys into the config map.
    pub fn merge_config(&self, config: Map<String, Value>) {
        let mut current = self.config.write().expect("config lock poisoned");
        for (key, value) in config {
            current.insert(key, value);
        }
    }
}

/// Concrete service for stdio / sse / streamable_http upstreams.
///
/// Holds the originating record for lazy re-creation and the shared
/// instance as a nullable handle; the instance cache stays the owner of
/// instance lifetime.
pub struct MonitoredProxiedService {
    base: BaseService,
    record: RwLock<ServiceRecord>,
    instances: Arc<InstanceCache>,
    tools_cache: Arc<ToolsListCache>,
    instance: RwLock<Option<Arc<SharedMcpInstance>>>,
}

impl MonitoredProxiedService {
    pub fn new(
        record: ServiceRecord,
        instances: Arc<InstanceCache>,
        tools_cache: Arc<ToolsListCache>,
    ) -> Self {
        let base = BaseService::new(record.id, record.name.clone(), record.service_type);
        Self {
            base,
            record: RwLock::new(record),
            instances,
            tools_cache,
            instance: RwLock::new(None),
        }
    }

    pub fn record(&self) -> ServiceRecord {
        self.record.read().expect("record lock poisoned").clone()
    }

    pub fn set_record(&self, record: ServiceRecord) {
        *self.record.write().expect("record lock poisoned") = record;
    }

    fn current_instance(&self) -> Option<Arc<SharedMcpInstance>> {
        let held = self
            .instance
            .read()
            .expect("instance lock poisoned")
            .clone();
        // A heartbeat eviction invalidates the held handle: only an instance
        // still resident under the canonical key counts as live.
        let record = self.record.read().expect("record lock poisoned");
        let key = keys::shared_service_cache_key(record.id);
        drop(record);
        match (held, self.instances.get(&key)) {
            (Some(held), Some(resident)) if Arc::ptr_eq(&held, &resident) => Some(held),
            (_, resident) => {
                *self.instance.write().expect("instance lock poisoned") = resident.clone();
                resident
            }
        }
    }

    /// Returns the live shared instance, building it under the canonical
    /// cache key if missing.
    async fn ensure_instance(&self) -> Result<Arc<SharedMcpInstance>> {
        if let Some(instance) = self.current_instance() {
            return Ok(instance);
        }

        let record = self.record();
        let cache_key = keys::shared_service_cache_key(record.id);
        let detail = keys::shared_service_instance_name(record.id);
        let envs = record.default_envs_json.clone();
        let instance = self
            .instances
            .get_or_create(&record, &cache_key, &detail, envs.as_deref())
            .await?;
        *self.instance.write().expect("instance lock poisoned") = Some(instance.clone());
        Ok(instance)
    }
}

#[async_trait]
impl ProxiedService for MonitoredProxiedService {
    fn id(&self) -> i64 {
        self.base.id()
    }

    fn name(&self) -> &str {
        self.base.name()
    }

    fn service_type(&self) -> ServiceType {
        self.base.service_type()
    }

    async fn start(&self) -> Result<()> {
        if self.base.is_running() {
            return Ok(());
        }

        self.base.with_health(|health| {
            health.status = HealthStatus::Starting;
        });

        let instance = match self.ensure_instance().await {
            Ok(instance) => instance,
            Err(error) => {
                self.base
                    .update_health(HealthStatus::Unhealthy, 0, &format!("{error:#}"));
                return Err(error);
            }
        };

        let tools = instance.tools();
        let tool_count = tools.len();
        self.tools_cache.set(self.base.id(), tools).await;

        self.base.update_health(HealthStatus::Healthy, 0, "");
        self.base.with_health(|health| {
            health.tool_count = tool_count;
            health.tools_fetched = true;
        });
        self.base.set_running(true);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.base.is_running() {
            return Ok(());
        }
        // Teardown of the shared instance is owned by the manager's
        // unregister path; stopping only flips the local state.
        self.base.set_running(false);
        self.base.with_health(|health| {
            health.status = HealthStatus::Stopped;
        });
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }

    async fn check_health(&self) -> Result<ServiceHealth> {
        let Some(instance) = self.current_instance() else {
            self.base.update_health(
                HealthStatus::Unhealthy,
                0,
                "Shared MCP instance or client is not initialized.",
            );
            self.base.with_health(|health| health.warning_level = 3);
            return Ok(self.base.health());
        };

        let started = Instant::now();
        let result = instance.client().ping(HEALTH_PING_TIMEOUT).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(()) => self
                .base
                .update_health(HealthStatus::Healthy, elapsed_ms, ""),
            Err(error) => self.base.update_health(
                HealthStatus::Unhealthy,
                elapsed_ms,
                &format!("Ping failed: {error:#}"),
            ),
        }

        if self.base.is_running() {
            self.base.with_health(|health| {
                if let Some(start_time) = health.start_time {
                    let up = Utc::now().signed_duration_since(start_time).num_seconds();
                    health.up_time_seconds = up.max(0) as u64;
                }
            });
        }

        Ok(self.base.health())
    }

    fn get_health(&self) -> ServiceHealth {
        self.base.health()
    }

    fn get_config(&self) -> Map<String, Value> {
        self.base.config()
    }

    fn update_config(&self, config: Map<String, Value>) -> Result<()> {
        self.base.merge_config(config);
        Ok(())
    }

    fn health_check_timeout(&self) -> Duration {
        let timeout = self
            .base
            .config()
            .get(CONFIG_HEALTH_CHECK_TIMEOUT_SECS)
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT);
        if timeout.is_zero() {
            DEFAULT_HEALTH_CHECK_TIMEOUT
        } else {
            timeout
        }
    }

    fn get_tools(&self) -> Vec<Tool> {
        self.current_instance()
            .map(|instance| instance.tools())
            .unwrap_or_default()
    }

    fn server_info(&self) -> Option<Implementation> {
        self.current_instance()
            .and_then(|instance| instance.client().server_info())
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
