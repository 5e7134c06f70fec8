use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;

use relay_config::{RuntimeOptions, ServiceRecord, ServiceStore};

use crate::cache::{HealthStatusCache, ToolsListCache};
use crate::checker::HealthChecker;
use crate::error::ServiceError;
use crate::health::ServiceHealth;
use crate::instance::InstanceCache;
use crate::keys;
use crate::service::{MonitoredProxiedService, ProxiedService};

const DEFAULT_STDIO_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The single registry of live services.
///
/// Owns the health checker and is the only component that creates or
/// destroys services and their shared instances. Map guards are never held
/// across an await: handles are cloned out first, then called.
pub struct ServiceManager {
    store: Arc<dyn ServiceStore>,
    options: Arc<RuntimeOptions>,
    instances: Arc<InstanceCache>,
    health_cache: Arc<HealthStatusCache>,
    tools_cache: Arc<ToolsListCache>,
    checker: HealthChecker,
    services: RwLock<HashMap<i64, Arc<MonitoredProxiedService>>>,
    access_times: RwLock<HashMap<i64, Instant>>,
    initialized: AtomicBool,
    /// Idle window after which an on-demand stdio service becomes eligible
    /// for eviction. Tracked for the future evictor; nothing reaps yet.
    stdio_idle_timeout: Duration,
}

impl ServiceManager {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        options: Arc<RuntimeOptions>,
        instances: Arc<InstanceCache>,
        health_cache: Arc<HealthStatusCache>,
        tools_cache: Arc<ToolsListCache>,
        check_interval: Option<Duration>,
    ) -> Arc<Self> {
        let checker = HealthChecker::new(health_cache.clone(), check_interval);
        Arc::new(Self {
            store,
            options,
            instances,
            health_cache,
            tools_cache,
            checker,
            services: RwLock::new(HashMap::new()),
            access_times: RwLock::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            stdio_idle_timeout: DEFAULT_STDIO_IDLE_TIMEOUT,
        })
    }

    pub fn options(&self) -> &Arc<RuntimeOptions> {
        &self.options
    }

    pub fn instances(&self) -> &Arc<InstanceCache> {
        &self.instances
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    pub fn stdio_idle_timeout(&self) -> Duration {
        self.stdio_idle_timeout
    }

    /// Loads every enabled record and registers it, then starts the health
    /// checker. Idempotent; a service that fails to come up is logged and
    /// skipped so one bad upstream cannot block startup.
    pub async fn initialize(&self) -> Result<(), ServiceError> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let records = self.store.get_enabled_services().await?;
        self.initialized.store(true, Ordering::SeqCst);

        for record in records {
            let name = record.name.clone();
            if let Err(error) = self.register_service(record).await {
                tracing::warn!(service = %name, error = %error, "failed to register service at startup");
            }
        }

        self.checker.start();
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Registers a service from its record and, when the record is enabled,
    /// starts it. Registration itself never mutates the map on failure; a
    /// start failure leaves the service registered (and unhealthy) so it
    /// can be inspected and retried.
    pub async fn register_service(&self, record: ServiceRecord) -> Result<(), ServiceError> {
        record.validate()?;

        let service = Arc::new(MonitoredProxiedService::new(
            record.clone(),
            self.instances.clone(),
            self.tools_cache.clone(),
        ));

        {
            let mut services = self.services.write().expect("service map lock poisoned");
            if services.contains_key(&record.id) {
                return Err(ServiceError::AlreadyExists(record.id));
            }
            services.insert(record.id, service.clone());
        }
        self.touch(record.id);
        self.checker
            .register_service(&(service.clone() as Arc<dyn ProxiedService>));

        if record.enabled
            && let Err(source) = service.start().await
        {
            return Err(ServiceError::StartFailed {
                name: record.name,
                source,
            });
        }
        Ok(())
    }

    /// Removes a service and purges every cache keyed on its id. Idempotent:
    /// an id that is not live still gets its caches purged. Cache cleanup
    /// runs even when stop fails.
    pub async fn unregister_service(&self, service_id: i64) -> Result<(), ServiceError> {
        self.checker.unregister_service(service_id);

        let service = self
            .services
            .write()
            .expect("service map lock poisoned")
            .remove(&service_id);
        self.access_times
            .write()
            .expect("access map lock poisoned")
            .remove(&service_id);

        if let Some(service) = &service
            && let Err(error) = service.stop().await
        {
            tracing::warn!(
                service_id,
                error = %error,
                "stop failed during unregister, continuing cleanup"
            );
        }

        let cache_key = keys::shared_service_cache_key(service_id);
        let instance = self.instances.take(service_id, &cache_key);
        self.tools_cache.delete(service_id).await;
        self.health_cache.delete(service_id).await;

        if let Some(instance) = instance {
            instance.shutdown();
        }
        Ok(())
    }

    pub async fn start_service(&self, service_id: i64) -> Result<(), ServiceError> {
        let service = self.get_service(service_id)?;
        service
            .start()
            .await
            .map_err(|source| ServiceError::StartFailed {
                name: service.name().to_string(),
                source,
            })
    }

    pub async fn stop_service(&self, service_id: i64) -> Result<(), ServiceError> {
        let service = self.get_service(service_id)?;
        service
            .stop()
            .await
            .map_err(|source| ServiceError::StopFailed {
                name: service.name().to_string(),
                source,
            })
    }

    /// Stops then starts, propagating whichever phase fails. Works from a
    /// stopped state because stop on a stopped service is a no-op.
    pub async fn restart_service(&self, service_id: i64) -> Result<(), ServiceError> {
        self.stop_service(service_id).await?;
        self.start_service(service_id).await
    }

    pub fn get_service(
        &self,
        service_id: i64,
    ) -> Result<Arc<MonitoredProxiedService>, ServiceError> {
        self.services
            .read()
            .expect("service map lock poisoned")
            .get(&service_id)
            .cloned()
            .ok_or(ServiceError::NotFound(service_id))
    }

    /// Snapshot of the live services; order unspecified.
    pub fn get_all_services(&self) -> Vec<Arc<MonitoredProxiedService>> {
        self.services
            .read()
            .expect("service map lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn get_service_by_name(&self, name: &str) -> Option<Arc<MonitoredProxiedService>> {
        self.services
            .read()
            .expect("service map lock poisoned")
            .values()
            .find(|service| service.name() == name)
            .cloned()
    }

    pub fn update_service_access_time(&self, service_id: i64) {
        self.touch(service_id);
    }

    pub fn last_access_time(&self, service_id: i64) -> Option<Instant> {
        self.access_times
            .read()
            .expect("access map lock poisoned")
            .get(&service_id)
            .copied()
    }

    pub fn update_service_config(
        &self,
        service_id: i64,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ServiceError> {
        let service = self.get_service(service_id)?;
        service.update_config(config).map_err(ServiceError::Other)
    }

    pub fn get_service_health(&self, service_id: i64) -> Result<ServiceHealth, ServiceError> {
        Ok(self.get_service(service_id)?.get_health())
    }

    pub fn get_service_health_json(&self, service_id: i64) -> Result<String, ServiceError> {
        let health = self.get_service_health(service_id)?;
        health.to_json().map_err(ServiceError::Other)
    }

    pub async fn force_check_service_health(
        &self,
        service_id: i64,
    ) -> Result<ServiceHealth, ServiceError> {
        self.checker.force_check_service(service_id).await
    }

    /// Persists the live health into the record store.
    pub async fn update_record_health(&self, service_id: i64) -> Result<(), ServiceError> {
        let service = self.get_service(service_id)?;
        let health = service.get_health();

        let mut record = self
            .store
            .get_service_by_id(service_id)
            .await?
            .ok_or(ServiceError::NotFound(service_id))?;
        record.health_status = Some(health.status.as_str().to_string());
        record.health_details_json = Some(health.to_json()?);
        record.last_health_check = health.last_checked.or_else(|| Some(Utc::now()));

        self.store.update_service(&record).await?;
        Ok(())
    }

    /// Stops everything and clears the registry. The manager can be
    /// re-initialized afterwards.
    pub async fn shutdown(&self) {
        self.checker.stop();

        let services: Vec<(i64, Arc<MonitoredProxiedService>)> = {
            let mut map = self.services.write().expect("service map lock poisoned");
            map.drain().collect()
        };

        for (service_id, service) in services {
            if let Err(error) = service.stop().await {
                tracing::warn!(service_id, error = %error, "stop failed during shutdown");
            }
            let cache_key = keys::shared_service_cache_key(service_id);
            if let Some(instance) = self.instances.take(service_id, &cache_key) {
                instance.shutdown();
            }
        }

        self.access_times
            .write()
            .expect("access map lock poisoned")
            .clear();
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn touch(&self, service_id: i64) {
        self.access_times
            .write()
            .expect("access map lock poisoned")
            .insert(service_id, Instant::now());
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
