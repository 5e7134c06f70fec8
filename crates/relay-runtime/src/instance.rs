use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use relay_config::{RuntimeOptions, ServiceRecord, ServiceType};

use crate::client::UpstreamClient;
use crate::proxy::{Catalog, ProxyService};

/// Notified whenever a shared instance leaves the cache, so handler caches
/// keyed on the same service can drop their entries in lockstep.
pub trait InstanceInvalidationHook: Send + Sync {
    fn on_instance_removed(&self, service_id: i64);
}

/// The one in-process (client, server) pair fronting one upstream service.
///
/// Every downstream session for the service shares this instance; the HTTP
/// handlers hold it only as long as it stays in the [`InstanceCache`].
pub struct SharedMcpInstance {
    service_id: i64,
    service_name: String,
    service_type: ServiceType,
    cache_key: String,
    client: Arc<UpstreamClient>,
    server: ProxyService,
    heartbeat: CancellationToken,
}

impl SharedMcpInstance {
    pub fn service_id(&self) -> i64 {
        self.service_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn client(&self) -> &Arc<UpstreamClient> {
        &self.client
    }

    /// The proxy server to wrap into downstream handlers.
    pub fn server(&self) -> ProxyService {
        self.server.clone()
    }

    pub fn tools(&self) -> Vec<rmcp::model::Tool> {
        self.server.tools()
    }

    /// Stops the heartbeat loop and signals the MCP client to close.
    /// Best-effort; sibling cleanup never waits on it.
    pub fn shutdown(&self) {
        self.heartbeat.cancel();
        self.client.close();
    }
}

/// Cache of shared upstream instances, keyed by their canonical cache key.
///
/// Reads are lock-and-clone on the fast path; construction is serialized
/// behind a dedicated async mutex so at most one connect/initialize pipeline
/// runs at a time.
pub struct InstanceCache {
    options: Arc<RuntimeOptions>,
    entries: Mutex<HashMap<String, Arc<SharedMcpInstance>>>,
    build_lock: tokio::sync::Mutex<()>,
    hooks: Mutex<Vec<Arc<dyn InstanceInvalidationHook>>>,
}

impl InstanceCache {
    pub fn new(options: Arc<RuntimeOptions>) -> Arc<Self> {
        Arc::new(Self {
            options,
            entries: Mutex::new(HashMap::new()),
            build_lock: tokio::sync::Mutex::new(()),
            hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn add_invalidation_hook(&self, hook: Arc<dyn InstanceInvalidationHook>) {
        self.hooks.lock().expect("hooks lock poisoned").push(hook);
    }

    pub fn get(&self, cache_key: &str) -> Option<Arc<SharedMcpInstance>> {
        self.entries
            .lock()
            .expect("instance cache lock poisoned")
            .get(cache_key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("instance cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the instance under `cache_key`, building it if absent.
    ///
    /// For stdio services a non-empty `effective_envs_json` replaces the
    /// record's default env document before the child is spawned; callers
    /// pass the service default when no override applies. A failed build
    /// leaves the cache untouched.
    pub async fn get_or_create(
        self: &Arc<Self>,
        record: &ServiceRecord,
        cache_key: &str,
        instance_name_detail: &str,
        effective_envs_json: Option<&str>,
    ) -> Result<Arc<SharedMcpInstance>> {
        if let Some(existing) = self.get(cache_key) {
            return Ok(existing);
        }

        let _build = self.build_lock.lock().await;
        if let Some(existing) = self.get(cache_key) {
            return Ok(existing);
        }

        let mut record = record.clone();
        if record.service_type == ServiceType::Stdio
            && let Some(envs) = effective_envs_json
            && !envs.trim().is_empty()
        {
            record.default_envs_json = Some(envs.to_string());
        }
        record.validate().with_context(|| {
            format!(
                "invalid record for service '{}' ({}, {})",
                record.name, record.service_type, instance_name_detail
            )
        })?;

        let client = Arc::new(UpstreamClient::connect(&record, instance_name_detail).await?);
        let server = ProxyService::new(
            record.id,
            record.name.clone(),
            record.installed_version.clone(),
            cache_key.to_string(),
            client.clone(),
            Arc::downgrade(self),
        );
        server.set_catalog(enumerate_catalog(&record.name, &client).await);

        let instance = Arc::new(SharedMcpInstance {
            service_id: record.id,
            service_name: record.name.clone(),
            service_type: record.service_type,
            cache_key: cache_key.to_string(),
            client: client.clone(),
            server,
            heartbeat: CancellationToken::new(),
        });

        if record.service_type.is_remote() {
            self.spawn_heartbeat(&instance);
        }

        let mut entries = self.entries.lock().expect("instance cache lock poisoned");
        if let Some(existing) = entries.get(cache_key) {
            // Lost a race after all; prefer the resident instance.
            instance.shutdown();
            return Ok(existing.clone());
        }
        entries.insert(cache_key.to_string(), instance.clone());
        tracing::info!(
            service = %record.name,
            transport = %record.service_type,
            cache_key,
            "shared MCP instance created"
        );
        Ok(instance)
    }

    /// Removes and tears down the instance under `cache_key`. Used by the
    /// heartbeat loop and the dead-call probe; no-op when already gone.
    pub async fn evict(&self, service_id: i64, cache_key: &str) {
        let removed = self
            .entries
            .lock()
            .expect("instance cache lock poisoned")
            .remove(cache_key);
        let Some(instance) = removed else {
            return;
        };
        instance.shutdown();
        self.notify_removed(service_id);
        tracing::info!(service = %instance.service_name, cache_key, "shared MCP instance evicted");
    }

    /// Removes the instance without shutting it down; the caller owns
    /// teardown ordering. Invalidation hooks still fire.
    pub fn take(&self, service_id: i64, cache_key: &str) -> Option<Arc<SharedMcpInstance>> {
        let removed = self
            .entries
            .lock()
            .expect("instance cache lock poisoned")
            .remove(cache_key);
        if removed.is_some() {
            self.notify_removed(service_id);
        }
        removed
    }

    fn notify_removed(&self, service_id: i64) {
        let hooks = self.hooks.lock().expect("hooks lock poisoned").clone();
        for hook in hooks {
            hook.on_instance_removed(service_id);
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>, instance: &Arc<SharedMcpInstance>) {
        let cache = Arc::downgrade(self);
        let options = self.options.clone();
        let client = instance.client.clone();
        let token = instance.heartbeat.clone();
        let service_id = instance.service_id;
        let service_name = instance.service_name.clone();
        let cache_key = instance.cache_key.clone();

        tokio::spawn(async move {
            loop {
                // Interval, jitter and timeout are re-read every tick so a
                // live option update applies without a restart.
                let interval = options.heartbeat_interval();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let jitter = options.heartbeat_jitter();
                if !jitter.is_zero() {
                    let delay =
                        Duration::from_millis(fastrand::u64(0..=jitter.as_millis() as u64));
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }

                if let Err(error) = client.ping(options.heartbeat_timeout()).await {
                    tracing::warn!(
                        service = %service_name,
                        error = %error,
                        "heartbeat ping failed, evicting shared instance"
                    );
                    if let Some(cache) = cache.upgrade() {
                        cache.evict(service_id, &cache_key).await;
                    }
                    break;
                }
            }
            tracing::debug!(service = %service_name, "heartbeat loop stopped");
        });
    }
}

/// Best-effort catalog enumeration: a failed list leaves that section empty
/// and the instance still usable.
async fn enumerate_catalog(service_name: &str, client: &Arc<UpstreamClient>) -> Catalog {
    let mut catalog = Catalog::default();

    match client.list_tools_all().await {
        Ok(tools) => catalog.tools = tools,
        Err(error) => {
            tracing::warn!(service = %service_name, error = %error, "tools enumeration failed");
        }
    }
    match client.list_prompts_all().await {
        Ok(prompts) => catalog.prompts = prompts,
        Err(error) => {
            tracing::debug!(service = %service_name, error = %error, "prompts enumeration failed");
        }
    }
    match client.list_resources_all().await {
        Ok(resources) => catalog.resources = resources,
        Err(error) => {
            tracing::debug!(service = %service_name, error = %error, "resources enumeration failed");
        }
    }
    match client.list_resource_templates_all().await {
        Ok(templates) => catalog.resource_templates = templates,
        Err(error) => {
            tracing::debug!(
                service = %service_name,
                error = %error,
                "resource template enumeration failed"
            );
        }
    }

    catalog
}

#[cfg(test)]
#[path = "instance_tests.rs"]
pub(crate) mod tests;
