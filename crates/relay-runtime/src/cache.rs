use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rmcp::model::Tool;
use serde::{Deserialize, Serialize};

use crate::health::ServiceHealth;
use crate::keys;

const DEFAULT_HEALTH_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TOOLS_TTL: Duration = Duration::from_secs(10 * 60);

/// Shared cache backend (e.g. a process-external cache).
///
/// The TTL caches work without one: when no client is configured every
/// read/write goes through an in-process map.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

struct LocalEntry {
    value: String,
    expires_at: Instant,
}

/// Two-tier TTL cache: shared client first, in-process map as fallback.
///
/// Local entries are scrubbed lazily: an expired entry is dropped the first
/// time a read finds it stale.
struct TieredCache {
    shared: Option<Arc<dyn CacheClient>>,
    ttl: Duration,
    local: RwLock<HashMap<String, LocalEntry>>,
}

impl TieredCache {
    fn new(shared: Option<Arc<dyn CacheClient>>, ttl: Duration, default_ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() { default_ttl } else { ttl };
        Self {
            shared,
            ttl,
            local: RwLock::new(HashMap::new()),
        }
    }

    async fn set(&self, key: &str, value: String) {
        if let Some(shared) = &self.shared {
            if let Err(error) = shared.set(key, value, self.ttl).await {
                tracing::warn!(key, error = %error, "shared cache set failed");
            }
            return;
        }
        self.local.write().expect("cache lock poisoned").insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn get(&self, key: &str) -> Option<String> {
        if let Some(shared) = &self.shared {
            return match shared.get(key).await {
                Ok(value) => value,
                Err(error) => {
                    tracing::warn!(key, error = %error, "shared cache get failed");
                    None
                }
            };
        }

        let expired = {
            let local = self.local.read().expect("cache lock poisoned");
            match local.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            self.local.write().expect("cache lock poisoned").remove(key);
        }
        None
    }

    async fn delete(&self, key: &str) {
        if let Some(shared) = &self.shared {
            if let Err(error) = shared.delete(key).await {
                tracing::warn!(key, error = %error, "shared cache delete failed");
            }
            return;
        }
        self.local.write().expect("cache lock poisoned").remove(key);
    }
}

/// TTL cache of the latest [`ServiceHealth`] per service. Default TTL 1h.
pub struct HealthStatusCache {
    inner: TieredCache,
}

impl HealthStatusCache {
    pub fn new(shared: Option<Arc<dyn CacheClient>>, ttl: Duration) -> Self {
        Self {
            inner: TieredCache::new(shared, ttl, DEFAULT_HEALTH_TTL),
        }
    }

    pub async fn set(&self, service_id: i64, health: &ServiceHealth) {
        match health.to_json() {
            Ok(json) => self.inner.set(&keys::health_cache_key(service_id), json).await,
            Err(error) => {
                tracing::warn!(service_id, error = %error, "failed to serialize health for cache");
            }
        }
    }

    pub async fn get(&self, service_id: i64) -> Option<ServiceHealth> {
        let key = keys::health_cache_key(service_id);
        let raw = self.inner.get(&key).await?;
        decode_or_evict(&self.inner, &key, &raw)
    }

    pub async fn delete(&self, service_id: i64) {
        self.inner.delete(&keys::health_cache_key(service_id)).await;
    }
}

/// One tools-list cache entry: the tool catalog and when it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCacheEntry {
    pub tools: Vec<Tool>,
    pub fetched_at: DateTime<Utc>,
}

/// TTL cache of the enumerated tool catalog per service. Default TTL 10m.
///
/// An empty tool list is a valid entry, not a miss.
pub struct ToolsListCache {
    inner: TieredCache,
}

impl ToolsListCache {
    pub fn new(shared: Option<Arc<dyn CacheClient>>, ttl: Duration) -> Self {
        Self {
            inner: TieredCache::new(shared, ttl, DEFAULT_TOOLS_TTL),
        }
    }

    pub async fn set(&self, service_id: i64, tools: Vec<Tool>) {
        let entry = ToolsCacheEntry {
            tools,
            fetched_at: Utc::now(),
        };
        match serde_json::to_string(&entry) {
            Ok(json) => self.inner.set(&keys::tools_cache_key(service_id), json).await,
            Err(error) => {
                tracing::warn!(service_id, error = %error, "failed to serialize tools for cache");
            }
        }
    }

    pub async fn get(&self, service_id: i64) -> Option<ToolsCacheEntry> {
        let key = keys::tools_cache_key(service_id);
        let raw = self.inner.get(&key).await?;
        decode_or_evict(&self.inner, &key, &raw)
    }

    pub async fn delete(&self, service_id: i64) {
        self.inner.delete(&keys::tools_cache_key(service_id)).await;
    }
}

/// Treats undecodable payloads as a miss and schedules the entry for
/// deletion off the read path.
fn decode_or_evict<T: serde::de::DeserializeOwned>(
    cache: &TieredCache,
    key: &str,
    raw: &str,
) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(key, error = %error, "invalid cache payload, evicting");
            let shared = cache.shared.clone();
            let key = key.to_string();
            if let Some(shared) = shared {
                tokio::spawn(async move {
                    if let Err(error) = shared.delete(&key).await {
                        tracing::debug!(key, error = %error, "failed to evict invalid cache entry");
                    }
                });
            } else {
                cache.local.write().expect("cache lock poisoned").remove(&key);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{CacheClient, HealthStatusCache, ToolsListCache};
    use crate::health::{HealthStatus, ServiceHealth};

    #[tokio::test]
    async fn health_round_trip_without_shared_client() {
        let cache = HealthStatusCache::new(None, Duration::from_secs(60));
        let mut health = ServiceHealth::default();
        health.apply(HealthStatus::Healthy, 9, "");

        cache.set(4, &health).await;
        let loaded = cache.get(4).await.expect("cached health");
        assert_eq!(loaded, health);

        cache.delete(4).await;
        assert!(cache.get(4).await.is_none());
    }

    #[tokio::test]
    async fn local_entries_expire() {
        let cache = HealthStatusCache::new(None, Duration::from_millis(20));
        cache.set(1, &ServiceHealth::default()).await;
        assert!(cache.get(1).await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(1).await.is_none());
    }

    #[tokio::test]
    async fn empty_tools_list_is_a_hit() {
        let cache = ToolsListCache::new(None, Duration::from_secs(60));
        cache.set(2, Vec::new()).await;

        let entry = cache.get(2).await.expect("empty list is still an entry");
        assert!(entry.tools.is_empty());
    }

    #[tokio::test]
    async fn missing_entry_is_a_miss() {
        let cache = ToolsListCache::new(None, Duration::from_secs(60));
        assert!(cache.get(99).await.is_none());
    }

    struct BrokenPayloadClient;

    #[async_trait::async_trait]
    impl CacheClient for BrokenPayloadClient {
        async fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(Some("{not valid json".to_string()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn invalid_payload_is_a_miss() {
        let cache = HealthStatusCache::new(Some(Arc::new(BrokenPayloadClient)), Duration::ZERO);
        assert!(cache.get(5).await.is_none());
    }

    struct RecordingClient {
        store: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
    }

    #[async_trait::async_trait]
    impl CacheClient for RecordingClient {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            Ok(self.store.lock().await.get(key).cloned())
        }

        async fn set(&self, key: &str, value: String, _ttl: Duration) -> anyhow::Result<()> {
            self.store.lock().await.insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            self.store.lock().await.remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shared_client_is_preferred_over_local_map() {
        let client = Arc::new(RecordingClient {
            store: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        });
        let cache = HealthStatusCache::new(Some(client.clone()), Duration::ZERO);

        cache.set(8, &ServiceHealth::default()).await;
        assert!(client.store.lock().await.contains_key("health:service:8"));
        assert!(cache.get(8).await.is_some());

        cache.delete(8).await;
        assert!(!client.store.lock().await.contains_key("health:service:8"));
    }
}
