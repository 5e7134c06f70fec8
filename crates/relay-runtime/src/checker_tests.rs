use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use rmcp::model::{Implementation, Tool};
use serde_json::{Map, Value};

use relay_config::ServiceType;

use super::HealthChecker;
use crate::cache::HealthStatusCache;
use crate::error::ServiceError;
use crate::health::{HealthStatus, ServiceHealth};
use crate::service::ProxiedService;

struct FakeService {
    id: i64,
    name: String,
    checks: AtomicU64,
    fail: AtomicBool,
    delay: Duration,
}

impl FakeService {
    fn new(id: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: format!("fake-{id}"),
            checks: AtomicU64::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::ZERO,
        })
    }

    fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxiedService for FakeService {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn service_type(&self) -> ServiceType {
        ServiceType::Stdio
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }

    async fn check_health(&self) -> Result<ServiceHealth> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let count = self.checks.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("probe exploded");
        }
        Ok(ServiceHealth {
            status: HealthStatus::Healthy,
            response_time_ms: count,
            ..Default::default()
        })
    }

    fn get_health(&self) -> ServiceHealth {
        ServiceHealth::default()
    }

    fn get_config(&self) -> Map<String, Value> {
        Map::new()
    }

    fn update_config(&self, _config: Map<String, Value>) -> Result<()> {
        Ok(())
    }

    fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(2)
    }

    fn get_tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    fn server_info(&self) -> Option<Implementation> {
        None
    }
}

fn checker() -> (HealthChecker, Arc<HealthStatusCache>) {
    let cache = Arc::new(HealthStatusCache::new(None, Duration::from_secs(60)));
    (HealthChecker::new(cache.clone(), Some(Duration::from_secs(3600))), cache)
}

#[tokio::test]
async fn force_check_on_unregistered_id_errors() {
    let (checker, _cache) = checker();
    let err = checker.force_check_service(42).await.unwrap_err();
    assert!(matches!(err, ServiceError::NotRegistered(42)));
}

#[tokio::test]
async fn force_check_publishes_health() {
    let (checker, cache) = checker();
    let service = FakeService::new(1);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));

    let health = checker.force_check_service(1).await.unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.last_checked.is_some());

    let cached = cache.get(1).await.expect("published to cache");
    assert_eq!(cached.status, HealthStatus::Healthy);
}

#[tokio::test]
async fn force_check_failure_yields_unhealthy_not_error() {
    let (checker, cache) = checker();
    let service = FakeService::new(2);
    service.fail.store(true, Ordering::SeqCst);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));

    let health = checker.force_check_service(2).await.unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(health.error_message.contains("probe exploded"), "got: {}", health.error_message);
    assert!(health.last_checked.is_some());

    let cached = cache.get(2).await.expect("published to cache");
    assert_eq!(cached.status, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn publishes_are_debounced_within_window() {
    let (checker, cache) = checker();
    let service = FakeService::new(3);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));

    checker.force_check_service(3).await.unwrap();
    let first = cache.get(3).await.expect("first publish");

    // Within the window: the check runs but the cache publish is skipped.
    checker.force_check_service(3).await.unwrap();
    let second = cache.get(3).await.expect("still the first payload");
    assert_eq!(second.response_time_ms, first.response_time_ms);
    assert_eq!(service.checks(), 2);

    // Age the last publish past the window; the next check publishes again.
    checker
        .inner
        .last_publish
        .lock()
        .unwrap()
        .insert(3, Instant::now() - Duration::from_secs(6));
    checker.force_check_service(3).await.unwrap();
    let third = cache.get(3).await.expect("republished");
    assert_eq!(third.response_time_ms, 3);
}

#[tokio::test]
async fn unregister_removes_service_and_debounce_state() {
    let (checker, _cache) = checker();
    let service = FakeService::new(4);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));
    assert_eq!(checker.registered_count(), 1);

    checker.unregister_service(4);
    assert_eq!(checker.registered_count(), 0);
    assert!(matches!(
        checker.force_check_service(4).await.unwrap_err(),
        ServiceError::NotRegistered(4)
    ));
}

#[tokio::test]
async fn dropped_service_no_longer_upgrades() {
    let (checker, _cache) = checker();
    let service = FakeService::new(5);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));
    drop(service);

    assert!(matches!(
        checker.force_check_service(5).await.unwrap_err(),
        ServiceError::NotRegistered(5)
    ));
}

#[tokio::test]
async fn register_while_running_triggers_immediate_check() {
    let (checker, _cache) = checker();
    checker.start();
    assert!(checker.is_running());

    let service = FakeService::new(6);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));

    tokio::time::timeout(Duration::from_secs(2), async {
        while service.checks() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("one-shot check ran");

    checker.stop();
    assert!(!checker.is_running());
    // Idempotent start/stop.
    checker.stop();
    checker.start();
    checker.stop();
}

#[tokio::test]
async fn get_service_health_reads_live_object() {
    let (checker, _cache) = checker();
    let service = FakeService::new(7);
    checker.register_service(&(service.clone() as Arc<dyn ProxiedService>));

    let health = checker.get_service_health(7).expect("registered");
    assert_eq!(health, ServiceHealth::default());
    assert!(checker.get_service_health(99).is_none());
}
