use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::cache::HealthStatusCache;
use crate::error::ServiceError;
use crate::health::{HealthStatus, ServiceHealth};
use crate::service::ProxiedService;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const FORCE_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Periodic health checker over the live services.
///
/// Holds only weak references: the manager stays the sole strong owner of a
/// service, and an unregistered service stops being checked as soon as its
/// weak handle no longer upgrades. Cache publications are debounced per
/// service; the live service object always carries the fresh state.
pub struct HealthChecker {
    inner: Arc<CheckerInner>,
}

struct CheckerInner {
    services: RwLock<HashMap<i64, Weak<dyn ProxiedService>>>,
    health_cache: Arc<HealthStatusCache>,
    interval: Duration,
    running: AtomicBool,
    ticker: Mutex<Option<CancellationToken>>,
    last_publish: Mutex<HashMap<i64, Instant>>,
}

impl HealthChecker {
    pub fn new(health_cache: Arc<HealthStatusCache>, interval: Option<Duration>) -> Self {
        let interval = match interval {
            Some(interval) if !interval.is_zero() => interval,
            _ => DEFAULT_CHECK_INTERVAL,
        };
        Self {
            inner: Arc::new(CheckerInner {
                services: RwLock::new(HashMap::new()),
                health_cache,
                interval,
                running: AtomicBool::new(false),
                ticker: Mutex::new(None),
                last_publish: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Adds a service to the registry. While the checker is running, a newly
    /// inserted service gets an immediate one-shot check instead of waiting
    /// for the next tick.
    pub fn register_service(&self, service: &Arc<dyn ProxiedService>) {
        let id = service.id();
        let newly_inserted = {
            let mut services = self.inner.services.write().expect("registry lock poisoned");
            services.insert(id, Arc::downgrade(service)).is_none()
        };

        if newly_inserted && self.inner.running.load(Ordering::SeqCst) {
            let inner = self.inner.clone();
            let service = service.clone();
            tokio::spawn(async move {
                inner.run_check(id, service).await;
            });
        }
    }

    pub fn unregister_service(&self, service_id: i64) {
        self.inner
            .services
            .write()
            .expect("registry lock poisoned")
            .remove(&service_id);
        self.inner
            .last_publish
            .lock()
            .expect("debounce lock poisoned")
            .remove(&service_id);
    }

    /// Starts the periodic ticker. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self.inner.ticker.lock().expect("ticker lock poisoned") = Some(token.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; consume it so the
            // initial sweep happens one full period after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                inner.check_all();
            }
            tracing::debug!("health checker ticker stopped");
        });
    }

    /// Stops the ticker. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self
            .inner
            .ticker
            .lock()
            .expect("ticker lock poisoned")
            .take()
        {
            token.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Runs a synchronous check for one service and publishes the outcome.
    ///
    /// A failing probe is converted into an unhealthy snapshot built from
    /// the service's partial health, so callers always get a health value
    /// back for a registered service.
    pub async fn force_check_service(
        &self,
        service_id: i64,
    ) -> Result<ServiceHealth, ServiceError> {
        let service = self
            .inner
            .service(service_id)
            .ok_or(ServiceError::NotRegistered(service_id))?;

        let started = Instant::now();
        let outcome =
            tokio::time::timeout(FORCE_CHECK_TIMEOUT, service.check_health()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let health = match outcome {
            Ok(Ok(mut health)) => {
                health.last_checked = Some(Utc::now());
                health
            }
            Ok(Err(error)) => self.inner.unhealthy_from_error(
                &service,
                &format!("{error:#}"),
                elapsed_ms,
            ),
            Err(_) => self.inner.unhealthy_from_error(
                &service,
                &format!("health check timed out after {}s", FORCE_CHECK_TIMEOUT.as_secs()),
                elapsed_ms,
            ),
        };

        self.inner.publish_debounced(service_id, &health).await;
        Ok(health)
    }

    /// Last health held by the live service object. No cache or store read.
    pub fn get_service_health(&self, service_id: i64) -> Option<ServiceHealth> {
        self.inner
            .service(service_id)
            .map(|service| service.get_health())
    }

    pub fn registered_count(&self) -> usize {
        self.inner
            .services
            .read()
            .expect("registry lock poisoned")
            .len()
    }
}

impl CheckerInner {
    fn service(&self, service_id: i64) -> Option<Arc<dyn ProxiedService>> {
        self.services
            .read()
            .expect("registry lock poisoned")
            .get(&service_id)
            .and_then(Weak::upgrade)
    }

    /// One parallel sweep: each live service gets its own worker task.
    fn check_all(self: &Arc<Self>) {
        let services: Vec<(i64, Arc<dyn ProxiedService>)> = {
            let registry = self.services.read().expect("registry lock poisoned");
            registry
                .iter()
                .filter_map(|(id, weak)| weak.upgrade().map(|service| (*id, service)))
                .collect()
        };

        for (id, service) in services {
            let inner = self.clone();
            tokio::spawn(async move {
                inner.run_check(id, service).await;
            });
        }
    }

    async fn run_check(&self, service_id: i64, service: Arc<dyn ProxiedService>) {
        let timeout = match service.health_check_timeout() {
            timeout if timeout.is_zero() => FALLBACK_CHECK_TIMEOUT,
            timeout => timeout,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, service.check_health()).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let health = match outcome {
            Ok(Ok(health)) => health,
            Ok(Err(error)) => {
                tracing::warn!(
                    service = %service.name(),
                    error = %error,
                    "background health check failed"
                );
                self.unhealthy_from_error(&service, &format!("{error:#}"), elapsed_ms)
            }
            Err(_) => {
                tracing::warn!(
                    service = %service.name(),
                    timeout_secs = timeout.as_secs(),
                    "background health check timed out"
                );
                self.unhealthy_from_error(
                    &service,
                    &format!("health check timed out after {}s", timeout.as_secs()),
                    elapsed_ms,
                )
            }
        };

        self.publish_debounced(service_id, &health).await;
    }

    /// Builds an unhealthy snapshot on top of whatever partial health the
    /// service holds, defaulting the response time to the measured duration.
    fn unhealthy_from_error(
        &self,
        service: &Arc<dyn ProxiedService>,
        error_message: &str,
        elapsed_ms: u64,
    ) -> ServiceHealth {
        let mut health = service.get_health();
        health.status = HealthStatus::Unhealthy;
        health.last_checked = Some(Utc::now());
        if health.error_message.is_empty() {
            health.error_message = error_message.to_string();
        }
        if health.response_time_ms == 0 {
            health.response_time_ms = elapsed_ms;
        }
        health
    }

    /// Publishes to the health cache unless this service was published less
    /// than the debounce window ago. Cache-only: the live service object is
    /// already fresh.
    async fn publish_debounced(&self, service_id: i64, health: &ServiceHealth) {
        {
            let last_publish = self.last_publish.lock().expect("debounce lock poisoned");
            if let Some(last) = last_publish.get(&service_id)
                && last.elapsed() < PUBLISH_DEBOUNCE_WINDOW
            {
                return;
            }
        }

        self.health_cache.set(service_id, health).await;
        self.last_publish
            .lock()
            .expect("debounce lock poisoned")
            .insert(service_id, Instant::now());
    }
}

#[cfg(test)]
#[path = "checker_tests.rs"]
mod tests;
