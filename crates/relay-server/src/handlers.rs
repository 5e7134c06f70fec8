use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::middleware;
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::transport::{SseServer, sse_server::SseServerConfig};
use tokio_util::sync::CancellationToken;

use relay_runtime::instance::{InstanceInvalidationHook, SharedMcpInstance};
use relay_runtime::keys;

use crate::rewrite::rewrite_session_errors;

/// Downstream endpoint paths for one service, derived from its name.
pub fn sse_path(service_name: &str) -> String {
    format!("/proxy/{service_name}/sse")
}

pub fn message_path(service_name: &str) -> String {
    format!("/proxy/{service_name}/message")
}

pub fn mcp_path(service_name: &str) -> String {
    format!("/proxy/{service_name}/mcp")
}

struct SseHandlerEntry {
    router: Router,
    transport_ct: CancellationToken,
    session_ct: CancellationToken,
}

/// Caches of the per-service downstream handlers.
///
/// Handlers are built lazily on first request against whatever shared
/// instance currently lives under the canonical key; invalidation removes
/// the entries and cancels the SSE session tasks so the next request binds
/// a fresh instance. Registered as an invalidation hook on the instance
/// cache to stay in lockstep with instance eviction.
#[derive(Default)]
pub struct HandlerCaches {
    sse: Mutex<HashMap<String, SseHandlerEntry>>,
    http: Mutex<HashMap<String, Router>>,
}

impl HandlerCaches {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the cached SSE handler for the service, building it from the
    /// shared instance on miss.
    pub fn sse_handler(&self, instance: &SharedMcpInstance) -> Router {
        let key = keys::sse_handler_key(instance.service_id());
        let mut entries = self.sse.lock().expect("sse handler lock poisoned");
        if let Some(entry) = entries.get(&key) {
            return entry.router.clone();
        }

        let service_name = instance.service_name();
        let transport_ct = CancellationToken::new();
        let (sse_server, router) = SseServer::new(SseServerConfig {
            bind: "127.0.0.1:0".parse().expect("loopback bind address"),
            sse_path: sse_path(service_name),
            post_path: message_path(service_name),
            ct: transport_ct.clone(),
            sse_keep_alive: None,
        });
        let service = instance.server();
        let session_ct = sse_server.with_service_directly(move || service.clone());

        tracing::debug!(service = %service_name, cache_key = %key, "SSE proxy handler created");
        entries.insert(
            key,
            SseHandlerEntry {
                router: router.clone(),
                transport_ct,
                session_ct,
            },
        );
        router
    }

    /// Returns the cached streamable-HTTP handler for the service, building
    /// it from the shared instance on miss. The handler is always wrapped in
    /// the session-error rewriter.
    pub fn http_handler(&self, instance: &SharedMcpInstance) -> Router {
        let key = keys::http_handler_key(instance.service_id());
        let mut entries = self.http.lock().expect("http handler lock poisoned");
        if let Some(router) = entries.get(&key) {
            return router.clone();
        }

        let service_name = instance.service_name();
        let service = instance.server();
        let http_service = StreamableHttpService::new(
            move || Ok(service.clone()),
            LocalSessionManager::default().into(),
            Default::default(),
        );
        let router = Router::new()
            .nest_service(&mcp_path(service_name), http_service)
            .layer(middleware::from_fn(rewrite_session_errors));

        tracing::debug!(service = %service_name, cache_key = %key, "streamable HTTP proxy handler created");
        entries.insert(key, router.clone());
        router
    }

    /// Drops both handler entries for the service and cancels the SSE
    /// session tasks bound to the old instance.
    pub fn invalidate(&self, service_id: i64) {
        if let Some(entry) = self
            .sse
            .lock()
            .expect("sse handler lock poisoned")
            .remove(&keys::sse_handler_key(service_id))
        {
            entry.session_ct.cancel();
            entry.transport_ct.cancel();
        }
        self.http
            .lock()
            .expect("http handler lock poisoned")
            .remove(&keys::http_handler_key(service_id));
    }

    pub fn contains_sse(&self, service_id: i64) -> bool {
        self.sse
            .lock()
            .expect("sse handler lock poisoned")
            .contains_key(&keys::sse_handler_key(service_id))
    }

    pub fn contains_http(&self, service_id: i64) -> bool {
        self.http
            .lock()
            .expect("http handler lock poisoned")
            .contains_key(&keys::http_handler_key(service_id))
    }
}

impl InstanceInvalidationHook for HandlerCaches {
    fn on_instance_removed(&self, service_id: i64) {
        self.invalidate(service_id);
    }
}
