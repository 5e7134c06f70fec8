use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Json;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use relay_config::{RuntimeOptions, ServiceStore};
use relay_runtime::cache::{HealthStatusCache, ToolsListCache};
use relay_runtime::keys;
use relay_runtime::{InstanceCache, ProxiedService, ServiceManager};

use crate::admin::admin_router;
use crate::handlers::HandlerCaches;

const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ServiceManager>,
    pub handlers: Arc<HandlerCaches>,
}

/// Wires the runtime together: instance cache, TTL caches, manager and
/// handler caches, with the handler caches hooked into instance
/// invalidation.
pub fn build_state(store: Arc<dyn ServiceStore>, options: Arc<RuntimeOptions>) -> AppState {
    let instances = InstanceCache::new(options.clone());
    let health_cache = Arc::new(HealthStatusCache::new(None, Duration::ZERO));
    let tools_cache = Arc::new(ToolsListCache::new(None, Duration::ZERO));
    let manager = ServiceManager::new(
        store,
        options,
        instances.clone(),
        health_cache,
        tools_cache,
        None,
    );

    let handlers = HandlerCaches::new();
    instances.add_invalidation_hook(handlers.clone());

    AppState { manager, handlers }
}

/// Full downstream router: per-service proxy endpoints plus the admin API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/proxy/{service}/sse", any(dispatch_sse))
        .route("/proxy/{service}/message", any(dispatch_sse))
        .route("/proxy/{service}/mcp", any(dispatch_http))
        .with_state(state.clone())
        .nest("/api", admin_router(state))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
}

/// Binds and serves until the shutdown token fires.
pub async fn run(bind: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind mcp-relay endpoint at {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve local address")?;
    tracing::info!(address = %local_addr, "mcp-relay listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
        })
        .await
        .context("mcp-relay server stopped with error")?;
    Ok(())
}

enum ProxyTransport {
    Sse,
    StreamableHttp,
}

async fn dispatch_sse(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    request: Request,
) -> Response {
    dispatch(state, service_name, request, ProxyTransport::Sse).await
}

async fn dispatch_http(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    request: Request,
) -> Response {
    dispatch(state, service_name, request, ProxyTransport::StreamableHttp).await
}

/// Routes one downstream request into the cached per-service handler,
/// creating the shared instance first when none is resident.
async fn dispatch(
    state: AppState,
    service_name: String,
    request: Request,
    transport: ProxyTransport,
) -> Response {
    let Some(service) = state.manager.get_service_by_name(&service_name) else {
        return proxy_error(
            StatusCode::NOT_FOUND,
            format!("unknown service '{service_name}'"),
        );
    };
    let service_id = service.id();
    state.manager.update_service_access_time(service_id);

    let record = service.record();
    let cache_key = keys::shared_service_cache_key(service_id);
    let detail = keys::shared_service_instance_name(service_id);
    let instance = match state
        .manager
        .instances()
        .get_or_create(
            &record,
            &cache_key,
            &detail,
            record.default_envs_json.as_deref(),
        )
        .await
    {
        Ok(instance) => instance,
        Err(error) => {
            tracing::warn!(service = %service_name, error = %error, "upstream unavailable");
            return proxy_error(
                StatusCode::BAD_GATEWAY,
                format!("upstream unavailable: {error:#}"),
            );
        }
    };

    let handler = match transport {
        ProxyTransport::Sse => state.handlers.sse_handler(&instance),
        ProxyTransport::StreamableHttp => state.handlers.http_handler(&instance),
    };
    match handler.oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

fn proxy_error(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "message": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
#[path = "serve_tests.rs"]
mod tests;
