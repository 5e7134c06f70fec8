use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Serialize;

use relay_runtime::{ProxiedService, ServiceError, ServiceHealth};

use crate::serve::AppState;

/// Envelope returned by every admin endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: Option<T>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data,
        })
    }
}

fn error_response(error: &ServiceError) -> Response {
    let status = match error {
        ServiceError::NotFound(_) | ServiceError::NotRegistered(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            message: error.to_string(),
            data: None,
        }),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct ServiceSummary {
    id: i64,
    name: String,
    display_name: String,
    r#type: &'static str,
    enabled: bool,
    running: bool,
    health: ServiceHealth,
}

pub fn admin_router(state: AppState) -> Router {
    Router::new()
        .route("/services", get(list_services))
        .route("/services/{id}/health", get(get_service_health))
        .route("/services/{id}/health/check", post(force_check_service))
        .route("/services/{id}/start", post(start_service))
        .route("/services/{id}/stop", post(stop_service))
        .route("/services/{id}/restart", post(restart_service))
        .with_state(state)
}

async fn list_services(State(state): State<AppState>) -> Response {
    let services: Vec<ServiceSummary> = state
        .manager
        .get_all_services()
        .into_iter()
        .map(|service| {
            let record = service.record();
            ServiceSummary {
                id: record.id,
                name: record.name,
                display_name: record.display_name,
                r#type: record.service_type.label(),
                enabled: record.enabled,
                running: service.is_running(),
                health: service.get_health(),
            }
        })
        .collect();
    ApiResponse::ok(format!("{} services", services.len()), Some(services)).into_response()
}

async fn get_service_health(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.get_service_health(id) {
        Ok(health) => ApiResponse::ok("ok", Some(health)).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn force_check_service(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.force_check_service_health(id).await {
        Ok(health) => ApiResponse::ok("health check completed", Some(health)).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn start_service(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.start_service(id).await {
        Ok(()) => ApiResponse::<()>::ok("service started", None).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn stop_service(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.stop_service(id).await {
        Ok(()) => ApiResponse::<()>::ok("service stopped", None).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn restart_service(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.manager.restart_service(id).await {
        Ok(()) => ApiResponse::<()>::ok("service restarted", None).into_response(),
        Err(error) => error_response(&error),
    }
}
