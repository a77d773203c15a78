//! Liveness, readiness, metrics, and schema endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::errors::ErrorResponse;
use crate::routes::AppState;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" when healthy)
    pub status: String,
    /// API version
    pub version: String,
}

fn ok_response() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness probe. Constant OK while the process is up.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "Health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse),
    )
)]
pub async fn liveness() -> Json<HealthResponse> {
    ok_response()
}

/// Readiness probe. Round-trips to the database.
#[utoipa::path(
    get,
    path = "/readyz",
    tag = "Health",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse),
        (status = 503, description = "Storage unavailable", body = ErrorResponse),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> Response {
    match crate::db::check_readiness(state.store.pool()).await {
        Ok(()) => ok_response().into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: "database unavailable".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// The OpenAPI document.
pub async fn openapi_doc(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.openapi.as_ref().clone())
}
