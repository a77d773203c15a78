//! HTTP surface: the typed query endpoint, health probes, and metrics.

pub mod health;
pub mod query;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Semaphore;
use tower_http::cors::{Any, CorsLayer};

use crate::db::Store;
use crate::observability;

/// Shared application state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    /// The OpenAPI document, served for introspection.
    pub openapi: Arc<serde_json::Value>,
    pub metrics: PrometheusHandle,
    /// Query-concurrency semaphore; overflow is answered without touching
    /// storage.
    pub query_semaphore: Arc<Semaphore>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    // Read-only API; queries travel as POSTed documents.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    Router::new()
        .route(
            "/query",
            post(query::query).layer(middleware::from_fn_with_state(
                state.clone(),
                query::concurrency_limit,
            )),
        )
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .route("/metrics", get(health::metrics))
        .route("/api-docs/openapi.json", get(health::openapi_doc))
        .layer(middleware::from_fn(observability::track_http))
        .layer(cors)
        .with_state(state)
}
