// Storm Reports API
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};
use utoipa::OpenApi;

use storm_reports_api::config::AppConfig;
use storm_reports_api::db::{self, Store};
use storm_reports_api::ingest::{BatchConsumer, KafkaMessageLog};
use storm_reports_api::routes::query::CONCURRENCY_LIMIT;
use storm_reports_api::routes::{self, AppState};
use storm_reports_api::{errors, model, observability, query};

/// Storm Reports API — OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storm Reports API",
        version = "0.1.0",
        description = "Severe-weather reporting service. Ingests enriched storm-event \
            records from Kafka into PostgreSQL and exposes them through a typed query \
            endpoint with filtering, sorting, pagination, and multi-dimensional \
            aggregation.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Query", description = "Typed storm-report queries"),
        (name = "Health", description = "Liveness and readiness probes"),
    ),
    paths(
        routes::query::query,
        routes::health::liveness,
        routes::health::readiness,
    ),
    components(
        schemas(
            model::StormReport,
            model::GeoPoint,
            model::Measurement,
            model::Location,
            model::EventType,
            model::Severity,
            model::MeasurementUnit,
            model::SortField,
            model::SortOrder,
            model::ReportFilter,
            model::TimeRange,
            model::GeoRadiusFilter,
            model::EventTypeFilter,
            model::EventTypeGroup,
            model::MaxMeasurement,
            model::StateGroup,
            model::CountyGroup,
            model::TimeGroup,
            query::StormReportsQuery,
            query::Aggregations,
            query::QueryMeta,
            query::Envelope,
            routes::health::HealthResponse,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    observability::init_logging(&config.log_level, &config.log_format);

    let metrics = match observability::init_metrics() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!("failed to install metrics recorder: {e}");
            std::process::exit(1);
        }
    };

    // Database: connect, then apply pending migrations.
    let pool = match db::new_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("failed to connect to database: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = sqlx::migrate!().run(&pool).await {
        tracing::error!("failed to run database migrations: {e}");
        std::process::exit(1);
    }
    tracing::info!("database migrations completed");

    let store = Store::new(pool.clone());
    tokio::spawn(observability::run_pool_stats(pool));

    // Shutdown signal shared by the server and the consumer.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Kafka consumer
    let log = match KafkaMessageLog::new(
        &config.kafka_brokers,
        &config.kafka_topic,
        &config.kafka_group_id,
    ) {
        Ok(log) => log,
        Err(e) => {
            tracing::error!("failed to create kafka consumer: {e}");
            std::process::exit(1);
        }
    };
    let consumer = BatchConsumer::new(
        log,
        store.clone(),
        config.kafka_topic.clone(),
        config.batch_size,
        config.batch_flush_interval,
    );
    let consumer_task = tokio::spawn(async move { consumer.run(shutdown_rx).await });

    // HTTP server
    let openapi = serde_json::to_value(ApiDoc::openapi()).expect("serialize OpenAPI document");
    let state = AppState {
        store,
        openapi: Arc::new(openapi),
        metrics,
        query_semaphore: Arc::new(Semaphore::new(CONCURRENCY_LIMIT)),
    };
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!("server listening on {}", addr);

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await;
    if let Err(e) = serve_result {
        tracing::error!("server error: {e}");
    }

    // Give the consumer a bounded window to finish its in-flight batch.
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.shutdown_timeout, consumer_task)
        .await
        .is_err()
    {
        tracing::warn!("consumer did not stop within the shutdown timeout");
    }
    tracing::info!("shutdown complete");
}

/// Resolve on SIGINT/SIGTERM and flip the shared shutdown flag.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
}
