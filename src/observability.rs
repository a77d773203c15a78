//! Logging and metrics surface.
//!
//! Metrics go through the `metrics` facade and are exported in Prometheus
//! format from `GET /metrics`. Names live in one constants block so the
//! scrape contract is visible in a single place; `record_*` helpers keep
//! label sets consistent across call sites.

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Metric names (namespace `api_`)
// ---------------------------------------------------------------------------

/// HTTP requests processed, by method/path/status.
pub const HTTP_REQUESTS_TOTAL: &str = "api_http_requests_total";

/// HTTP request duration histogram, by method/path.
pub const HTTP_REQUEST_DURATION: &str = "api_http_request_duration_seconds";

/// Log messages consumed and durably stored, by topic.
pub const MESSAGES_CONSUMED: &str = "api_log_messages_consumed_total";

/// Consumer errors, by topic and error class.
pub const CONSUMER_ERRORS: &str = "api_consumer_errors_total";

/// Whether the consumer loop is running (1) or stopped (0), by topic.
pub const CONSUMER_RUNNING: &str = "api_consumer_running";

/// Assembled batch size histogram, by topic.
pub const BATCH_SIZE: &str = "api_batch_size";

/// Batch stage duration histogram, by topic and stage (fetch/process).
pub const BATCH_DURATION: &str = "api_batch_duration_seconds";

/// Storage query duration histogram, by operation.
pub const DB_QUERY_DURATION: &str = "api_db_query_duration_seconds";

/// Connection pool statistics, by state (idle/active/total).
pub const DB_POOL_CONNECTIONS: &str = "api_db_pool_connections";

/// How often the pool gauges are refreshed.
const POOL_STATS_INTERVAL_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Install the tracing subscriber. `LOG_LEVEL` seeds the filter unless
/// `RUST_LOG` overrides it; `LOG_FORMAT=json` switches to structured output.
pub fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Install the Prometheus recorder and register metric descriptions.
/// The returned handle renders the scrape body for `GET /metrics`.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests processed.");
    describe_histogram!(HTTP_REQUEST_DURATION, "HTTP request duration in seconds.");
    describe_counter!(MESSAGES_CONSUMED, "Total log messages consumed.");
    describe_counter!(CONSUMER_ERRORS, "Total consumer errors.");
    describe_gauge!(
        CONSUMER_RUNNING,
        "Whether the consumer is running (1) or stopped (0)."
    );
    describe_histogram!(BATCH_SIZE, "Number of messages per assembled batch.");
    describe_histogram!(BATCH_DURATION, "Batch stage duration in seconds.");
    describe_histogram!(DB_QUERY_DURATION, "Database query duration in seconds.");
    describe_gauge!(DB_POOL_CONNECTIONS, "Database connection pool statistics.");

    Ok(handle)
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

pub fn record_messages_consumed(topic: &str, count: u64) {
    counter!(MESSAGES_CONSUMED, "topic" => topic.to_string()).increment(count);
}

pub fn record_consumer_error(topic: &str, error_type: &'static str) {
    counter!(CONSUMER_ERRORS, "topic" => topic.to_string(), "error_type" => error_type)
        .increment(1);
}

pub fn set_consumer_running(topic: &str, running: bool) {
    gauge!(CONSUMER_RUNNING, "topic" => topic.to_string())
        .set(if running { 1.0 } else { 0.0 });
}

pub fn record_batch_size(topic: &str, size: usize) {
    histogram!(BATCH_SIZE, "topic" => topic.to_string()).record(size as f64);
}

pub fn record_batch_duration(topic: &str, stage: &'static str, start: Instant) {
    histogram!(BATCH_DURATION, "topic" => topic.to_string(), "stage" => stage)
        .record(start.elapsed().as_secs_f64());
}

pub fn observe_db_query(operation: &'static str, start: Instant) {
    histogram!(DB_QUERY_DURATION, "operation" => operation)
        .record(start.elapsed().as_secs_f64());
}

// ---------------------------------------------------------------------------
// HTTP middleware
// ---------------------------------------------------------------------------

/// Record request count and duration, labelled with the matched route pattern
/// rather than the raw URI so path cardinality stays bounded.
pub async fn track_http(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(req).await;

    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    histogram!(HTTP_REQUEST_DURATION, "method" => method, "path" => path)
        .record(start.elapsed().as_secs_f64());

    response
}

// ---------------------------------------------------------------------------
// Pool stats
// ---------------------------------------------------------------------------

/// Refresh pool gauges on a fixed interval. Runs until process exit; spawn
/// via `tokio::spawn`.
pub async fn run_pool_stats(pool: PgPool) {
    let mut ticker =
        tokio::time::interval(std::time::Duration::from_secs(POOL_STATS_INTERVAL_SECS));
    loop {
        ticker.tick().await;
        let total = pool.size() as f64;
        let idle = pool.num_idle() as f64;
        gauge!(DB_POOL_CONNECTIONS, "state" => "total").set(total);
        gauge!(DB_POOL_CONNECTIONS, "state" => "idle").set(idle);
        gauge!(DB_POOL_CONNECTIONS, "state" => "active").set((total - idle).max(0.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // With no recorder installed the facade is a no-op; the helpers must
    // still be callable from any thread without panicking.
    #[test]
    fn test_recorders_are_safe_without_recorder() {
        record_messages_consumed("t", 3);
        record_consumer_error("t", "fetch_batch");
        set_consumer_running("t", true);
        record_batch_size("t", 17);
        record_batch_duration("t", "fetch", Instant::now());
        observe_db_query("list", Instant::now());
    }
}
