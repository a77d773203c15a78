//! Batch consumer for the storm-report event log.
//!
//! One cooperative loop per process:
//! - `fetch_batch` collects up to `batch_size` messages bounded by the flush
//!   interval, parsing each as it arrives;
//! - `process_batch` commits poison-pill offsets immediately, writes the
//!   valid reports in one batch upsert, and only then commits their offsets.
//!
//! An offset is never committed before the durable write that covers it, so
//! delivery is at-least-once end-to-end; the idempotent upsert absorbs the
//! resulting redeliveries. Fetch errors back off exponentially (200 ms
//! doubling to a 5 s cap), reset on the next successful fetch.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::db::Store;
use crate::ingest::message::{parse_report, MessageParseError};
use crate::model::StormReport;
use crate::observability::{
    record_batch_duration, record_batch_size, record_consumer_error, record_messages_consumed,
    set_consumer_running,
};

/// First retry delay after a fetch error.
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Upper bound for the doubling retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// A raw message from the event log, addressed by partition and offset.
#[derive(Debug, Clone)]
pub struct LogMessage {
    pub partition: i32,
    pub offset: i64,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("kafka: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// Failure in a non-Kafka log implementation.
    #[error("log backend: {0}")]
    Backend(String),
}

/// The event-log contract the consumer needs: blocking fetch plus offset
/// commit. Production uses Kafka; tests use an in-memory queue.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// Wait for the next message.
    async fn fetch(&self) -> Result<LogMessage, LogError>;

    /// Mark messages consumed. Must only be called once the write covering
    /// them is durable (or they were classified unparseable).
    async fn commit(&self, messages: &[LogMessage]) -> Result<(), LogError>;
}

/// The storage contract the consumer needs.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn upsert_batch(&self, reports: &[StormReport]) -> Result<(), sqlx::Error>;
}

#[async_trait]
impl ReportSink for Store {
    async fn upsert_batch(&self, reports: &[StormReport]) -> Result<(), sqlx::Error> {
        Store::upsert_batch(self, reports).await
    }
}

/// A fetched message and its parse outcome. Failures ride along so their
/// offsets can be committed in order with the rest of the batch.
struct BatchItem {
    message: LogMessage,
    parsed: Result<StormReport, MessageParseError>,
}

/// Reads storm reports from the event log in batches and persists them.
pub struct BatchConsumer<L, S> {
    log: L,
    sink: S,
    topic: String,
    batch_size: usize,
    flush_interval: Duration,
}

impl<L: MessageLog, S: ReportSink> BatchConsumer<L, S> {
    pub fn new(
        log: L,
        sink: S,
        topic: impl Into<String>,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            log,
            sink,
            topic: topic.into(),
            batch_size,
            flush_interval,
        }
    }

    /// Consume batches until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            topic = %self.topic,
            batch_size = self.batch_size,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "batch consumer started"
        );
        set_consumer_running(&self.topic, true);

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.fetch_batch(&mut shutdown).await {
                Err(e) => {
                    if *shutdown.borrow() {
                        break;
                    }
                    record_consumer_error(&self.topic, "fetch_batch");
                    tracing::error!(error = %e, retry_in_ms = backoff.as_millis() as u64, "fetch batch");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                Ok(items) => {
                    backoff = INITIAL_BACKOFF;
                    if items.is_empty() {
                        continue;
                    }
                    self.process_batch(items).await;
                }
            }
        }

        set_consumer_running(&self.topic, false);
        tracing::info!(topic = %self.topic, "batch consumer stopped");
    }

    /// Collect up to `batch_size` messages or until the flush interval
    /// elapses. Fetch errors propagate; shutdown returns the partial batch.
    async fn fetch_batch(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<BatchItem>, LogError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + self.flush_interval;
        let mut items = Vec::with_capacity(self.batch_size);

        while items.len() < self.batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            let fetched = tokio::select! {
                _ = shutdown.changed() => break,
                res = tokio::time::timeout(remaining, self.log.fetch()) => res,
            };
            let message = match fetched {
                // Flush interval expired: return the partial batch.
                Err(_elapsed) => break,
                Ok(Err(e)) => return Err(e),
                Ok(Ok(message)) => message,
            };

            let parsed = parse_report(&message.payload);
            items.push(BatchItem { message, parsed });
        }

        record_batch_size(&self.topic, items.len());
        record_batch_duration(&self.topic, "fetch", start);
        Ok(items)
    }

    /// Persist valid reports and commit offsets in write-then-commit order.
    async fn process_batch(&self, items: Vec<BatchItem>) {
        let start = Instant::now();

        let mut valid_reports = Vec::new();
        let mut valid_msgs = Vec::new();
        let mut poison_msgs = Vec::new();

        for item in items {
            match item.parsed {
                Ok(report) => {
                    valid_reports.push(report);
                    valid_msgs.push(item.message);
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        partition = item.message.partition,
                        offset = item.message.offset,
                        "unparseable message in batch"
                    );
                    record_consumer_error(&self.topic, "parse");
                    poison_msgs.push(item.message);
                }
            }
        }

        // Commit poison pills first so the log doesn't redeliver them in an
        // endless loop. The payloads are logged above for investigation.
        if !poison_msgs.is_empty() {
            if let Err(e) = self.log.commit(&poison_msgs).await {
                tracing::error!(error = %e, count = poison_msgs.len(), "commit poison offsets");
            }
        }

        if valid_reports.is_empty() {
            record_batch_duration(&self.topic, "process", start);
            return;
        }

        if let Err(e) = self.sink.upsert_batch(&valid_reports).await {
            // No commit: the whole batch is redelivered and the idempotent
            // upsert absorbs the rows that did land.
            tracing::error!(error = %e, count = valid_reports.len(), "batch insert storm reports");
            record_consumer_error(&self.topic, "batch_insert");
            record_batch_duration(&self.topic, "process", start);
            return;
        }

        if let Err(e) = self.log.commit(&valid_msgs).await {
            tracing::error!(error = %e, count = valid_msgs.len(), "commit batch offsets");
        }

        record_messages_consumed(&self.topic, valid_reports.len() as u64);
        record_batch_duration(&self.topic, "process", start);
        tracing::debug!(count = valid_reports.len(), "consumed batch");
    }
}
