//! Ingest path: event-log consumption into the store.
//!
//! The consumer loop is generic over [`MessageLog`] and [`ReportSink`] so its
//! at-least-once semantics are tested against in-memory fakes; `kafka.rs`
//! provides the production log implementation.

pub mod consumer;
pub mod kafka;
pub mod message;

pub use consumer::{BatchConsumer, LogError, LogMessage, MessageLog, ReportSink};
pub use kafka::KafkaMessageLog;
