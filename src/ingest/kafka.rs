//! Kafka-backed [`MessageLog`].
//!
//! Wraps an `rdkafka` `StreamConsumer` in consumer-group mode with automatic
//! offset commits disabled; the batch consumer decides when an offset is
//! safe to commit.

use std::collections::HashMap;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};

use crate::ingest::consumer::{LogError, LogMessage, MessageLog};

pub struct KafkaMessageLog {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaMessageLog {
    pub fn new(brokers: &[String], topic: &str, group_id: &str) -> Result<Self, LogError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;
        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl MessageLog for KafkaMessageLog {
    async fn fetch(&self) -> Result<LogMessage, LogError> {
        let message = self.consumer.recv().await?;
        Ok(LogMessage {
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().unwrap_or_default().to_vec(),
        })
    }

    async fn commit(&self, messages: &[LogMessage]) -> Result<(), LogError> {
        // Kafka commits are positional: store the next offset to read per
        // partition, i.e. the highest covered offset + 1.
        let mut next_offsets: HashMap<i32, i64> = HashMap::new();
        for m in messages {
            let entry = next_offsets.entry(m.partition).or_insert(m.offset + 1);
            *entry = (*entry).max(m.offset + 1);
        }

        let mut tpl = TopicPartitionList::new();
        for (partition, offset) in next_offsets {
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset))?;
        }
        self.consumer.commit(&tpl, CommitMode::Sync)?;
        Ok(())
    }
}
