// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::errors::ConsumeError;

pub const DEFAULT_MAX_BATCH: usize = 500;

/// One record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
}

/// Reading side of the append log.
///
/// Polling a record does not consume it. Only records passed to [`LogSubscriber::ack`] count as
/// processed for the consumer group, so anything polled but never acknowledged is read again by
/// the next run.
#[async_trait]
pub trait LogSubscriber: Send {
    /// Returns whatever arrived within `timeout`, possibly nothing.
    async fn poll_batch(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, ConsumeError>;

    /// Marks `record` as processed.
    fn ack(&mut self, record: &LogRecord) -> Result<(), ConsumeError>;
}

/// Consumer group member subscribed to a single topic.
///
/// Offsets are only stored for acknowledged records. The client commits stored offsets in the
/// background and once more when the consumer is dropped.
pub struct KafkaLogSubscriber {
    consumer: StreamConsumer,
    max_batch: usize,
}

impl KafkaLogSubscriber {
    pub fn new(bootstrap_servers: &str, group_id: &str, topic: &str) -> Result<Self, ConsumeError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| ConsumeError::Client(e.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| ConsumeError::Subscribe {
                topic: topic.to_string(),
                cause: e.to_string(),
            })?;
        info!("Subscribed to topic {topic} as group {group_id}");

        Ok(Self {
            consumer,
            max_batch: DEFAULT_MAX_BATCH,
        })
    }
}

#[async_trait]
impl LogSubscriber for KafkaLogSubscriber {
    async fn poll_batch(&mut self, timeout: Duration) -> Result<Vec<LogRecord>, ConsumeError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < self.max_batch {
            let message = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return Err(ConsumeError::Poll(e.to_string())),
                Err(_) => break,
            };

            batch.push(LogRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message
                    .key()
                    .map(|k| String::from_utf8_lossy(k).into_owned()),
                payload: message
                    .payload()
                    .map(|p| String::from_utf8_lossy(p).into_owned())
                    .unwrap_or_default(),
            });
        }

        if !batch.is_empty() {
            debug!("Received {} records", batch.len());
        }
        Ok(batch)
    }

    fn ack(&mut self, record: &LogRecord) -> Result<(), ConsumeError> {
        let commit_error = |cause: String| ConsumeError::Commit {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            cause,
        };

        // The stored offset is the next one to read.
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| commit_error(e.to_string()))?;
        self.consumer
            .store_offsets(&offsets)
            .map_err(|e| commit_error(e.to_string()))
    }
}
