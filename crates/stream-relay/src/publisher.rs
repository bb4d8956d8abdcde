// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Publishes raw events from the intake queue to the log.
//!
//! [`LogPublisher::new`] returns the publisher together with its [`DeliveryReports`] task. The
//! publisher never waits on a delivery: each pending send is awaited on its own task which
//! forwards the outcome to the report task for logging.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::errors::PublishError;
use crate::intake_queue::IntakeQueue;
use crate::routing::{RoutedMessage, Router};

/// Something that feeds the intake queue and can be told to stop.
pub trait EventSource: Send + Sync {
    fn is_done(&self) -> bool;
    fn stop(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { partition: i32, offset: i64 },
    Failed { cause: String },
}

pub type PendingDelivery = Pin<Box<dyn Future<Output = SendOutcome> + Send>>;

/// Client side of the append log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Hands `message` to the client. Returns once the message is enqueued, not delivered.
    fn send(&self, topic: &str, message: &RoutedMessage) -> Result<PendingDelivery, PublishError>;

    async fn flush(&self, timeout: Duration) -> Result<(), PublishError>;
}

/// Kafka producer with idempotent publish enabled.
pub struct KafkaLogProducer {
    producer: FutureProducer,
}

impl KafkaLogProducer {
    pub fn new(bootstrap_servers: &str, message_timeout: Duration) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", message_timeout.as_millis().to_string())
            .create()
            .map_err(|e| PublishError::Client(e.to_string()))?;
        info!("Kafka producer created for {bootstrap_servers}");
        Ok(Self { producer })
    }
}

#[async_trait]
impl LogProducer for KafkaLogProducer {
    fn send(&self, topic: &str, message: &RoutedMessage) -> Result<PendingDelivery, PublishError> {
        let mut record = FutureRecord::<str, str>::to(topic).payload(message.payload.as_str());
        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }

        match self.producer.send_result(record) {
            Ok(delivery) => Ok(Box::pin(async move {
                match delivery.await {
                    Ok(Ok((partition, offset))) => SendOutcome::Delivered { partition, offset },
                    Ok(Err((e, _message))) => SendOutcome::Failed {
                        cause: e.to_string(),
                    },
                    Err(_) => SendOutcome::Failed {
                        cause: "delivery canceled before completion".to_string(),
                    },
                }
            })),
            Err((e, _record)) => Err(PublishError::Enqueue(e.to_string())),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| PublishError::Flush(e.to_string()))?
            .map_err(|e| PublishError::Flush(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sequence: u64,
    pub key: Option<String>,
    pub outcome: SendOutcome,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: u64,
    pub failed: u64,
}

/// Logs the outcome of every send until the publisher and all in-flight deliveries are gone.
pub struct DeliveryReports {
    rx: mpsc::UnboundedReceiver<DeliveryReport>,
}

impl DeliveryReports {
    pub async fn run(mut self) -> DeliverySummary {
        debug!("Delivery report task started");
        let mut summary = DeliverySummary::default();

        while let Some(report) = self.rx.recv().await {
            match report.outcome {
                SendOutcome::Delivered { partition, offset } => {
                    summary.delivered += 1;
                    info!(
                        "Received new metadata. Sequence: {} Key: {} Partition: {partition} Offset: {offset}",
                        report.sequence,
                        report.key.as_deref().unwrap_or("-")
                    );
                }
                SendOutcome::Failed { cause } => {
                    summary.failed += 1;
                    error!(
                        "Error while producing message {}: {cause}",
                        report.sequence
                    );
                }
            }
        }

        debug!(
            "Delivery report task ended: {} delivered, {} failed",
            summary.delivered, summary.failed
        );
        summary
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub topic: String,
    pub terms: Vec<String>,
    pub queue_poll_timeout: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub published: u64,
}

pub struct LogPublisher {
    producer: Arc<dyn LogProducer>,
    router: Router,
    topic: String,
    queue_poll_timeout: Duration,
    reports: mpsc::UnboundedSender<DeliveryReport>,
    sequence: AtomicU64,
}

impl LogPublisher {
    pub fn new(producer: Arc<dyn LogProducer>, config: PublisherConfig) -> (Self, DeliveryReports) {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Self {
            producer,
            router: Router::new(config.terms),
            topic: config.topic,
            queue_poll_timeout: config.queue_poll_timeout,
            reports: tx,
            sequence: AtomicU64::new(0),
        };
        (publisher, DeliveryReports { rx })
    }

    /// Routes `raw` and submits it without waiting for the delivery.
    pub fn publish(&self, raw: &str) -> RoutedMessage {
        let message = self.router.route(raw);
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        match self.producer.send(&self.topic, &message) {
            Ok(pending) => {
                let reports = self.reports.clone();
                let key = message.key.clone();
                tokio::spawn(async move {
                    let outcome = pending.await;
                    let _ = reports.send(DeliveryReport {
                        sequence,
                        key,
                        outcome,
                    });
                });
            }
            Err(e) => {
                let _ = self.reports.send(DeliveryReport {
                    sequence,
                    key: message.key.clone(),
                    outcome: SendOutcome::Failed {
                        cause: e.to_string(),
                    },
                });
            }
        }

        message
    }

    /// Drains `queue` until `source` is done or `shutdown` is cancelled.
    ///
    /// A poll that times out only ends the loop once the source reports done. Cancellation stops
    /// the source and ends the loop without publishing further events.
    pub async fn run(
        &self,
        queue: &IntakeQueue<String>,
        source: &dyn EventSource,
        shutdown: &CancellationToken,
    ) -> PublishSummary {
        info!("Publishing to topic {}", self.topic);
        let mut summary = PublishSummary::default();

        loop {
            let polled = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!("Publish loop interrupted, stopping event source");
                    source.stop();
                    break;
                }
                polled = queue.poll(self.queue_poll_timeout) => polled,
            };

            match polled {
                Some(raw) => {
                    self.publish(&raw);
                    summary.published += 1;
                }
                None if source.is_done() => {
                    info!("Event source is done, ending publish loop");
                    break;
                }
                None => debug!("No event within {:?}", self.queue_poll_timeout),
            }
        }

        summary
    }

    /// Flushes the producer and releases the report channel.
    pub async fn close(self, flush_timeout: Duration) -> Result<(), PublishError> {
        info!("Flushing log producer");
        self.producer.flush(flush_timeout).await
    }
}
