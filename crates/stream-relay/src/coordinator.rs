// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup and shutdown ordering for both sides of the relay.
//!
//! Components only know how to stop or close themselves. The order in which that happens
//! lives here.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::credentials::{CredentialLoader, INDEX_RESOURCE, OAUTH_RESOURCE};
use crate::errors::{FirehoseError, PublishError, RelayError};
use crate::firehose::{FirehoseClient, FirehoseHandle, FirehoseStats, Termination};
use crate::index::{DocumentIndex, ElasticsearchIndex};
use crate::index_writer::{IndexSummary, IndexWriter, IndexWriterConfig};
use crate::intake_queue::IntakeQueue;
use crate::log_consumer::KafkaLogSubscriber;
use crate::publisher::{
    DeliveryReports, DeliverySummary, KafkaLogProducer, LogPublisher, PublisherConfig,
};

const FIREHOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const REPORTS_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub published: u64,
    pub delivery: DeliverySummary,
    pub firehose: FirehoseStats,
}

/// Cancels `token` on Ctrl-C or SIGTERM. Returns early if the token is cancelled elsewhere.
pub async fn shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = token.cancelled() => {}
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                info!("Received Ctrl+C, initiating shutdown");
                token.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
        },
        () = terminate => {
            info!("Received SIGTERM, initiating shutdown");
            token.cancel();
        }
    }
}

/// Firehose to log. Runs until the firehose ends or a signal arrives.
pub async fn run_ingest(config: &RelayConfig, terms: Vec<String>) -> Result<IngestSummary, RelayError> {
    let credentials = CredentialLoader::new(&config.resource_dir).load_oauth(OAUTH_RESOURCE)?;

    let queue = Arc::new(IntakeQueue::new(config.queue_capacity));
    let client = FirehoseClient::new(
        config.firehose_url.as_str(),
        config.offer_timeout,
        config.https_proxy.as_deref(),
    )?;
    let firehose = client
        .connect(&terms, &credentials, Arc::clone(&queue))
        .await?;

    let producer = match KafkaLogProducer::new(&config.bootstrap_servers, config.flush_timeout) {
        Ok(producer) => producer,
        Err(e) => {
            firehose.stop();
            firehose.join(FIREHOSE_JOIN_TIMEOUT).await;
            return Err(e.into());
        }
    };
    let (publisher, reports) = LogPublisher::new(
        Arc::new(producer),
        PublisherConfig {
            topic: config.topic.clone(),
            terms,
            queue_poll_timeout: config.queue_poll_timeout,
        },
    );

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));
    let result = drive_ingest(
        firehose,
        queue,
        publisher,
        reports,
        &shutdown,
        config.flush_timeout,
    )
    .await;
    signals.abort();
    result
}

/// Runs the publish loop over an already connected firehose, then [`shutdown_ingest`].
///
/// A firehose that failed mid-stream is reported as an error once shutdown has completed.
pub async fn drive_ingest(
    firehose: FirehoseHandle,
    queue: Arc<IntakeQueue<String>>,
    publisher: LogPublisher,
    reports: DeliveryReports,
    shutdown: &CancellationToken,
    flush_timeout: Duration,
) -> Result<IngestSummary, RelayError> {
    let reports = tokio::spawn(reports.run());

    let published = publisher.run(&queue, &firehose, shutdown).await;
    info!("Publish loop ended after {} events", published.published);

    let (flushed, delivery) = shutdown_ingest(&firehose, publisher, reports, flush_timeout).await;

    let stats = firehose.stats();
    info!(
        "Ingest finished: {} published, {} delivered, {} failed, {} dropped at intake",
        published.published, delivery.delivered, delivery.failed, stats.dropped
    );

    if let Some(Termination::Failed(cause)) = firehose.termination() {
        return Err(FirehoseError::Stream(cause).into());
    }
    flushed?;

    Ok(IngestSummary {
        published: published.published,
        delivery,
        firehose: stats,
    })
}

/// Stops the firehose and waits for its reader, flushes and closes the publisher, then waits
/// for the delivery report task.
///
/// Takes the publisher and the report task by value, so it can only run once per ingest.
pub async fn shutdown_ingest(
    firehose: &FirehoseHandle,
    publisher: LogPublisher,
    reports: JoinHandle<DeliverySummary>,
    flush_timeout: Duration,
) -> (Result<(), PublishError>, DeliverySummary) {
    info!("Running shutdown sequence");
    firehose.stop();
    firehose.join(FIREHOSE_JOIN_TIMEOUT).await;

    let flushed = publisher.close(flush_timeout).await;
    if let Err(e) = &flushed {
        error!("{e}");
    }

    let delivery = match tokio::time::timeout(REPORTS_JOIN_TIMEOUT, reports).await {
        Ok(Ok(summary)) => summary,
        Ok(Err(e)) => {
            error!("Delivery report task failed: {e}");
            DeliverySummary::default()
        }
        Err(_) => {
            warn!("Delivery reports still pending after {REPORTS_JOIN_TIMEOUT:?}");
            DeliverySummary::default()
        }
    };
    (flushed, delivery)
}

/// Log to index. Runs until the insert budget is spent, a signal arrives, or a write fails.
pub async fn run_indexer(config: &RelayConfig) -> Result<IndexSummary, RelayError> {
    let credentials = CredentialLoader::new(&config.resource_dir).load_index(INDEX_RESOURCE)?;

    let index = ElasticsearchIndex::new(
        &credentials,
        config.index_url.as_deref(),
        config.https_proxy.as_deref(),
    )?;
    let subscriber = match KafkaLogSubscriber::new(
        &config.bootstrap_servers,
        &config.consumer_group,
        &config.topic,
    ) {
        Ok(subscriber) => subscriber,
        Err(e) => {
            index.close().await;
            return Err(e.into());
        }
    };

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(shutdown.clone()));
    let result = IndexWriter::new(subscriber, index, writer_config(config))
        .run(&shutdown)
        .await;
    signals.abort();
    Ok(result?)
}

pub fn writer_config(config: &RelayConfig) -> IndexWriterConfig {
    IndexWriterConfig {
        index_name: config.index_name.clone(),
        doc_type: config.doc_type.clone(),
        max_inserts: config.max_inserts,
        poll_interval: config.poll_interval,
        pacing_delay: config.pacing_delay,
        id_strategy: config.document_ids,
    }
}
