// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded loop that reads the log and writes each record into the index.
//!
//! A run stops after `max_inserts` successful writes, on shutdown, or on the first failed poll or
//! write. The index client is closed exactly once on every one of those paths.

use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::{ConfigError, IndexWriterError};
use crate::index::{DocumentIndex, IndexRequest};
use crate::log_consumer::{LogRecord, LogSubscriber};

/// How document ids are chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DocumentIdStrategy {
    /// The index assigns an id on every write
    #[default]
    ServerAssigned,
    /// `<topic>_<partition>_<offset>`, so a re-delivered record replaces its document
    RecordCoordinates,
}

impl DocumentIdStrategy {
    pub fn document_id(self, record: &LogRecord) -> Option<String> {
        match self {
            Self::ServerAssigned => None,
            Self::RecordCoordinates => Some(format!(
                "{}_{}_{}",
                record.topic, record.partition, record.offset
            )),
        }
    }
}

impl FromStr for DocumentIdStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "server" => Ok(Self::ServerAssigned),
            "record" => Ok(Self::RecordCoordinates),
            other => Err(ConfigError::Invalid(format!(
                "Invalid document id strategy '{other}'. Must be one of: server, record"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexWriterConfig {
    pub index_name: String,
    pub doc_type: String,
    pub max_inserts: usize,
    pub poll_interval: Duration,
    pub pacing_delay: Duration,
    pub id_strategy: DocumentIdStrategy,
}

/// Successful writes so far in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertBudget {
    inserted: usize,
    max: usize,
}

impl InsertBudget {
    pub fn new(max: usize) -> Self {
        Self { inserted: 0, max }
    }

    pub fn record_insert(&mut self) {
        self.inserted += 1;
    }

    pub fn is_exhausted(&self) -> bool {
        self.inserted >= self.max
    }

    pub fn inserted(&self) -> usize {
        self.inserted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    BudgetExhausted,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSummary {
    pub inserted: usize,
    pub stopped_by: StopReason,
}

/// Turns a log payload into an index document.
///
/// JSON objects are indexed as they are. Anything else is wrapped as `{"text": payload}`.
pub fn document_from_payload(payload: &str) -> Value {
    match serde_json::from_str::<Value>(payload) {
        Ok(value @ Value::Object(_)) => value,
        _ => serde_json::json!({ "text": payload }),
    }
}

pub struct IndexWriter<S, I> {
    subscriber: S,
    index: I,
    config: IndexWriterConfig,
}

impl<S, I> IndexWriter<S, I>
where
    S: LogSubscriber,
    I: DocumentIndex,
{
    pub fn new(subscriber: S, index: I, config: IndexWriterConfig) -> Self {
        Self {
            subscriber,
            index,
            config,
        }
    }

    /// Runs the writer to completion and closes the index client.
    pub async fn run(
        mut self,
        shutdown: &CancellationToken,
    ) -> Result<IndexSummary, IndexWriterError> {
        info!(
            "Index writer started, up to {} inserts into {}/{}",
            self.config.max_inserts, self.config.index_name, self.config.doc_type
        );
        let mut budget = InsertBudget::new(self.config.max_inserts);
        let result = self.drain(&mut budget, shutdown).await;
        self.index.close().await;

        match &result {
            Ok(summary) => info!(
                "Index writer finished after {} inserts ({:?})",
                summary.inserted, summary.stopped_by
            ),
            Err(e) => info!(
                "Index writer failed after {} inserts: {e}",
                budget.inserted()
            ),
        }
        result
    }

    async fn drain(
        &mut self,
        budget: &mut InsertBudget,
        shutdown: &CancellationToken,
    ) -> Result<IndexSummary, IndexWriterError> {
        let summary = |budget: &InsertBudget, stopped_by| IndexSummary {
            inserted: budget.inserted(),
            stopped_by,
        };

        loop {
            let records = tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(summary(budget, StopReason::Shutdown)),
                records = self.subscriber.poll_batch(self.config.poll_interval) => records?,
            };

            if !records.is_empty() {
                info!("Received {} records", records.len());
            }

            for record in records {
                if shutdown.is_cancelled() {
                    return Ok(summary(budget, StopReason::Shutdown));
                }

                let request = IndexRequest {
                    index: self.config.index_name.clone(),
                    doc_type: self.config.doc_type.clone(),
                    id: self.config.id_strategy.document_id(&record),
                    document: document_from_payload(&record.payload),
                };
                let id = self.index.index(request).await?;
                info!(
                    "GET /{}/{}/{id}",
                    self.config.index_name, self.config.doc_type
                );
                self.subscriber.ack(&record)?;

                budget.record_insert();
                if budget.is_exhausted() {
                    return Ok(summary(budget, StopReason::BudgetExhausted));
                }

                debug!("Pacing for {:?}", self.config.pacing_delay);
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => return Ok(summary(budget, StopReason::Shutdown)),
                    () = tokio::time::sleep(self.config.pacing_delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::{ConsumeError, IndexError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedSubscriber {
        batches: VecDeque<Result<Vec<LogRecord>, ConsumeError>>,
        acked: Arc<Mutex<Vec<i64>>>,
    }

    fn scripted<const N: usize>(
        batches: [Result<Vec<LogRecord>, ConsumeError>; N],
    ) -> ScriptedSubscriber {
        ScriptedSubscriber {
            batches: VecDeque::from(batches),
            acked: Arc::default(),
        }
    }

    #[async_trait]
    impl LogSubscriber for ScriptedSubscriber {
        async fn poll_batch(
            &mut self,
            timeout: Duration,
        ) -> Result<Vec<LogRecord>, ConsumeError> {
            match self.batches.pop_front() {
                Some(batch) => batch,
                None => {
                    tokio::time::sleep(timeout).await;
                    Ok(Vec::new())
                }
            }
        }

        fn ack(&mut self, record: &LogRecord) -> Result<(), ConsumeError> {
            self.acked.lock().unwrap().push(record.offset);
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct CountingIndex {
        writes: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<IndexRequest>>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl DocumentIndex for CountingIndex {
        async fn index(&self, request: IndexRequest) -> Result<String, IndexError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                return Err(IndexError::Rejected {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.requests.lock().unwrap().push(request);
            Ok(format!("doc-{n}"))
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record(offset: i64, payload: &str) -> LogRecord {
        LogRecord {
            topic: "twitter_tweets".to_string(),
            partition: 0,
            offset,
            key: None,
            payload: payload.to_string(),
        }
    }

    fn batch(range: std::ops::Range<i64>) -> Vec<LogRecord> {
        range.map(|i| record(i, &format!("tweet {i}"))).collect()
    }

    fn config(max_inserts: usize) -> IndexWriterConfig {
        IndexWriterConfig {
            index_name: "twitter".to_string(),
            doc_type: "tweets".to_string(),
            max_inserts,
            poll_interval: Duration::from_millis(5),
            pacing_delay: Duration::ZERO,
            id_strategy: DocumentIdStrategy::ServerAssigned,
        }
    }

    #[tokio::test]
    async fn test_stops_after_max_inserts_and_closes_once() {
        let subscriber = scripted([Ok(batch(0..3)), Ok(Vec::new()), Ok(batch(3..10))]);
        let index = CountingIndex::default();
        let writer = IndexWriter::new(subscriber, index.clone(), config(5));

        let summary = writer.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            summary,
            IndexSummary {
                inserted: 5,
                stopped_by: StopReason::BudgetExhausted
            }
        );
        assert_eq!(index.writes.load(Ordering::SeqCst), 5);
        assert_eq!(index.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_only_indexed_records_are_acknowledged() {
        let subscriber = scripted([Ok(batch(0..500))]);
        let acked = Arc::clone(&subscriber.acked);
        let index = CountingIndex::default();
        let mut config = config(5);
        config.id_strategy = DocumentIdStrategy::RecordCoordinates;
        IndexWriter::new(subscriber, index.clone(), config)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        let indexed: Vec<i64> = index
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| {
                let id = r.id.as_deref().unwrap();
                id.rsplit('_').next().unwrap().parse().unwrap()
            })
            .collect();
        assert_eq!(indexed, vec![0, 1, 2, 3, 4]);
        assert_eq!(*acked.lock().unwrap(), indexed);
    }

    #[tokio::test]
    async fn test_failed_write_is_not_acknowledged() {
        let subscriber = scripted([Ok(batch(0..4))]);
        let acked = Arc::clone(&subscriber.acked);
        let index = CountingIndex {
            fail_on: Some(2),
            ..Default::default()
        };
        let result = IndexWriter::new(subscriber, index, config(5))
            .run(&CancellationToken::new())
            .await;

        assert!(result.is_err());
        assert_eq!(*acked.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_write_failure_closes_index() {
        let subscriber = scripted([Ok(batch(0..4))]);
        let index = CountingIndex {
            fail_on: Some(1),
            ..Default::default()
        };
        let writer = IndexWriter::new(subscriber, index.clone(), config(5));

        let result = writer.run(&CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(IndexWriterError::Index(IndexError::Rejected { status: 503, .. }))
        ));
        assert_eq!(index.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_failure_closes_index() {
        let subscriber = scripted([Err(ConsumeError::Poll("broker down".to_string()))]);
        let index = CountingIndex::default();
        let writer = IndexWriter::new(subscriber, index.clone(), config(5));

        assert!(matches!(
            writer.run(&CancellationToken::new()).await,
            Err(IndexWriterError::Consume(_))
        ));
        assert_eq!(index.writes.load(Ordering::SeqCst), 0);
        assert_eq!(index.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_during_pacing_closes_index() {
        let subscriber = scripted([Ok(batch(0..5))]);
        let index = CountingIndex::default();
        let mut config = config(5);
        config.pacing_delay = Duration::from_secs(30);
        let writer = IndexWriter::new(subscriber, index.clone(), config);

        let shutdown = CancellationToken::new();
        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                shutdown.cancel();
            })
        };

        let summary = tokio::time::timeout(Duration::from_secs(5), writer.run(&shutdown))
            .await
            .unwrap()
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(
            summary,
            IndexSummary {
                inserted: 1,
                stopped_by: StopReason::Shutdown
            }
        );
        assert_eq!(index.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_record_coordinates_ids() {
        let subscriber = scripted([Ok(vec![record(42, r#"{"text":"hi","lang":"en"}"#)])]);
        let index = CountingIndex::default();
        let mut config = config(1);
        config.id_strategy = DocumentIdStrategy::RecordCoordinates;
        IndexWriter::new(subscriber, index.clone(), config)
            .run(&CancellationToken::new())
            .await
            .unwrap();

        let requests = index.requests.lock().unwrap();
        assert_eq!(requests[0].id.as_deref(), Some("twitter_tweets_0_42"));
        assert_eq!(
            requests[0].document,
            serde_json::json!({"text": "hi", "lang": "en"})
        );
    }

    #[test]
    fn test_document_from_payload_wraps_non_objects() {
        assert_eq!(
            document_from_payload("hello world"),
            serde_json::json!({"text": "hello world"})
        );
        assert_eq!(document_from_payload(""), serde_json::json!({"text": ""}));
        assert_eq!(document_from_payload("42"), serde_json::json!({"text": "42"}));
    }

    #[test]
    fn test_id_strategy_from_str() {
        assert_eq!(
            "Record".parse::<DocumentIdStrategy>().unwrap(),
            DocumentIdStrategy::RecordCoordinates
        );
        assert!("uuid".parse::<DocumentIdStrategy>().is_err());
    }
}
