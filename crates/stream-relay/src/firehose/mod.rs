// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Authenticated streaming client for the keyword-filtered firehose.
//!
//! [`FirehoseClient::connect`] opens the stream and hands the body to a background reader that
//! splits it into lines and offers each one to the [`IntakeQueue`]. The returned
//! [`FirehoseHandle`] stops the reader and reports why it ended.

pub mod oauth;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::credentials::OAuthCredentials;
use crate::errors::FirehoseError;
use crate::http::build_client;
use crate::intake_queue::IntakeQueue;
use crate::publisher::EventSource;

/// Longest line the reader buffers. Anything longer is dropped and counted.
pub const MAX_LINE_BYTES: usize = 512 * 1024;

/// Why the reader task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// `stop` was called
    Stopped,
    /// The remote end closed the body
    RemoteClosed,
    /// The stream failed mid-flight
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirehoseStats {
    pub received: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct FirehoseClient {
    client: reqwest::Client,
    endpoint: String,
    offer_timeout: Duration,
    max_line_bytes: usize,
}

impl FirehoseClient {
    pub fn new(
        endpoint: impl Into<String>,
        offer_timeout: Duration,
        https_proxy: Option<&str>,
    ) -> Result<Self, FirehoseError> {
        let client =
            build_client(https_proxy, None).map_err(|e| FirehoseError::Client(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            offer_timeout,
            max_line_bytes: MAX_LINE_BYTES,
        })
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Opens the filtered stream and starts pushing lines onto `queue`.
    ///
    /// Returns once the endpoint has answered with a success status. A transport failure or any
    /// other status is an error and no reader is started.
    pub async fn connect(
        &self,
        terms: &[String],
        credentials: &OAuthCredentials,
        queue: Arc<IntakeQueue<String>>,
    ) -> Result<FirehoseHandle, FirehoseError> {
        let track = terms.join(",");
        let authorization = oauth::authorization_header(
            "POST",
            &self.endpoint,
            &[("track", track.as_str())],
            credentials,
            &oauth::nonce(),
            oauth::timestamp(),
        );

        info!("Connecting to firehose {} tracking [{track}]", self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .form(&[("track", track.as_str())])
            .send()
            .await
            .map_err(|e| FirehoseError::Connect {
                endpoint: self.endpoint.clone(),
                cause: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FirehoseError::Status {
                endpoint: self.endpoint.clone(),
                status: status.as_u16(),
                body,
            });
        }
        info!("Firehose connected with status {status}");

        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let termination = Arc::new(OnceLock::new());
        let counters = Arc::new(Counters::default());

        let reader = StreamReader {
            queue,
            offer_timeout: self.offer_timeout,
            max_line_bytes: self.max_line_bytes,
            cancel: cancel.clone(),
            counters: Arc::clone(&counters),
        };
        let task = {
            let done = done.clone();
            let termination = Arc::clone(&termination);
            tokio::spawn(async move {
                let ended = reader.read(response).await;
                match &ended {
                    Termination::Failed(cause) => error!("Firehose stream failed: {cause}"),
                    other => debug!("Firehose reader ended: {other:?}"),
                }
                let _ = termination.set(ended);
                done.cancel();
            })
        };

        Ok(FirehoseHandle {
            cancel,
            done,
            termination,
            counters,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }
}

struct StreamReader {
    queue: Arc<IntakeQueue<String>>,
    offer_timeout: Duration,
    max_line_bytes: usize,
    cancel: CancellationToken,
    counters: Arc<Counters>,
}

impl StreamReader {
    async fn read(&self, response: reqwest::Response) -> Termination {
        let mut body = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        // Set while skipping the rest of a line that outgrew the buffer.
        let mut discarding = false;

        loop {
            let chunk = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Termination::Stopped,
                chunk = body.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    pending.extend_from_slice(&bytes);
                    while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        if std::mem::take(&mut discarding) {
                            continue;
                        }
                        if !self.deliver(&line).await {
                            return Termination::Stopped;
                        }
                    }
                    // One extra byte leaves room for a trailing '\r'.
                    if pending.len() > self.max_line_bytes + 1 {
                        if !discarding {
                            self.drop_oversized(pending.len());
                            discarding = true;
                        }
                        pending.clear();
                    }
                }
                Some(Err(e)) => return Termination::Failed(e.to_string()),
                None => {
                    if !pending.is_empty() && !discarding {
                        let line = std::mem::take(&mut pending);
                        if !self.deliver(&line).await {
                            return Termination::Stopped;
                        }
                    }
                    return Termination::RemoteClosed;
                }
            }
        }
    }

    /// Offers one line to the queue. Returns false when the reader was stopped while waiting.
    async fn deliver(&self, raw: &[u8]) -> bool {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            return true;
        }
        if line.len() > self.max_line_bytes {
            self.drop_oversized(line.len());
            return true;
        }

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let offered = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return false,
            offered = self.queue.offer(line.to_string(), self.offer_timeout) => offered,
        };
        if !offered {
            let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Intake queue full for {:?}, dropping event ({dropped} dropped so far)",
                self.offer_timeout
            );
        }
        true
    }

    fn drop_oversized(&self, len: usize) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            "Event exceeds {} bytes ({len} buffered), dropping it ({dropped} dropped so far)",
            self.max_line_bytes
        );
    }
}

/// Control handle for a connected firehose.
#[derive(Debug)]
pub struct FirehoseHandle {
    cancel: CancellationToken,
    done: CancellationToken,
    termination: Arc<OnceLock<Termination>>,
    counters: Arc<Counters>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl FirehoseHandle {
    /// Requests the reader to stop. Calling it again has no effect.
    pub fn stop(&self) {
        if !self.cancel.is_cancelled() {
            info!("Stopping firehose");
            self.cancel.cancel();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// `None` while the reader is still running.
    pub fn termination(&self) -> Option<Termination> {
        self.termination.get().cloned()
    }

    pub fn stats(&self) -> FirehoseStats {
        FirehoseStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Waits up to `timeout` for the reader task. The task is aborted if it does not finish in
    /// time. Returns true when it finished on its own.
    pub async fn join(&self, timeout: Duration) -> bool {
        let Some(mut task) = self.task.lock().await.take() else {
            return true;
        };
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Firehose reader task failed: {e}");
                true
            }
            Err(_) => {
                warn!("Firehose reader did not finish within {timeout:?}, aborting");
                task.abort();
                false
            }
        }
    }
}

impl EventSource for FirehoseHandle {
    fn is_done(&self) -> bool {
        FirehoseHandle::is_done(self)
    }

    fn stop(&self) {
        FirehoseHandle::stop(self);
    }
}
