// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded FIFO hand-off between the firehose reader and the publisher.

use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// A bounded queue with timed `offer` and `poll`.
///
/// Any number of tasks may offer and poll through a shared reference. Items leave the queue in
/// the order they were accepted, and an item is only ever lost when `offer` says so by
/// returning `false`.
#[derive(Debug)]
pub struct IntakeQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    capacity: usize,
}

impl<T> IntakeQueue<T> {
    /// Creates a queue holding at most `capacity` items. A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    /// Enqueues `item`, waiting up to `timeout` for a free slot.
    ///
    /// Returns `false` when the queue stayed full for the whole wait. The item is discarded in
    /// that case.
    pub async fn offer(&self, item: T, timeout: Duration) -> bool {
        match self.tx.send_timeout(item, timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                trace!("Intake queue full after {timeout:?}");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Dequeues the oldest item, waiting up to `timeout` for one to arrive.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = tokio::time::timeout_at(deadline, self.rx.lock()).await.ok()?;
        tokio::time::timeout_at(deadline, rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = IntakeQueue::new(4);
        for i in 0..4 {
            assert!(queue.offer(i, SHORT).await);
        }
        assert_eq!(queue.len(), 4);
        for i in 0..4 {
            assert_eq!(queue.poll(SHORT).await, Some(i));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_offer_on_full_queue_times_out() {
        let queue = IntakeQueue::new(2);
        assert!(queue.offer("a", SHORT).await);
        assert!(queue.offer("b", SHORT).await);
        assert!(!queue.offer("c", SHORT).await);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.poll(SHORT).await, Some("a"));
        assert_eq!(queue.poll(SHORT).await, Some("b"));
        assert_eq!(queue.poll(SHORT).await, None);
    }

    #[tokio::test]
    async fn test_poll_on_empty_queue_times_out() {
        let queue: IntakeQueue<String> = IntakeQueue::new(1);
        let started = tokio::time::Instant::now();
        assert_eq!(queue.poll(SHORT).await, None);
        assert!(started.elapsed() >= SHORT);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue: IntakeQueue<u8> = IntakeQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_producer_consumer_keeps_every_item() {
        let queue = Arc::new(IntakeQueue::new(8));
        let total = 500;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..total {
                    while !queue.offer(i, Duration::from_millis(50)).await {}
                }
            })
        };

        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            if let Some(item) = queue.poll(Duration::from_secs(1)).await {
                received.push(item);
            }
        }
        producer.await.unwrap();

        assert_eq!(received, (0..total).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_fifo_within_capacity(items in proptest::collection::vec(any::<u32>(), 1..64)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            let drained = runtime.block_on(async {
                let queue = IntakeQueue::new(64);
                for item in &items {
                    assert!(queue.offer(*item, SHORT).await);
                }
                let mut drained = Vec::new();
                while let Some(item) = queue.poll(Duration::from_millis(1)).await {
                    drained.push(item);
                }
                drained
            });
            prop_assert_eq!(drained, items);
        }
    }
}
