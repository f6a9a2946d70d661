//! Stream Batcher
//!
//! Turns the consumer's message stream into bounded batches. A puller
//! task reads from the subscription into a bounded queue; the collector
//! drains the queue and hands each batch to the sink.
//!
//! ## Architecture
//!
//! ```text
//! Subscription ──► puller ──► mpsc(batch_size) ──► collector ──► BatchSink
//!                    │                                 ▲
//!                    └── transport error ──────────────┘ (ends this run)
//! ```
//!
//! ## Flush triggers
//!
//! - **Full**: the batch reached `batch_size`
//! - **Deadline**: `flush_timeout` elapsed since the batch's first message
//! - **QueueClosed**: the subscription ended
//! - **Shutdown**: cancellation; the partial batch is still flushed
//!
//! A transport error drops the unflushed batch. Its messages were never
//! acked, so the broker redelivers them to the next subscription.

use crate::ingest::broker::{BrokerError, Subscription};
use crate::ingest::config::IngestConfig;
use crate::ingest::materializer::BatchReport;
use crate::ingest::message::{Batch, InboundMessage};
use crate::observability::IngestStats;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumer of flushed batches
pub trait BatchSink: Send {
    fn process_batch(
        &mut self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = BatchReport> + Send + '_>>;
}

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Full,
    Deadline,
    QueueClosed,
    Shutdown,
}

/// How a batcher run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Cancelled,
    SubscriptionEnded,
}

/// Batching settings
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub batch_size: usize,
    pub flush_timeout: Duration,
}

impl From<&IngestConfig> for BatcherConfig {
    fn from(config: &IngestConfig) -> Self {
        BatcherConfig {
            batch_size: config.batch_size,
            flush_timeout: config.flush_timeout,
        }
    }
}

/// Batches messages from one subscription generation
#[derive(Debug, Clone)]
pub struct StreamBatcher {
    config: BatcherConfig,
    stats: Arc<IngestStats>,
}

impl StreamBatcher {
    pub fn new(config: BatcherConfig, stats: Arc<IngestStats>) -> Self {
        debug_assert!(config.batch_size > 0);
        StreamBatcher { config, stats }
    }

    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    /// Drive `subscription` until it fails, ends or `cancel` fires
    pub async fn run<S, K>(
        &self,
        subscription: S,
        sink: &mut K,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, BrokerError>
    where
        S: Subscription,
        K: BatchSink + ?Sized,
    {
        let (msg_tx, mut msg_rx) = mpsc::channel(self.config.batch_size);
        let (err_tx, mut err_rx) = mpsc::channel(1);
        let puller_cancel = cancel.child_token();
        let puller = tokio::spawn(pull_messages(
            subscription,
            msg_tx,
            err_tx,
            puller_cancel.clone(),
        ));

        let mut batch = Batch::with_capacity(self.config.batch_size);
        let mut deadline: Option<Instant> = None;

        let outcome = loop {
            let flush_at = deadline;
            tokio::select! {
                biased;

                Some(err) = err_rx.recv() => {
                    if !batch.is_empty() {
                        warn!(
                            discarded = batch.len(),
                            "dropping unflushed batch after transport error"
                        );
                    }
                    break Err(err);
                }

                _ = cancel.cancelled() => {
                    self.flush(&mut batch, FlushReason::Shutdown, sink).await;
                    break Ok(RunOutcome::Cancelled);
                }

                _ = wait_until(flush_at), if flush_at.is_some() => {
                    self.flush(&mut batch, FlushReason::Deadline, sink).await;
                    deadline = None;
                }

                received = msg_rx.recv() => match received {
                    Some(message) => {
                        if batch.is_empty() {
                            deadline = Some(Instant::now() + self.config.flush_timeout);
                        }
                        batch.push(message);
                        if batch.len() >= self.config.batch_size {
                            self.flush(&mut batch, FlushReason::Full, sink).await;
                            deadline = None;
                        }
                    }
                    None => {
                        self.flush(&mut batch, FlushReason::QueueClosed, sink).await;
                        break Ok(RunOutcome::SubscriptionEnded);
                    }
                }
            }
        };

        puller_cancel.cancel();
        if let Err(e) = puller.await {
            error!(error = %e, "message puller task failed");
        }
        outcome
    }

    async fn flush<K>(&self, batch: &mut Batch, reason: FlushReason, sink: &mut K)
    where
        K: BatchSink + ?Sized,
    {
        if batch.is_empty() {
            return;
        }
        let full = std::mem::replace(batch, Batch::with_capacity(self.config.batch_size));
        let size = full.len();
        let waited = full.opened_at().elapsed();
        let started = std::time::Instant::now();

        let report = sink.process_batch(full).await;
        self.stats.record_flush(size);

        info!(
            size,
            ?reason,
            rows = report.rows_committed(),
            failed_tables = report.failed.len(),
            waited_ms = waited.as_millis() as u64,
            took_ms = started.elapsed().as_millis() as u64,
            "flushed batch"
        );
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn pull_messages<S: Subscription>(
    mut subscription: S,
    tx: mpsc::Sender<InboundMessage>,
    err_tx: mpsc::Sender<BrokerError>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = subscription.next_message() => next,
        };
        match next {
            Ok(Some(message)) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = tx.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Ok(None) => {
                debug!("subscription ended");
                return;
            }
            Err(e) => {
                error!(error = %e, "subscription failed");
                let _ = err_tx.send(e).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::broker::{Broker, ConsumerDefinition, StreamDefinition};
    use crate::ingest::memory_broker::InMemoryBroker;
    use bytes::Bytes;

    /// Records batch sizes and acks everything
    #[derive(Default)]
    struct RecordingSink {
        sizes: Vec<usize>,
    }

    impl BatchSink for RecordingSink {
        fn process_batch(
            &mut self,
            batch: Batch,
        ) -> Pin<Box<dyn Future<Output = BatchReport> + Send + '_>> {
            Box::pin(async move {
                self.sizes.push(batch.len());
                for m in batch.messages() {
                    m.ack().await.unwrap();
                }
                BatchReport::default()
            })
        }
    }

    async fn setup(count: usize) -> (InMemoryBroker, ConsumerDefinition) {
        let broker = InMemoryBroker::new();
        broker
            .ensure_stream(&StreamDefinition::ingest("ingest", "ingest.", Duration::ZERO))
            .await
            .unwrap();
        for i in 0..count {
            broker
                .publish("ingest.t", Bytes::from(format!("{{\"i\":{}}}", i)), None)
                .await
                .unwrap();
        }
        let consumer = ConsumerDefinition {
            stream: "ingest".to_string(),
            durable_name: "c".to_string(),
            subject_prefix: "ingest.".to_string(),
            max_ack_pending: None,
            max_deliver: None,
        };
        (broker, consumer)
    }

    fn batcher(size: usize, timeout_ms: u64) -> StreamBatcher {
        StreamBatcher::new(
            BatcherConfig {
                batch_size: size,
                flush_timeout: Duration::from_millis(timeout_ms),
            },
            Arc::new(IngestStats::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_then_deadline_flush() {
        let (broker, consumer) = setup(25).await;
        let sub = broker.subscribe(&consumer).await.unwrap();
        let batcher = batcher(10, 2000);
        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::default();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            stopper.cancel();
        });

        let outcome = batcher.run(sub, &mut sink, &cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(sink.sizes, vec![10, 10, 5]);
        assert_eq!(broker.acked_count("ingest", "c"), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_partial_batch() {
        let (broker, consumer) = setup(3).await;
        let sub = broker.subscribe(&consumer).await.unwrap();
        let batcher = batcher(100, 60_000);
        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::default();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        batcher.run(sub, &mut sink, &cancel).await.unwrap();
        assert_eq!(sink.sizes, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_ends_run_without_flush() {
        let (broker, consumer) = setup(3).await;
        let sub = broker.subscribe(&consumer).await.unwrap();
        let batcher = batcher(100, 60_000);
        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::default();

        let dropper = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            dropper.disconnect();
        });

        let err = batcher.run(sub, &mut sink, &cancel).await.unwrap_err();
        assert_eq!(err, BrokerError::Disconnected);
        assert!(sink.sizes.is_empty());
        assert_eq!(broker.acked_count("ingest", "c"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_empty_flushes() {
        let (broker, consumer) = setup(0).await;
        let sub = broker.subscribe(&consumer).await.unwrap();
        let batcher = batcher(10, 50);
        let cancel = CancellationToken::new();
        let mut sink = RecordingSink::default();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            stopper.cancel();
        });

        batcher.run(sub, &mut sink, &cancel).await.unwrap();
        assert!(sink.sizes.is_empty());
    }
}
