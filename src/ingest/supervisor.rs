//! Recovery Supervisor
//!
//! Owns the subscription lifecycle. Each subscription generation runs a
//! batcher until it fails; the supervisor then waits out the backoff and
//! rebuilds the stream and consumer. A failure to rebuild is fatal so an
//! outer process manager can restart the service.
//!
//! ```text
//!   ┌──────────────► run generation ──── cancelled ──► Ok(())
//!   │                      │
//!   │               transport error / stream end
//!   │                      ▼
//!   └── resubscribe ◄── backoff ──── resubscribe fails ──► Err
//! ```

use crate::ingest::batcher::{BatchSink, RunOutcome, StreamBatcher};
use crate::ingest::broker::{Broker, BrokerError, ConsumerDefinition, StreamDefinition};
use crate::observability::IngestStats;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Fatal supervisor error
#[derive(Debug)]
pub enum SupervisorError {
    /// First subscription could not be established
    Startup(BrokerError),
    /// Subscription could not be re-established after a failure
    Resubscribe(BrokerError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Startup(e) => write!(f, "Failed to subscribe: {}", e),
            SupervisorError::Resubscribe(e) => write!(f, "Failed to resubscribe: {}", e),
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Restarts the ingest subscription after transport failures
pub struct RecoverySupervisor<B: Broker> {
    broker: Arc<B>,
    stream: StreamDefinition,
    consumer: ConsumerDefinition,
    batcher: StreamBatcher,
    backoff: Duration,
    stats: Arc<IngestStats>,
}

impl<B: Broker> RecoverySupervisor<B> {
    pub fn new(
        broker: Arc<B>,
        stream: StreamDefinition,
        consumer: ConsumerDefinition,
        batcher: StreamBatcher,
        backoff: Duration,
        stats: Arc<IngestStats>,
    ) -> Self {
        RecoverySupervisor {
            broker,
            stream,
            consumer,
            batcher,
            backoff,
            stats,
        }
    }

    async fn establish(&self) -> Result<B::Subscription, BrokerError> {
        self.broker.ensure_stream(&self.stream).await?;
        self.broker.subscribe(&self.consumer).await
    }

    /// Run until cancelled or a resubscribe fails
    pub async fn run<K>(
        &self,
        sink: &mut K,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError>
    where
        K: BatchSink + ?Sized,
    {
        let mut subscription = self.establish().await.map_err(SupervisorError::Startup)?;
        info!(
            stream = %self.stream.name,
            consumer = %self.consumer.durable_name,
            "ingest subscription established"
        );

        loop {
            match self.batcher.run(subscription, sink, &cancel).await {
                Ok(RunOutcome::Cancelled) => return Ok(()),
                Ok(RunOutcome::SubscriptionEnded) => {
                    warn!("subscription ended unexpectedly");
                }
                Err(e) => {
                    self.stats.record_transport_error();
                    error!(error = %e, "subscription failed");
                }
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            info!(backoff_ms = self.backoff.as_millis() as u64, "waiting before resubscribe");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.backoff) => {}
            }

            subscription = self.establish().await.map_err(|e| {
                error!(error = %e, "resubscribe failed");
                SupervisorError::Resubscribe(e)
            })?;
            self.stats.record_resubscription();
            info!("ingest subscription re-established");
        }
    }
}
