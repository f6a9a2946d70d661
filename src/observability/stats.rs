//! Pipeline counters
//!
//! Lock-free counters shared between tasks. `snapshot()` gives a plain
//! copy for logging and tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for the ingest path
#[derive(Debug, Default)]
pub struct IngestStats {
    batches_flushed: AtomicU64,
    messages_flushed: AtomicU64,
    rows_committed: AtomicU64,
    partitions_committed: AtomicU64,
    partitions_failed: AtomicU64,
    messages_acked: AtomicU64,
    ack_failures: AtomicU64,
    transport_errors: AtomicU64,
    resubscriptions: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStatsSnapshot {
    pub batches_flushed: u64,
    pub messages_flushed: u64,
    pub rows_committed: u64,
    pub partitions_committed: u64,
    pub partitions_failed: u64,
    pub messages_acked: u64,
    pub ack_failures: u64,
    pub transport_errors: u64,
    pub resubscriptions: u64,
}

impl IngestStats {
    pub fn record_flush(&self, messages: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.messages_flushed
            .fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn record_commit(&self, rows: usize) {
        self.partitions_committed.fetch_add(1, Ordering::Relaxed);
        self.rows_committed.fetch_add(rows as u64, Ordering::Relaxed);
    }

    pub fn record_partition_failure(&self) {
        self.partitions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acks(&self, acked: usize, failed: usize) {
        self.messages_acked.fetch_add(acked as u64, Ordering::Relaxed);
        self.ack_failures.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resubscription(&self) {
        self.resubscriptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
            rows_committed: self.rows_committed.load(Ordering::Relaxed),
            partitions_committed: self.partitions_committed.load(Ordering::Relaxed),
            partitions_failed: self.partitions_failed.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
        }
    }
}

/// Counters and last-run timings for snapshots
#[derive(Debug, Default)]
pub struct SnapshotStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    state_failures: AtomicU64,
    analytics_failures: AtomicU64,
    last_total_ms: AtomicU64,
    last_state_ms: AtomicU64,
    last_analytics_ms: AtomicU64,
}

/// Point-in-time copy of [`SnapshotStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotStatsSnapshot {
    pub succeeded: u64,
    pub failed: u64,
    pub state_failures: u64,
    pub analytics_failures: u64,
    pub last_total_ms: u64,
    pub last_state_ms: u64,
    pub last_analytics_ms: u64,
}

impl SnapshotStats {
    /// Record one snapshot run; it succeeds only if both stores did
    pub fn record_run(
        &self,
        state: Result<Duration, ()>,
        analytics: Result<Duration, ()>,
        total: Duration,
    ) {
        match state {
            Ok(d) => self.last_state_ms.store(d.as_millis() as u64, Ordering::Relaxed),
            Err(()) => {
                self.state_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        match analytics {
            Ok(d) => self
                .last_analytics_ms
                .store(d.as_millis() as u64, Ordering::Relaxed),
            Err(()) => {
                self.analytics_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        if state.is_ok() && analytics.is_ok() {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.last_total_ms
            .store(total.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SnapshotStatsSnapshot {
        SnapshotStatsSnapshot {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            state_failures: self.state_failures.load(Ordering::Relaxed),
            analytics_failures: self.analytics_failures.load(Ordering::Relaxed),
            last_total_ms: self.last_total_ms.load(Ordering::Relaxed),
            last_state_ms: self.last_state_ms.load(Ordering::Relaxed),
            last_analytics_ms: self.last_analytics_ms.load(Ordering::Relaxed),
        }
    }
}
