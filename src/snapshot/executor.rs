//! Snapshot Executor
//!
//! Consumes snapshot triggers from the work queue and backs up both local
//! stores to object storage.
//!
//! ## Flow (TigerStyle: explicit steps)
//!
//! 1. Ack the trigger (the scheduler's dedup id makes triggers unique)
//! 2. State store: hot copy into a temp dir, upload as one object
//! 3. Analytical store: export either straight to the bucket using a
//!    scoped secret, or into a temp dir uploaded file by file
//! 4. `load.sql` is written last; an export without it is incomplete
//!
//! Steps 2 and 3 succeed or fail independently. Failures are logged and
//! counted; the next trigger simply tries again.

use crate::ingest::broker::{Broker, BrokerError, Subscription};
use crate::observability::SnapshotStats;
use crate::snapshot::config::SnapshotConfig;
use crate::snapshot::key::{SnapshotKey, StoreKind};
use crate::snapshot::object_store::ObjectStore;
use crate::store::{AnalyticalStore, StateStore, StoreError, EXPORT_MANIFEST};
use chrono::{DateTime, Utc};
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error type for one half of a snapshot
#[derive(Debug)]
pub enum SnapshotError {
    /// Destination bucket does not exist
    BucketMissing,
    /// Object storage or local file I/O failed
    Io(IoError),
    /// Store refused the copy or export
    Store(StoreError),
    /// Blocking task panicked or was cancelled
    Task(String),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::BucketMissing => write!(f, "Snapshot bucket does not exist"),
            SnapshotError::Io(e) => write!(f, "I/O error: {}", e),
            SnapshotError::Store(e) => write!(f, "Store error: {}", e),
            SnapshotError::Task(msg) => write!(f, "Snapshot task failed: {}", msg),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<IoError> for SnapshotError {
    fn from(e: IoError) -> Self {
        SnapshotError::Io(e)
    }
}

impl From<StoreError> for SnapshotError {
    fn from(e: StoreError) -> Self {
        SnapshotError::Store(e)
    }
}

impl From<tokio::task::JoinError> for SnapshotError {
    fn from(e: tokio::task::JoinError) -> Self {
        SnapshotError::Task(e.to_string())
    }
}

/// Result of one snapshot run
#[derive(Debug)]
pub struct SnapshotOutcome {
    pub at: DateTime<Utc>,
    pub state: Result<SnapshotKey, SnapshotError>,
    pub analytics: Result<SnapshotKey, SnapshotError>,
    pub elapsed: Duration,
}

impl SnapshotOutcome {
    /// Both stores were backed up
    pub fn is_success(&self) -> bool {
        self.state.is_ok() && self.analytics.is_ok()
    }
}

/// Backs up the local stores when a trigger arrives
pub struct SnapshotExecutor<A: AnalyticalStore, T: StateStore> {
    analytics: Arc<A>,
    state: Arc<T>,
    object_store: Arc<dyn ObjectStore>,
    config: SnapshotConfig,
    stats: Arc<SnapshotStats>,
}

impl<A: AnalyticalStore, T: StateStore> SnapshotExecutor<A, T> {
    pub fn new(
        analytics: Arc<A>,
        state: Arc<T>,
        object_store: Arc<dyn ObjectStore>,
        config: SnapshotConfig,
        stats: Arc<SnapshotStats>,
    ) -> Self {
        SnapshotExecutor {
            analytics,
            state,
            object_store,
            config,
            stats,
        }
    }

    /// Consume triggers until cancelled
    ///
    /// Broker failures are retried after `retry_backoff`; they never stop
    /// the executor.
    pub async fn run<B: Broker>(&self, broker: &B, cancel: CancellationToken) {
        let stream = self.config.stream_definition();
        let consumer = self.config.consumer_definition();

        loop {
            let subscribed = async {
                broker.ensure_stream(&stream).await?;
                broker.subscribe(&consumer).await
            };
            let result = match subscribed.await {
                Ok(subscription) => {
                    info!(consumer = %consumer.durable_name, "snapshot executor subscribed");
                    self.consume(subscription, &cancel).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) if cancel.is_cancelled() => return,
                Ok(()) => warn!("snapshot trigger subscription ended"),
                Err(e) => error!(error = %e, "snapshot trigger subscription failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.retry_backoff) => {}
            }
        }
    }

    async fn consume<S: Subscription>(
        &self,
        mut subscription: S,
        cancel: &CancellationToken,
    ) -> Result<(), BrokerError> {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = subscription.next_message() => next?,
            };
            let Some(message) = message else {
                return Ok(());
            };

            if let Err(e) = message.ack().await {
                warn!(sequence = message.sequence(), error = %e, "failed to ack snapshot trigger");
            }
            self.perform_snapshot(Utc::now()).await;
        }
    }

    /// Back up both stores under keys for `at`
    pub async fn perform_snapshot(&self, at: DateTime<Utc>) -> SnapshotOutcome {
        let started = Instant::now();
        info!(at = %at.to_rfc3339(), "snapshot started");

        let state_started = Instant::now();
        let state = self.snapshot_state(at).await;
        let state_elapsed = state_started.elapsed();

        let analytics_started = Instant::now();
        let analytics = self.snapshot_analytics(at).await;
        let analytics_elapsed = analytics_started.elapsed();

        match &state {
            Ok(key) => info!(
                key = %key.key,
                duration_ms = state_elapsed.as_millis() as u64,
                "state snapshot uploaded"
            ),
            Err(e) => error!(error = %e, "state snapshot failed"),
        }
        match &analytics {
            Ok(key) => info!(
                key = %key.key,
                duration_ms = analytics_elapsed.as_millis() as u64,
                "analytics snapshot uploaded"
            ),
            Err(e) => error!(error = %e, "analytics snapshot failed"),
        }

        let elapsed = started.elapsed();
        self.stats.record_run(
            state.as_ref().map(|_| state_elapsed).map_err(|_| ()),
            analytics.as_ref().map(|_| analytics_elapsed).map_err(|_| ()),
            elapsed,
        );

        let outcome = SnapshotOutcome {
            at,
            state,
            analytics,
            elapsed,
        };
        if outcome.is_success() {
            info!(duration_ms = elapsed.as_millis() as u64, "snapshot completed");
        } else {
            warn!(duration_ms = elapsed.as_millis() as u64, "snapshot incomplete");
        }
        outcome
    }

    async fn ensure_bucket(&self) -> Result<(), SnapshotError> {
        if self.object_store.bucket_exists().await? {
            Ok(())
        } else {
            Err(SnapshotError::BucketMissing)
        }
    }

    async fn snapshot_state(&self, at: DateTime<Utc>) -> Result<SnapshotKey, SnapshotError> {
        let key = SnapshotKey::new(&self.config.prefix, StoreKind::State, at);
        self.ensure_bucket().await?;

        let staging = tempfile::tempdir()?;
        let copy = staging.path().join("state.db");
        let state = self.state.clone();
        let dest = copy.clone();
        tokio::task::spawn_blocking(move || state.hot_copy(&dest)).await??;

        self.object_store.put_file(&key.key, &copy).await?;
        Ok(key)
    }

    async fn snapshot_analytics(&self, at: DateTime<Utc>) -> Result<SnapshotKey, SnapshotError> {
        let key = SnapshotKey::new(&self.config.prefix, StoreKind::Analytics, at);
        self.ensure_bucket().await?;

        let direct = self
            .object_store
            .direct_url(&key.key)
            .and_then(|url| self.config.remote_secret(&url).map(|secret| (url, secret)));

        match direct {
            Some((url, secret)) => {
                let store = self.analytics.clone();
                let location = url.trim_end_matches('/').to_string();
                tokio::task::spawn_blocking(move || {
                    store.create_secret(&secret)?;
                    let exported = store.export_database(&location);
                    let dropped = store.drop_secret(&secret.name);
                    exported.and(dropped)
                })
                .await??;
            }
            None => {
                let staging = tempfile::tempdir()?;
                let dir = staging.path().join("export");
                let location = dir
                    .to_str()
                    .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "non-UTF-8 temp path"))?
                    .to_string();
                let store = self.analytics.clone();
                tokio::task::spawn_blocking(move || store.export_database(&location)).await??;

                for (relative, path) in export_files(&dir)? {
                    self.object_store
                        .put_file(&key.child_key(&relative), &path)
                        .await?;
                }
            }
        }
        Ok(key)
    }
}

/// Files under `dir` as (relative key, path), manifest last
fn export_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, IoError> {
    fn walk(dir: &Path, base: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<(), IoError> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(&path, base, out)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((relative, path));
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    if !files.iter().any(|(name, _)| name == EXPORT_MANIFEST) {
        return Err(IoError::new(
            ErrorKind::NotFound,
            format!("export produced no {}", EXPORT_MANIFEST),
        ));
    }
    files.sort_by(|(a, _), (b, _)| {
        (a == EXPORT_MANIFEST)
            .cmp(&(b == EXPORT_MANIFEST))
            .then_with(|| a.cmp(b))
    });
    Ok(files)
}
