//! Ingest Daemon
//!
//! Pulls JSON events from NATS JetStream into DuckDB, backs DuckDB and
//! the SQLite state store up to object storage once a day, and restores
//! them from the newest snapshot when their files are missing.
//!
//! ## Usage
//!
//! ```text
//! ingestd [--config <path>]
//! ```
//!
//! See `stream_ingest::config` for environment variables.
//!
//! ## Startup (TigerStyle: explicit steps)
//!
//! 1. Load configuration, install logging
//! 2. Restore missing store files (when enabled); failure exits
//! 3. Open DuckDB and SQLite, connect to the broker
//! 4. Spawn the ingest supervisor, snapshot scheduler and executor
//! 5. Run until Ctrl-C or a fatal supervisor error

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use stream_ingest::config::AppConfig;
use stream_ingest::ingest::{
    BatcherConfig, NatsBroker, RecoverySupervisor, RowMaterializer, StreamBatcher,
};
use stream_ingest::observability::{init_tracing, IngestStats, SnapshotStats};
use stream_ingest::schema::SchemaCache;
use stream_ingest::snapshot::{
    build_object_store, RestoreBootstrapper, SnapshotExecutor, SnapshotScheduler,
};
use stream_ingest::store::{DuckDbStore, SqliteStateStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

fn parse_args() -> Result<Option<PathBuf>, String> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("usage: ingestd [--config <path>]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "ingestd failed");
            eprintln!("ingestd: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = parse_args()?;
    let config = AppConfig::load(config_path.as_deref())?;
    init_tracing(&config.log)?;

    let analytics_path = config.analytics_path();
    let state_path = config.state_path();
    tokio::fs::create_dir_all(&config.data_dir).await?;
    info!(
        data_dir = %config.data_dir.display(),
        analytics = %analytics_path.display(),
        state = %state_path.display(),
        "ingestd starting"
    );

    // Restore must finish before either store file is opened
    if config.snapshot.restore_enabled {
        let object_store = build_object_store(&config.snapshot.object_store)?;
        let report = RestoreBootstrapper::new(object_store, config.snapshot.clone())
            .restore::<DuckDbStore>(&analytics_path, &state_path)
            .await?;
        info!(state = ?report.state, analytics = ?report.analytics, "restore finished");
    }

    let analytics = Arc::new(DuckDbStore::open(&analytics_path)?);
    let state = Arc::new(SqliteStateStore::open(&state_path)?);
    let broker = Arc::new(NatsBroker::connect(&config.broker).await?);

    let consumer_name = config.ingest.resolve_consumer_name(&config.data_dir)?;
    let ingest_stats = Arc::new(IngestStats::default());
    let snapshot_stats = Arc::new(SnapshotStats::default());
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let supervisor = RecoverySupervisor::new(
        broker.clone(),
        config.ingest.stream_definition(),
        config.ingest.consumer_definition(&consumer_name),
        StreamBatcher::new(BatcherConfig::from(&config.ingest), ingest_stats.clone()),
        config.ingest.resubscribe_backoff,
        ingest_stats.clone(),
    );
    let mut materializer = RowMaterializer::new(
        analytics.clone(),
        SchemaCache::new(config.ingest.schema_cache_ttl),
        ingest_stats.clone(),
    );
    let mut ingest = {
        let cancel = cancel.clone();
        tokio::spawn(async move { supervisor.run(&mut materializer, cancel).await })
    };

    if config.snapshot.enabled && config.snapshot.is_configured() {
        let object_store = build_object_store(&config.snapshot.object_store)?;
        let scheduler = SnapshotScheduler::new(
            broker.clone(),
            config.snapshot.stream_definition(),
            config.snapshot.trigger_subject(),
            config.snapshot.schedule_time()?,
        );
        let executor = SnapshotExecutor::new(
            analytics.clone(),
            state.clone(),
            object_store,
            config.snapshot.clone(),
            snapshot_stats.clone(),
        );
        let c = cancel.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(c).await }));
        let c = cancel.clone();
        let b = broker.clone();
        tasks.push(tokio::spawn(async move { executor.run(&*b, c).await }));
    } else if config.snapshot.enabled {
        warn!("snapshots enabled but no destination configured; scheduler disabled");
    }

    {
        let cancel = cancel.clone();
        let ingest_stats = ingest_stats.clone();
        let snapshot_stats = snapshot_stats.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let i = ingest_stats.snapshot();
                        let s = snapshot_stats.snapshot();
                        info!(
                            batches = i.batches_flushed,
                            rows = i.rows_committed,
                            partitions_failed = i.partitions_failed,
                            ack_failures = i.ack_failures,
                            resubscriptions = i.resubscriptions,
                            snapshots_ok = s.succeeded,
                            snapshots_failed = s.failed,
                            "stats"
                        );
                    }
                }
            }
        }));
    }

    let result = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown requested");
            cancel.cancel();
            (&mut ingest).await
        }
        joined = &mut ingest => joined,
    };
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task failed");
        }
    }

    match result {
        Ok(Ok(())) => {
            info!("ingestd stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}
