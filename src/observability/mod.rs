//! Observability
//!
//! Structured logging through `tracing`, plus process-local counters for
//! the ingest pipeline and snapshots. Counters are read with `snapshot()`
//! and logged; there is no exporter.

pub mod config;
pub mod stats;

pub use config::{LogConfig, LogFormat};
pub use stats::{IngestStats, IngestStatsSnapshot, SnapshotStats, SnapshotStatsSnapshot};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// Returns an error if a subscriber is already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(true);
    match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .flatten_event(true)
            .try_init(),
    }
}
