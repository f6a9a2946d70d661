//! Configuration for the ingest pipeline

use crate::config::{duration_millis, env_parse, env_string, ConfigError};
use crate::ingest::broker::{ConsumerDefinition, StreamDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default messages per flush
pub const DEFAULT_BATCH_SIZE: usize = 3000;

/// Default flush deadline after the first message of a batch
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Server URL (default: nats://127.0.0.1:4222)
    pub url: String,
    /// Optional auth token
    pub token: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
        }
    }
}

impl BrokerConfig {
    pub fn apply_env(&mut self) {
        if let Some(url) = env_string("NATS_URL") {
            self.url = url;
        }
        if let Some(token) = env_string("NATS_TOKEN") {
            self.token = Some(token);
        }
    }
}

/// Ingest pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Subject prefix; the remainder of a subject is the table name
    pub subject_prefix: String,
    /// Durable stream name
    pub stream_name: String,
    /// Stream retention age, zero for unlimited
    #[serde(with = "duration_millis")]
    pub stream_max_age: Duration,
    /// Explicit consumer name; generated and persisted when absent
    pub consumer_name: Option<String>,
    /// Prefix for generated consumer names
    pub consumer_name_prefix: String,
    /// Messages per flush
    pub batch_size: usize,
    /// Flush deadline after the first message of a batch
    #[serde(with = "duration_millis")]
    pub flush_timeout: Duration,
    /// Wait before resubscribing after a transport failure
    #[serde(with = "duration_millis")]
    pub resubscribe_backoff: Duration,
    /// How long a cached table schema is trusted
    #[serde(with = "duration_millis")]
    pub schema_cache_ttl: Duration,
    /// Delivery attempts before the broker gives up on a message
    pub max_deliver: Option<i64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            subject_prefix: "ingest.".to_string(),
            stream_name: "ingest".to_string(),
            stream_max_age: Duration::ZERO,
            consumer_name: None,
            consumer_name_prefix: "ingest-".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            resubscribe_backoff: Duration::from_secs(60),
            schema_cache_ttl: Duration::from_secs(3600),
            max_deliver: None,
        }
    }
}

impl IngestConfig {
    /// Configuration for tests (small batches, fast timers)
    pub fn test() -> Self {
        IngestConfig {
            consumer_name: Some("test-consumer".to_string()),
            batch_size: 100,
            flush_timeout: Duration::from_millis(50),
            resubscribe_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("INGEST_SUBJECT_PREFIX") {
            self.subject_prefix = v;
        }
        if let Some(v) = env_string("INGEST_STREAM") {
            self.stream_name = v;
        }
        if let Some(v) = env_parse::<u64>("INGEST_STREAM_MAX_AGE_SECS") {
            self.stream_max_age = Duration::from_secs(v);
        }
        if let Some(v) = env_string("INGEST_CONSUMER") {
            self.consumer_name = Some(v);
        }
        if let Some(v) = env_parse("INGEST_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse::<u64>("INGEST_FLUSH_TIMEOUT_MS") {
            self.flush_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("INGEST_RESUBSCRIBE_BACKOFF_MS") {
            self.resubscribe_backoff = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("INGEST_SCHEMA_TTL_SECS") {
            self.schema_cache_ttl = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("INGEST_MAX_DELIVER") {
            self.max_deliver = Some(v);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("ingest.batch_size must be > 0".into()));
        }
        if self.flush_timeout.is_zero() {
            return Err(ConfigError::Invalid("ingest.flush_timeout must be > 0".into()));
        }
        if self.subject_prefix.is_empty() {
            return Err(ConfigError::Invalid("ingest.subject_prefix must not be empty".into()));
        }
        if self.max_deliver.is_some_and(|m| m < 1) {
            return Err(ConfigError::Invalid("ingest.max_deliver must be >= 1".into()));
        }
        Ok(())
    }

    pub fn stream_definition(&self) -> StreamDefinition {
        StreamDefinition::ingest(&self.stream_name, &self.subject_prefix, self.stream_max_age)
    }

    pub fn consumer_definition(&self, durable_name: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            stream: self.stream_name.clone(),
            durable_name: durable_name.to_string(),
            subject_prefix: self.subject_prefix.clone(),
            max_ack_pending: Some(self.batch_size as i64),
            max_deliver: self.max_deliver,
        }
    }

    /// Durable consumer name, stable across restarts
    ///
    /// Uses the configured name if set; otherwise reads `consumer_name`
    /// from `data_dir`, generating and writing it on first start.
    pub fn resolve_consumer_name(&self, data_dir: &Path) -> Result<String, ConfigError> {
        if let Some(name) = &self.consumer_name {
            return Ok(name.clone());
        }
        let path = consumer_name_path(data_dir);
        match std::fs::read_to_string(&path) {
            Ok(name) if !name.trim().is_empty() => return Ok(name.trim().to_string()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(path, e)),
        }
        let name = format!("{}{}", self.consumer_name_prefix, uuid::Uuid::new_v4().simple());
        std::fs::write(&path, &name).map_err(|e| ConfigError::Io(path.clone(), e))?;
        info!(consumer = %name, "generated durable consumer name");
        Ok(name)
    }
}

fn consumer_name_path(data_dir: &Path) -> PathBuf {
    data_dir.join("consumer_name")
}
