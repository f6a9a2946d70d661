//! Configuration for snapshots and restore

use crate::config::{duration_millis, env_bool, env_string, ConfigError};
use crate::ingest::broker::{ConsumerDefinition, StreamDefinition};
use crate::store::RemoteSecret;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Snapshot and restore settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Run scheduled snapshots
    pub enabled: bool,
    /// Restore missing local stores from the latest snapshot at startup
    pub restore_enabled: bool,
    /// Daily wall-clock time, "HH:MM" (local time)
    pub schedule: String,
    /// Key prefix for every snapshot object
    pub prefix: String,
    /// Trigger stream (work queue, one pending trigger)
    pub stream_name: String,
    /// Trigger subject prefix
    pub subject_prefix: String,
    /// Durable consumer shared by all executor replicas
    pub consumer_name: String,
    /// Name of the temporary store secret used for direct exports
    pub secret_name: String,
    /// Wait before resubscribing the executor after a broker failure
    #[serde(with = "duration_millis")]
    pub retry_backoff: Duration,
    /// Destination
    pub object_store: ObjectStoreConfig,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        SnapshotConfig {
            enabled: false,
            restore_enabled: false,
            schedule: "01:00".to_string(),
            prefix: "snapshots/".to_string(),
            stream_name: "snapshots".to_string(),
            subject_prefix: "snapshots.".to_string(),
            consumer_name: "snapshot-executor".to_string(),
            secret_name: "snapshot_s3".to_string(),
            retry_backoff: Duration::from_secs(60),
            object_store: ObjectStoreConfig::default(),
        }
    }
}

impl SnapshotConfig {
    /// Configuration for tests (in-memory destination)
    pub fn test() -> Self {
        SnapshotConfig {
            enabled: true,
            restore_enabled: true,
            prefix: "test/".to_string(),
            retry_backoff: Duration::from_millis(10),
            object_store: ObjectStoreConfig {
                store_type: ObjectStoreType::InMemory,
                local_path: None,
                s3: None,
            },
            ..Default::default()
        }
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_bool("SNAPSHOT_ENABLED") {
            self.enabled = v;
        }
        if let Some(v) = env_bool("SNAPSHOT_RESTORE_ENABLED") {
            self.restore_enabled = v;
        }
        if let Some(v) = env_string("SNAPSHOT_SCHEDULE") {
            self.schedule = v;
        }
        if let Some(v) = env_string("SNAPSHOT_PREFIX") {
            self.prefix = v;
        }
        if let Some(v) = env_string("SNAPSHOT_LOCAL_PATH") {
            self.object_store.store_type = ObjectStoreType::LocalFs;
            self.object_store.local_path = Some(PathBuf::from(v));
        }
        if let Some(bucket) = env_string("S3_BUCKET") {
            let mut s3 = self.object_store.s3.take().unwrap_or_default();
            s3.bucket = bucket;
            self.object_store.s3 = Some(s3);
            self.object_store.store_type = ObjectStoreType::S3;
        }
        if let Some(s3) = self.object_store.s3.as_mut() {
            s3.apply_env();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule_time()?;
        match self.object_store.store_type {
            ObjectStoreType::LocalFs if self.object_store.local_path.is_none() => {
                Err(ConfigError::Invalid(
                    "snapshot.object_store.local_path is required for LocalFs".into(),
                ))
            }
            ObjectStoreType::S3
                if self
                    .object_store
                    .s3
                    .as_ref()
                    .map_or(true, |s| s.bucket.is_empty()) =>
            {
                Err(ConfigError::Invalid(
                    "snapshot.object_store.s3.bucket is required for S3".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    /// True when a real destination is configured
    pub fn is_configured(&self) -> bool {
        match self.object_store.store_type {
            ObjectStoreType::InMemory => false,
            ObjectStoreType::LocalFs => self.object_store.local_path.is_some(),
            ObjectStoreType::S3 => self
                .object_store
                .s3
                .as_ref()
                .is_some_and(|s| !s.bucket.is_empty()),
        }
    }

    pub fn schedule_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(self.schedule.trim(), "%H:%M").map_err(|e| {
            ConfigError::Invalid(format!("snapshot.schedule {:?}: {}", self.schedule, e))
        })
    }

    /// Subject the scheduler publishes triggers on
    pub fn trigger_subject(&self) -> String {
        format!("{}run", self.subject_prefix)
    }

    pub fn stream_definition(&self) -> StreamDefinition {
        StreamDefinition::single_slot_work_queue(&self.stream_name, &self.subject_prefix)
    }

    pub fn consumer_definition(&self) -> ConsumerDefinition {
        ConsumerDefinition {
            stream: self.stream_name.clone(),
            durable_name: self.consumer_name.clone(),
            subject_prefix: self.subject_prefix.clone(),
            max_ack_pending: Some(1),
            max_deliver: None,
        }
    }

    /// Credentials for direct store access to `scope`, if S3 is configured
    pub fn remote_secret(&self, scope: &str) -> Option<RemoteSecret> {
        self.object_store
            .s3
            .as_ref()
            .filter(|_| self.object_store.store_type == ObjectStoreType::S3)
            .map(|s3| s3.remote_secret(&self.secret_name, scope))
    }
}

/// Type of object store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStoreType {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem
    LocalFs,
    /// Amazon S3 or compatible
    S3,
}

/// Where snapshots go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub store_type: ObjectStoreType,
    /// Root directory (for LocalFs store)
    pub local_path: Option<PathBuf>,
    /// S3 configuration (for S3 store)
    pub s3: Option<S3Config>,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        ObjectStoreConfig {
            store_type: ObjectStoreType::InMemory,
            local_path: None,
            s3: None,
        }
    }
}

/// S3 configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint, host[:port] or full URL (for MinIO and friends)
    pub endpoint: Option<String>,
    /// Use TLS when the endpoint has no scheme
    pub use_ssl: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        S3Config {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            use_ssl: true,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

impl S3Config {
    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("S3_REGION")
            .or_else(|| env_string("AWS_REGION"))
            .or_else(|| env_string("AWS_DEFAULT_REGION"))
        {
            self.region = v;
        }
        if let Some(v) = env_string("S3_ENDPOINT") {
            self.endpoint = Some(v);
        }
        if let Some(v) = env_bool("S3_USE_SSL") {
            self.use_ssl = v;
        }
        if let Some(v) = env_string("S3_ACCESS_KEY_ID") {
            self.access_key_id = Some(v);
        }
        if let Some(v) = env_string("S3_SECRET_ACCESS_KEY") {
            self.secret_access_key = Some(v);
        }
    }

    /// Endpoint with scheme, for HTTP clients
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|e| {
            if e.contains("://") {
                e.clone()
            } else if self.use_ssl {
                format!("https://{}", e)
            } else {
                format!("http://{}", e)
            }
        })
    }

    fn endpoint_host(&self) -> Option<(String, bool)> {
        self.endpoint.as_ref().map(|e| {
            if let Some(host) = e.strip_prefix("https://") {
                (host.trim_end_matches('/').to_string(), true)
            } else if let Some(host) = e.strip_prefix("http://") {
                (host.trim_end_matches('/').to_string(), false)
            } else {
                (e.clone(), self.use_ssl)
            }
        })
    }

    /// Store secret restricted to `scope`
    pub fn remote_secret(&self, name: &str, scope: &str) -> RemoteSecret {
        let (endpoint, use_ssl, path_style) = match self.endpoint_host() {
            Some((host, ssl)) => (Some(host), ssl, true),
            None => (None, true, false),
        };
        RemoteSecret {
            name: name.to_string(),
            key_id: self.access_key_id.clone(),
            secret: self.secret_access_key.clone(),
            region: self.region.clone(),
            endpoint,
            use_ssl,
            url_style_path: path_style,
            scope: scope.to_string(),
        }
    }
}
