//! Service Configuration
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults (`Default` impls)
//! 2. TOML file (`--config <path>` or `INGEST_CONFIG_FILE`)
//! 3. Environment variables
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | DATA_DIR | ./data | Directory holding both store files |
//! | ANALYTICS_DB_PATH | $DATA_DIR/analytics.duckdb | Analytical store file |
//! | STATE_DB_PATH | $DATA_DIR/state.sqlite | State store file |
//! | NATS_URL | nats://127.0.0.1:4222 | Broker URL |
//! | INGEST_BATCH_SIZE | 3000 | Messages per flush |
//! | INGEST_FLUSH_TIMEOUT_MS | 2000 | Flush deadline |
//! | SNAPSHOT_ENABLED | false | Run daily snapshots |
//! | SNAPSHOT_SCHEDULE | 01:00 | Local time of the daily snapshot |
//! | SNAPSHOT_RESTORE_ENABLED | false | Restore missing stores at startup |
//! | S3_BUCKET | - | Snapshot bucket (selects the S3 destination) |
//! | LOG_FORMAT | text | `text` or `json` |
//! | RUST_LOG | info | Log filter |

use crate::ingest::{BrokerConfig, IngestConfig};
use crate::observability::LogConfig;
use crate::snapshot::SnapshotConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming a TOML config file
pub const CONFIG_FILE_ENV: &str = "INGEST_CONFIG_FILE";

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    /// File could not be read or written
    Io(PathBuf, std::io::Error),
    /// TOML did not parse
    Toml(PathBuf, toml::de::Error),
    /// Value out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "{}: {}", path.display(), e),
            ConfigError::Toml(path, e) => write!(f, "{}: {}", path.display(), e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Local store file locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Analytical store file; defaults to `<data_dir>/analytics.duckdb`
    pub analytics_path: Option<PathBuf>,
    /// State store file; defaults to `<data_dir>/state.sqlite`
    pub state_path: Option<PathBuf>,
}

/// Complete service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub broker: BrokerConfig,
    pub ingest: IngestConfig,
    pub snapshot: SnapshotConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            data_dir: PathBuf::from("./data"),
            broker: BrokerConfig::default(),
            ingest: IngestConfig::default(),
            snapshot: SnapshotConfig::default(),
            store: StoreConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Configuration for tests
    pub fn test(data_dir: &Path) -> Self {
        AppConfig {
            data_dir: data_dir.to_path_buf(),
            ingest: IngestConfig::test(),
            snapshot: SnapshotConfig::test(),
            ..Default::default()
        }
    }

    /// Defaults, then `path` (or `INGEST_CONFIG_FILE`), then environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| env_string(CONFIG_FILE_ENV).map(PathBuf::from));
        let mut config = match file {
            Some(file) => Self::from_file(&file)?,
            None => AppConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml(&text).map_err(|e| ConfigError::Toml(path.to_path_buf(), e))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn apply_env(&mut self) {
        if let Some(v) = env_string("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("ANALYTICS_DB_PATH") {
            self.store.analytics_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("STATE_DB_PATH") {
            self.store.state_path = Some(PathBuf::from(v));
        }
        self.broker.apply_env();
        self.ingest.apply_env();
        self.snapshot.apply_env();
        self.log.apply_env();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir must not be empty".into()));
        }
        self.ingest.validate()?;
        self.snapshot.validate()?;
        Ok(())
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.store
            .analytics_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("analytics.duckdb"))
    }

    pub fn state_path(&self) -> PathBuf {
        self.store
            .state_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("state.sqlite"))
    }
}

/// Non-empty environment variable
pub fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Environment variable parsed as `T`; unparsable values are ignored
pub fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.trim().parse().ok())
}

/// Environment flag: `1`/`true`/`yes`/`on` or `0`/`false`/`no`/`off`
pub fn env_bool(name: &str) -> Option<bool> {
    env_string(name).and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Serde helper for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
