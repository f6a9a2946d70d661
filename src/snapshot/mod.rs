//! Snapshots and Restore
//!
//! Daily backups of both local stores to object storage, and rebuilding
//! them on a cold start.
//!
//! ## Architecture
//!
//! ```text
//! SnapshotScheduler ──trigger (dedup id)──► work queue ──► SnapshotExecutor
//!   (every node)                          (1 pending)          │
//!                                                              ▼
//!                              state-<ts>.db, analytics-<ts>/ ObjectStore
//!                                                              │
//! RestoreBootstrapper ◄────────── newest complete snapshot ────┘
//!   (startup, before stores open)
//! ```

pub mod config;
pub mod executor;
pub mod key;
pub mod object_store;
pub mod restore;
pub mod scheduler;
#[cfg(feature = "s3")]
pub mod s3_store;

pub use config::{ObjectStoreConfig, ObjectStoreType, S3Config, SnapshotConfig};
pub use executor::{SnapshotError, SnapshotExecutor, SnapshotOutcome};
pub use key::{
    latest_complete_analytics_snapshot, latest_state_snapshot, SnapshotKey, StoreKind,
    SNAPSHOT_TIMESTAMP_FORMAT,
};
pub use object_store::{
    InMemoryObjectStore, LocalFsObjectStore, ObjectFuture, ObjectMeta, ObjectStore,
};
pub use restore::{RestoreBootstrapper, RestoreError, RestoreReport, RestoreStatus};
pub use scheduler::{next_run, trigger_id, SnapshotScheduler};
#[cfg(feature = "s3")]
pub use s3_store::S3ObjectStore;

use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;

/// Build the snapshot destination described by `config`
pub fn build_object_store(config: &ObjectStoreConfig) -> IoResult<Arc<dyn ObjectStore>> {
    match config.store_type {
        ObjectStoreType::InMemory => Ok(Arc::new(InMemoryObjectStore::new())),
        ObjectStoreType::LocalFs => {
            let path = config.local_path.clone().ok_or_else(|| {
                IoError::new(ErrorKind::InvalidInput, "LocalFs store requires local_path")
            })?;
            Ok(Arc::new(LocalFsObjectStore::new(path)))
        }
        #[cfg(feature = "s3")]
        ObjectStoreType::S3 => {
            let s3 = config.s3.as_ref().ok_or_else(|| {
                IoError::new(ErrorKind::InvalidInput, "S3 store requires s3 config")
            })?;
            Ok(Arc::new(S3ObjectStore::new(s3)?))
        }
        #[cfg(not(feature = "s3"))]
        ObjectStoreType::S3 => Err(IoError::new(
            ErrorKind::Unsupported,
            "S3 snapshots require the `s3` feature",
        )),
    }
}
