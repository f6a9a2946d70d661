//! Restore Bootstrapper
//!
//! Runs before either local store is opened. A store whose file is
//! missing is rebuilt from the newest snapshot in object storage.
//!
//! ## Flow per store (TigerStyle: explicit steps)
//!
//! 1. Local file present: leave it alone
//! 2. List snapshots under the prefix, pick the newest complete one
//! 3. None found: start empty
//! 4. Build the file at a temp path in the target directory
//! 5. Rename it into place
//!
//! Any failure after step 2 is fatal. Starting empty when a snapshot
//! exists would silently lose data.

use crate::snapshot::config::SnapshotConfig;
use crate::snapshot::key::{latest_complete_analytics_snapshot, latest_state_snapshot, SnapshotKey};
use crate::snapshot::object_store::ObjectStore;
use crate::store::{AnalyticalStore, StoreError};
use std::io::{Error as IoError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Error type for restore operations
#[derive(Debug)]
pub enum RestoreError {
    /// Snapshot bucket does not exist
    BucketMissing,
    /// Object storage or local file I/O failed
    Io(IoError),
    /// Import into the analytical store failed
    Store(StoreError),
    /// Blocking task panicked or was cancelled
    Task(String),
}

impl std::fmt::Display for RestoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestoreError::BucketMissing => write!(f, "Snapshot bucket does not exist"),
            RestoreError::Io(e) => write!(f, "I/O error: {}", e),
            RestoreError::Store(e) => write!(f, "Store error: {}", e),
            RestoreError::Task(msg) => write!(f, "Restore task failed: {}", msg),
        }
    }
}

impl std::error::Error for RestoreError {}

impl From<IoError> for RestoreError {
    fn from(e: IoError) -> Self {
        RestoreError::Io(e)
    }
}

impl From<StoreError> for RestoreError {
    fn from(e: StoreError) -> Self {
        RestoreError::Store(e)
    }
}

impl From<tokio::task::JoinError> for RestoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        RestoreError::Task(e.to_string())
    }
}

/// What happened to one store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStatus {
    Disabled,
    SkippedLocalPresent,
    NoSnapshot,
    Restored { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub state: RestoreStatus,
    pub analytics: RestoreStatus,
}

/// Rebuilds missing local stores from snapshots
pub struct RestoreBootstrapper {
    object_store: Arc<dyn ObjectStore>,
    config: SnapshotConfig,
}

/// Directory holding `path`, usable for temp files
fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn path_str(path: &Path) -> Result<&str, RestoreError> {
    path.to_str()
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "non-UTF-8 path").into())
}

impl RestoreBootstrapper {
    pub fn new(object_store: Arc<dyn ObjectStore>, config: SnapshotConfig) -> Self {
        RestoreBootstrapper {
            object_store,
            config,
        }
    }

    /// Restore each store whose local file is missing
    pub async fn restore<A: AnalyticalStore>(
        &self,
        analytics_path: &Path,
        state_path: &Path,
    ) -> Result<RestoreReport, RestoreError> {
        if !self.config.restore_enabled {
            return Ok(RestoreReport {
                state: RestoreStatus::Disabled,
                analytics: RestoreStatus::Disabled,
            });
        }
        let state = self.restore_state(state_path).await?;
        let analytics = self.restore_analytics::<A>(analytics_path).await?;
        Ok(RestoreReport { state, analytics })
    }

    async fn ensure_bucket(&self) -> Result<(), RestoreError> {
        if self.object_store.bucket_exists().await? {
            Ok(())
        } else {
            Err(RestoreError::BucketMissing)
        }
    }

    /// Restore the state store file from the newest snapshot
    pub async fn restore_state(&self, path: &Path) -> Result<RestoreStatus, RestoreError> {
        if tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "state store present, skipping restore");
            return Ok(RestoreStatus::SkippedLocalPresent);
        }
        self.ensure_bucket().await?;

        let objects = self.object_store.list(&self.config.prefix).await?;
        let Some(key) = latest_state_snapshot(&self.config.prefix, &objects) else {
            info!(prefix = %self.config.prefix, "no state snapshot found, starting empty");
            return Ok(RestoreStatus::NoSnapshot);
        };

        info!(key = %key.key, "restoring state store");
        let parent = parent_dir(path);
        tokio::fs::create_dir_all(&parent).await?;
        let tmp = tempfile::NamedTempFile::new_in(&parent)?;
        self.object_store.get_to_file(&key.key, tmp.path()).await?;

        let dest = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<(), IoError> {
            tmp.as_file().sync_all()?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;

        info!(key = %key.key, path = %path.display(), "state store restored");
        Ok(RestoreStatus::Restored { key: key.key })
    }

    /// Restore the analytical store from the newest complete export
    pub async fn restore_analytics<A: AnalyticalStore>(
        &self,
        path: &Path,
    ) -> Result<RestoreStatus, RestoreError> {
        if tokio::fs::try_exists(path).await? {
            info!(path = %path.display(), "analytical store present, skipping restore");
            return Ok(RestoreStatus::SkippedLocalPresent);
        }

        let objects = self.object_store.list(&self.config.prefix).await?;
        let Some(key) = latest_complete_analytics_snapshot(&self.config.prefix, &objects) else {
            info!(
                prefix = %self.config.prefix,
                "no complete analytics snapshot found, starting empty"
            );
            return Ok(RestoreStatus::NoSnapshot);
        };

        info!(key = %key.key, "restoring analytical store");
        let parent = parent_dir(path);
        tokio::fs::create_dir_all(&parent).await?;
        let work = tempfile::tempdir_in(&parent)?;
        let file_name = path
            .file_name()
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "store path has no file name"))?;
        let staged_db = work.path().join(file_name);

        let direct = self
            .object_store
            .direct_url(&key.key)
            .and_then(|url| self.config.remote_secret(&url).map(|secret| (url, secret)));
        let (location, secret) = match direct {
            Some((url, secret)) => (url.trim_end_matches('/').to_string(), Some(secret)),
            None => {
                let export_dir = work.path().join("export");
                self.download_export(&key, &export_dir).await?;
                (path_str(&export_dir)?.to_string(), None)
            }
        };

        let dest = staged_db.clone();
        tokio::task::spawn_blocking(move || A::import_database(&dest, &location, secret.as_ref()))
            .await??;

        tokio::fs::rename(&staged_db, path).await?;
        info!(key = %key.key, path = %path.display(), "analytical store restored");
        Ok(RestoreStatus::Restored { key: key.key })
    }

    async fn download_export(&self, key: &SnapshotKey, dir: &Path) -> Result<(), RestoreError> {
        for object in self.object_store.list(&key.key).await? {
            let Some(relative) = object.key.strip_prefix(&key.key) else {
                continue;
            };
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.object_store.get_to_file(&object.key, &target).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{system_columns, CellValue};
    use crate::snapshot::object_store::{InMemoryObjectStore, ObjectFuture, ObjectMeta};
    use crate::store::MemoryAnalyticalStore;
    use chrono::{TimeZone, Utc};

    fn bootstrapper(bucket: &InMemoryObjectStore) -> RestoreBootstrapper {
        RestoreBootstrapper::new(Arc::new(bucket.clone()), SnapshotConfig::test())
    }

    /// Export a populated store into `bucket` under `snapshot`, by hand
    async fn stage_export(bucket: &InMemoryObjectStore, snapshot: &str) -> MemoryAnalyticalStore {
        let source = MemoryAnalyticalStore::new();
        source.create_table("events", &system_columns()).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        source
            .append_rows(
                "events",
                &[vec![CellValue::String("a".to_string()), CellValue::Timestamp(at)]],
            )
            .unwrap();
        let export = tempfile::tempdir().unwrap();
        source.export_database(export.path().to_str().unwrap()).unwrap();

        for entry in std::fs::read_dir(export.path()).unwrap() {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_str().unwrap().to_string();
            bucket
                .put(&format!("{}{}", snapshot, name), &std::fs::read(&path).unwrap())
                .await
                .unwrap();
        }
        source
    }

    /// Bucket whose whole-object reads fail; downloads must go to files
    struct FileDownloadsOnly(InMemoryObjectStore);

    impl ObjectStore for FileDownloadsOnly {
        fn bucket_exists(&self) -> ObjectFuture<'_, bool> {
            self.0.bucket_exists()
        }

        fn put<'a>(&'a self, key: &'a str, data: &'a [u8]) -> ObjectFuture<'a, ()> {
            self.0.put(key, data)
        }

        fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Vec<u8>> {
            Box::pin(async move {
                Err(IoError::new(ErrorKind::Unsupported, format!("buffered read of {}", key)))
            })
        }

        fn get_to_file<'a>(&'a self, key: &'a str, dest: &'a Path) -> ObjectFuture<'a, ()> {
            self.0.get_to_file(key, dest)
        }

        fn exists<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, bool> {
            self.0.exists(key)
        }

        fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<ObjectMeta>> {
            self.0.list(prefix)
        }
    }

    #[tokio::test]
    async fn test_disabled_does_nothing() {
        let bucket = InMemoryObjectStore::new();
        let mut config = SnapshotConfig::test();
        config.restore_enabled = false;
        let dir = tempfile::tempdir().unwrap();
        let report = RestoreBootstrapper::new(Arc::new(bucket), config)
            .restore::<MemoryAnalyticalStore>(&dir.path().join("a"), &dir.path().join("s"))
            .await
            .unwrap();
        assert_eq!(report.state, RestoreStatus::Disabled);
        assert_eq!(report.analytics, RestoreStatus::Disabled);
    }

    #[tokio::test]
    async fn test_local_files_are_never_overwritten() {
        let bucket = InMemoryObjectStore::new();
        bucket
            .put("test/state-2024-01-01_01-00-00.db", b"remote")
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.db");
        std::fs::write(&state, b"local").unwrap();

        let status = bootstrapper(&bucket).restore_state(&state).await.unwrap();
        assert_eq!(status, RestoreStatus::SkippedLocalPresent);
        assert_eq!(std::fs::read(&state).unwrap(), b"local");
    }

    #[tokio::test]
    async fn test_state_restores_newest() {
        let bucket = InMemoryObjectStore::new();
        for (day, body) in [(1, "one"), (3, "three"), (2, "two")] {
            let key = format!("test/state-2024-01-0{}_01-00-00.db", day);
            bucket.put(&key, body.as_bytes()).await.unwrap();
        }
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("nested").join("state.db");

        let status = bootstrapper(&bucket).restore_state(&state).await.unwrap();
        assert_eq!(
            status,
            RestoreStatus::Restored {
                key: "test/state-2024-01-03_01-00-00.db".to_string()
            }
        );
        assert_eq!(std::fs::read(&state).unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_state_missing_bucket_is_fatal() {
        let bucket = InMemoryObjectStore::new();
        bucket.set_bucket_missing(true);
        let dir = tempfile::tempdir().unwrap();
        let err = bootstrapper(&bucket)
            .restore_state(&dir.path().join("state.db"))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::BucketMissing));
    }

    #[tokio::test]
    async fn test_incomplete_analytics_export_means_no_snapshot() {
        let bucket = InMemoryObjectStore::new();
        bucket
            .put("test/analytics-2024-01-02_01-00-00/table_0000.json", b"{}")
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.db");

        let status = bootstrapper(&bucket)
            .restore_analytics::<MemoryAnalyticalStore>(&path)
            .await
            .unwrap();
        assert_eq!(status, RestoreStatus::NoSnapshot);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_analytics_restore_from_staged_export() {
        let bucket = InMemoryObjectStore::new();
        let source = stage_export(&bucket, "test/analytics-2024-01-05_01-00-00/").await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analytics.db");
        let status = bootstrapper(&bucket)
            .restore_analytics::<MemoryAnalyticalStore>(&path)
            .await
            .unwrap();
        assert_eq!(
            status,
            RestoreStatus::Restored {
                key: "test/analytics-2024-01-05_01-00-00/".to_string()
            }
        );

        let restored = MemoryAnalyticalStore::open(&path).unwrap();
        assert_eq!(restored.rows("events"), source.rows("events"));
        // Only the restored file is left next to it
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_downloads_straight_to_files() {
        let inner = InMemoryObjectStore::new();
        inner
            .put("test/state-2024-01-05_01-00-00.db", b"state bytes")
            .await
            .unwrap();
        let source = stage_export(&inner, "test/analytics-2024-01-05_01-00-00/").await;
        let restore =
            RestoreBootstrapper::new(Arc::new(FileDownloadsOnly(inner)), SnapshotConfig::test());

        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.db");
        let analytics = dir.path().join("analytics.db");
        let report = restore
            .restore::<MemoryAnalyticalStore>(&analytics, &state)
            .await
            .unwrap();

        assert!(matches!(report.state, RestoreStatus::Restored { .. }));
        assert!(matches!(report.analytics, RestoreStatus::Restored { .. }));
        assert_eq!(std::fs::read(&state).unwrap(), b"state bytes");
        let restored = MemoryAnalyticalStore::open(&analytics).unwrap();
        assert_eq!(restored.rows("events"), source.rows("events"));
    }
}
