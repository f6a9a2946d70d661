//! Object Store Abstraction
//!
//! Snapshot destination. Keys are flat strings; "directories" are just
//! shared key prefixes.
//!
//! Implementations:
//! - `InMemoryObjectStore`: for unit tests
//! - `LocalFsObjectStore`: for development and local backups
//! - `S3ObjectStore`: for production (feature-gated)

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Boxed future returned by object store operations
pub type ObjectFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

/// Metadata for a stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key
    pub key: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Last write (Unix ms)
    pub modified_at_ms: u64,
}

/// Object store abstraction trait
pub trait ObjectStore: Send + Sync + 'static {
    /// Whether the destination bucket/root exists and is reachable
    fn bucket_exists(&self) -> ObjectFuture<'_, bool>;

    /// Put an object (create or overwrite)
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> ObjectFuture<'a, ()>;

    /// Upload a local file
    ///
    /// The default reads the whole file; backends for large objects
    /// override it to stream.
    fn put_file<'a>(
        &'a self,
        key: &'a str,
        path: &'a Path,
    ) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let data = tokio::fs::read(path).await?;
            self.put(key, &data).await
        })
    }

    /// Get an object's contents
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, Vec<u8>>;

    /// Download an object into a local file, replacing it
    ///
    /// The default buffers the whole object; backends for large objects
    /// override it to stream.
    fn get_to_file<'a>(&'a self, key: &'a str, dest: &'a Path) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let data = self.get(key).await?;
            tokio::fs::write(dest, data).await
        })
    }

    /// Check if an object exists
    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, bool>;

    /// All objects whose key starts with `prefix`, sorted by key
    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> ObjectFuture<'a, Vec<ObjectMeta>>;

    /// URL the analytical store can read and write directly, if any
    ///
    /// `None` means exports are staged locally and uploaded file by file.
    fn direct_url(&self, _key: &str) -> Option<String> {
        None
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// InMemoryObjectStore - For tests
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    modified_at_ms: u64,
}

/// In-memory object store for unit tests
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    data: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    bucket_missing: Arc<AtomicBool>,
    /// Keys in the order they were written
    write_log: Arc<RwLock<Vec<String>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored objects (for testing)
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if empty (for testing)
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Pretend the bucket does not exist (for testing)
    pub fn set_bucket_missing(&self, missing: bool) {
        self.bucket_missing.store(missing, Ordering::SeqCst);
    }

    /// Every key written, oldest first (for testing)
    pub fn write_order(&self) -> Vec<String> {
        self.write_log.read().clone()
    }

    fn check_bucket(&self) -> IoResult<()> {
        if self.bucket_missing.load(Ordering::SeqCst) {
            return Err(IoError::new(ErrorKind::NotFound, "bucket does not exist"));
        }
        Ok(())
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn bucket_exists(&self) -> ObjectFuture<'_, bool> {
        Box::pin(async move { Ok(!self.bucket_missing.load(Ordering::SeqCst)) })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            self.check_bucket()?;
            let obj = StoredObject {
                data: data.to_vec(),
                modified_at_ms: now_ms(),
            };
            self.data.write().insert(key.to_string(), obj);
            self.write_log.write().push(key.to_string());
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, Vec<u8>> {
        Box::pin(async move {
            self.check_bucket()?;
            self.data
                .read()
                .get(key)
                .map(|obj| obj.data.clone())
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Key not found: {}", key)))
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, bool> {
        Box::pin(async move {
            self.check_bucket()?;
            Ok(self.data.read().contains_key(key))
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> ObjectFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            self.check_bucket()?;
            Ok(self
                .data
                .read()
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| ObjectMeta {
                    key: k.clone(),
                    size_bytes: v.data.len() as u64,
                    modified_at_ms: v.modified_at_ms,
                })
                .collect())
        })
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Local filesystem object store; keys map to paths under `base_path`
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore { base_path }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

fn walk_dir(dir: &Path, base: &Path, prefix: &str, objects: &mut Vec<ObjectMeta>) -> IoResult<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk_dir(&path, base, prefix, objects)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if key.starts_with(prefix) {
            let metadata = std::fs::metadata(&path)?;
            objects.push(ObjectMeta {
                key,
                size_bytes: metadata.len(),
                modified_at_ms: metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0),
            });
        }
    }
    Ok(())
}

impl ObjectStore for LocalFsObjectStore {
    fn bucket_exists(&self) -> ObjectFuture<'_, bool> {
        Box::pin(async move {
            let metadata = tokio::fs::metadata(&self.base_path).await;
            Ok(metadata.is_ok_and(|m| m.is_dir()))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, data).await
        })
    }

    fn put_file<'a>(
        &'a self,
        key: &'a str,
        source: &'a Path,
    ) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let path = self.full_path(key);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(source, &path).await.map(|_| ())
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, Vec<u8>> {
        Box::pin(async move { tokio::fs::read(self.full_path(key)).await })
    }

    fn get_to_file<'a>(&'a self, key: &'a str, dest: &'a Path) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            tokio::fs::copy(self.full_path(key), dest).await.map(|_| ())
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, bool> {
        Box::pin(async move { Ok(tokio::fs::metadata(self.full_path(key)).await.is_ok()) })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> ObjectFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let prefix = prefix.to_string();
            tokio::task::spawn_blocking(move || {
                let mut objects = Vec::new();
                if base.is_dir() {
                    walk_dir(&base, &base, &prefix, &mut objects)?;
                }
                objects.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(objects)
            })
            .await
            .map_err(|e| IoError::new(ErrorKind::Other, e.to_string()))?
        })
    }
}
