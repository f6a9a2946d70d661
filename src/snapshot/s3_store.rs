//! S3 Object Store Implementation
//!
//! S3-compatible snapshot destination built on the `object_store` crate.
//! Works against AWS S3 and MinIO-style endpoints.

use crate::snapshot::config::S3Config;
use crate::snapshot::object_store::{ObjectFuture, ObjectMeta, ObjectStore};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore as ObjectStoreTrait, WriteMultipart};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::warn;

/// Files up to this size are uploaded in a single request
const SINGLE_PUT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Multipart part size, also the file read buffer
const PART_SIZE_BYTES: usize = 8 * 1024 * 1024;

/// Parts in flight per upload
const MAX_PARTS_IN_FLIGHT: usize = 4;

/// S3 bucket as an [`ObjectStore`]
pub struct S3ObjectStore {
    store: AmazonS3,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client for `config.bucket`
    ///
    /// Credentials come from the config, falling back to
    /// AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY.
    pub fn new(config: &S3Config) -> IoResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        // Custom endpoint for S3-compatible services (MinIO)
        if let Some(endpoint) = config.endpoint_url() {
            builder = builder
                .with_allow_http(endpoint.starts_with("http://"))
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }

        let key_id = config
            .access_key_id
            .clone()
            .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok());
        let secret = config
            .secret_access_key
            .clone()
            .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok());
        if let (Some(key_id), Some(secret)) = (key_id, secret) {
            builder = builder
                .with_access_key_id(key_id)
                .with_secret_access_key(secret);
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;

        Ok(S3ObjectStore {
            store,
            bucket: config.bucket.clone(),
        })
    }

    /// Convert object_store errors to IoError
    fn map_error(err: object_store::Error) -> IoError {
        match &err {
            object_store::Error::NotFound { .. } => {
                IoError::new(ErrorKind::NotFound, err.to_string())
            }
            object_store::Error::AlreadyExists { .. } => {
                IoError::new(ErrorKind::AlreadyExists, err.to_string())
            }
            object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. } => {
                IoError::new(ErrorKind::PermissionDenied, err.to_string())
            }
            _ => IoError::new(ErrorKind::Other, err.to_string()),
        }
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl ObjectStore for S3ObjectStore {
    fn bucket_exists(&self) -> ObjectFuture<'_, bool> {
        Box::pin(async move {
            match self.store.list_with_delimiter(None).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: &'a [u8],
    ) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            self.store
                .put(
                    &ObjectPath::from(key),
                    bytes::Bytes::copy_from_slice(data).into(),
                )
                .await
                .map_err(Self::map_error)?;
            Ok(())
        })
    }

    /// Large files go up as a multipart upload, one part in memory per
    /// slot in flight. A failed upload is aborted.
    fn put_file<'a>(&'a self, key: &'a str, path: &'a Path) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            let mut file = tokio::fs::File::open(path).await?;
            let size = file.metadata().await?.len();
            if size <= SINGLE_PUT_MAX_BYTES {
                let mut data = Vec::with_capacity(size as usize);
                file.read_to_end(&mut data).await?;
                return self.put(key, &data).await;
            }

            let upload = self
                .store
                .put_multipart(&ObjectPath::from(key))
                .await
                .map_err(Self::map_error)?;
            let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE_BYTES);
            let mut buf = vec![0u8; PART_SIZE_BYTES];
            let copied: IoResult<()> = async {
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        return Ok(());
                    }
                    writer
                        .wait_for_capacity(MAX_PARTS_IN_FLIGHT)
                        .await
                        .map_err(Self::map_error)?;
                    writer.write(&buf[..n]);
                }
            }
            .await;

            match copied {
                Ok(()) => {
                    writer.finish().await.map_err(Self::map_error)?;
                    Ok(())
                }
                Err(e) => {
                    if let Err(abort) = writer.abort().await {
                        warn!(key = %key, error = %abort, "Failed to abort multipart upload");
                    }
                    Err(e)
                }
            }
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let result = self
                .store
                .get(&ObjectPath::from(key))
                .await
                .map_err(Self::map_error)?;
            let data = result.bytes().await.map_err(Self::map_error)?;
            Ok(data.to_vec())
        })
    }

    /// Streams the object body to `dest` chunk by chunk
    fn get_to_file<'a>(&'a self, key: &'a str, dest: &'a Path) -> ObjectFuture<'a, ()> {
        Box::pin(async move {
            use futures::TryStreamExt;

            let mut body = self
                .store
                .get(&ObjectPath::from(key))
                .await
                .map_err(Self::map_error)?
                .into_stream();
            let mut file = tokio::fs::File::create(dest).await?;
            while let Some(chunk) = body.try_next().await.map_err(Self::map_error)? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        })
    }

    fn exists<'a>(
        &'a self,
        key: &'a str,
    ) -> ObjectFuture<'a, bool> {
        Box::pin(async move {
            match self.store.head(&ObjectPath::from(key)).await {
                Ok(_) => Ok(true),
                Err(object_store::Error::NotFound { .. }) => Ok(false),
                Err(e) => Err(Self::map_error(e)),
            }
        })
    }

    fn list<'a>(
        &'a self,
        prefix: &'a str,
    ) -> ObjectFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            use futures::TryStreamExt;

            // object_store lists by path segment, so list the parent and filter
            let parent = prefix.rfind('/').map(|idx| ObjectPath::from(&prefix[..idx]));
            let all: Vec<_> = self
                .store
                .list(parent.as_ref())
                .try_collect()
                .await
                .map_err(Self::map_error)?;

            let mut objects: Vec<ObjectMeta> = all
                .into_iter()
                .map(|meta| ObjectMeta {
                    key: meta.location.to_string(),
                    size_bytes: meta.size as u64,
                    modified_at_ms: meta.last_modified.timestamp_millis().try_into().unwrap_or(0),
                })
                .filter(|o| o.key.starts_with(prefix))
                .collect();
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(objects)
        })
    }

    fn direct_url(&self, key: &str) -> Option<String> {
        Some(format!("s3://{}/{}", self.bucket, key))
    }
}
