//! LocalStore: filesystem-backed object store.
//!
//! One directory per bucket, one pretty-printed JSON file per object at
//! `<root>/<bucket>/<uuid>`. Writes replace the whole file with no
//! partial-write protection: this store only ever backs a single-node
//! bootstrap deployment or serves as a cache in front of Moray.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use sapi_core::{Bucket, SapiConfig};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{content_etag, Filters, ObjectStore, PutOptions, ReadOptions, StoredObject};

/// Default number of files loaded concurrently while listing.
pub const DEFAULT_LIST_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    pub root: PathBuf,
    pub list_concurrency: usize,
}

impl LocalStoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            list_concurrency: DEFAULT_LIST_CONCURRENCY,
        }
    }
}

impl From<&SapiConfig> for LocalStoreConfig {
    fn from(config: &SapiConfig) -> Self {
        Self {
            root: config.local_store_path(),
            list_concurrency: config.local_store.list_concurrency,
        }
    }
}

/// Filesystem object store.
pub struct LocalStore {
    root: PathBuf,
    list_concurrency: usize,
    /// Serializes etag check + write.
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(config: LocalStoreConfig) -> Self {
        Self {
            root: config.root,
            list_concurrency: config.list_concurrency.max(1),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: Bucket) -> PathBuf {
        self.root.join(bucket.name())
    }

    fn object_path(&self, bucket: Bucket, uuid: &str) -> StoreResult<PathBuf> {
        let mut components = Path::new(uuid).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.bucket_dir(bucket).join(uuid)),
            _ => Err(StoreError::InvalidQuery(format!("invalid object key: {uuid:?}"))),
        }
    }

    async fn read_path(&self, path: &Path) -> StoreResult<Option<StoredObject>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
        let etag = content_etag(&value);
        Ok(Some(StoredObject {
            value,
            etag: Some(etag),
        }))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn init(&self) -> StoreResult<()> {
        for bucket in Bucket::ALL {
            fs::create_dir_all(self.bucket_dir(bucket)).await?;
        }
        debug!(root = %self.root.display(), "local store initialized");
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()> {
        let path = self.object_path(bucket, uuid)?;
        let content =
            serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialize(e.to_string()))?;

        let _guard = self.write_lock.lock().await;
        if let Some(expected) = &opts.etag {
            let current = self.read_path(&path).await?;
            let found = current.and_then(|obj| obj.etag);
            if found.as_deref() != Some(expected.as_str()) {
                return Err(StoreError::EtagConflict {
                    bucket: bucket.name().to_string(),
                    key: uuid.to_string(),
                    expected: expected.clone(),
                    found: found.unwrap_or_else(|| "none".to_string()),
                });
            }
        }
        fs::create_dir_all(self.bucket_dir(bucket)).await?;
        fs::write(&path, content).await?;
        debug!(%bucket, %uuid, "local object stored");
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        _opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>> {
        let path = self.object_path(bucket, uuid)?;
        self.read_path(&path).await
    }

    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()> {
        let path = self.object_path(bucket, uuid)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%bucket, %uuid, "local object deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::not_found(bucket.name(), uuid))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        _opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>> {
        let dir = self.bucket_dir(bucket);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                paths.push(entry.path());
            }
        }

        let loaded: Vec<Option<StoredObject>> = futures::stream::iter(paths)
            .map(|path| async move { self.read_path(&path).await })
            .buffer_unordered(self.list_concurrency)
            .try_collect()
            .await?;

        // A file deleted between read_dir and read is simply skipped.
        Ok(loaded
            .into_iter()
            .flatten()
            .map(|obj| obj.value)
            .filter(|value| filters.matches(value))
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}
