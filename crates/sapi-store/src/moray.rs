//! Moray client interface.
//!
//! Moray is the distributed key-value database the registry moves onto when
//! it leaves proto mode. The wire client lives outside this crate; stores
//! only depend on this trait.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreResult;
use crate::store::{Filters, StoredObject};
use crate::tables::BucketSchema;

/// Paging for `find_objects`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    pub limit: usize,
    pub offset: usize,
}

/// One Moray connection.
#[async_trait]
pub trait MorayClient: Send + Sync {
    /// Fails with `BucketNotFound` when the bucket does not exist.
    async fn get_bucket(&self, bucket: &str) -> StoreResult<BucketSchema>;

    /// Create the bucket, or update its schema if it exists.
    async fn put_bucket(&self, bucket: &str, schema: &BucketSchema) -> StoreResult<()>;

    /// Store `value` under `key`, returning the new etag. With `etag` set,
    /// the write fails with `EtagConflict` unless the stored object matches.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        etag: Option<&str>,
    ) -> StoreResult<String>;

    /// Fails with `NotFound` when the object does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<StoredObject>;

    /// Fails with `NotFound` when the object does not exist.
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    /// Objects matching `filter`, ordered by key. Filtering on a field the
    /// bucket does not index is an `InvalidQuery`.
    async fn find_objects(
        &self,
        bucket: &str,
        filter: &Filters,
        opts: &FindOptions,
    ) -> StoreResult<Vec<StoredObject>>;

    async fn ping(&self) -> StoreResult<()>;

    async fn close(&self);
}
