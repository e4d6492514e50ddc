//! In-process Moray, for tests and single-host development.
//!
//! Behaves like a Moray shard as far as the registry can observe: buckets
//! must be provisioned before use, filters may only touch indexed fields,
//! writes honor etag preconditions, and the connection can be switched off
//! to simulate an outage.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::moray::{FindOptions, MorayClient};
use crate::store::{content_etag, Filters, StoredObject};
use crate::tables::BucketSchema;

struct MemoryBucket {
    schema: BucketSchema,
    /// key → (value, etag)
    objects: BTreeMap<String, (Value, String)>,
}

#[derive(Default)]
pub struct MemoryMoray {
    buckets: RwLock<HashMap<String, MemoryBucket>>,
    unavailable: AtomicBool,
    find_calls: AtomicUsize,
}

impl MemoryMoray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated connection outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of `find_objects` calls served so far.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    /// Number of objects in a bucket (0 if the bucket does not exist).
    pub async fn object_count(&self, bucket: &str) -> usize {
        self.buckets
            .read()
            .await
            .get(bucket)
            .map_or(0, |b| b.objects.len())
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "moray: no active connections".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MorayClient for MemoryMoray {
    async fn get_bucket(&self, bucket: &str) -> StoreResult<BucketSchema> {
        self.check_available()?;
        self.buckets
            .read()
            .await
            .get(bucket)
            .map(|b| b.schema.clone())
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))
    }

    async fn put_bucket(&self, bucket: &str, schema: &BucketSchema) -> StoreResult<()> {
        self.check_available()?;
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .and_modify(|b| b.schema = schema.clone())
            .or_insert_with(|| MemoryBucket {
                schema: schema.clone(),
                objects: BTreeMap::new(),
            });
        debug!(%bucket, version = schema.version, "bucket provisioned");
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        value: &Value,
        etag: Option<&str>,
    ) -> StoreResult<String> {
        self.check_available()?;
        let mut buckets = self.buckets.write().await;
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        if let Some(expected) = etag {
            let found = b.objects.get(key).map(|(_, e)| e.as_str());
            if found != Some(expected) {
                return Err(StoreError::EtagConflict {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    expected: expected.to_string(),
                    found: found.unwrap_or("none").to_string(),
                });
            }
        }

        let new_etag = content_etag(value);
        b.objects
            .insert(key.to_string(), (value.clone(), new_etag.clone()));
        Ok(new_etag)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> StoreResult<StoredObject> {
        self.check_available()?;
        let buckets = self.buckets.read().await;
        let b = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        b.objects
            .get(key)
            .map(|(value, etag)| StoredObject {
                value: value.clone(),
                etag: Some(etag.clone()),
            })
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut buckets = self.buckets.write().await;
        let b = buckets
            .get_mut(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;
        b.objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(bucket, key))
    }

    async fn find_objects(
        &self,
        bucket: &str,
        filter: &Filters,
        opts: &FindOptions,
    ) -> StoreResult<Vec<StoredObject>> {
        self.check_available()?;
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let buckets = self.buckets.read().await;
        let b = buckets
            .get(bucket)
            .ok_or_else(|| StoreError::BucketNotFound(bucket.to_string()))?;

        if let Some(field) = filter.fields().find(|f| !b.schema.is_indexed(f)) {
            return Err(StoreError::InvalidQuery(format!(
                "{bucket} does not have an index on {field}: {}",
                filter.to_ldap()
            )));
        }

        Ok(b.objects
            .values()
            .filter(|(value, _)| filter.matches(value))
            .skip(opts.offset)
            .take(opts.limit)
            .map(|(value, etag)| StoredObject {
                value: value.clone(),
                etag: Some(etag.clone()),
            })
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }

    async fn close(&self) {}
}
