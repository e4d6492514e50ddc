//! TransitionStore: dual-write proxy used while migrating stores.
//!
//! Reads and listings come only from the old store, so the visible state
//! stays consistent while the new store is being populated. Writes land in
//! both, so nothing written during the bulk copy is lost once the new store
//! takes over.

use std::sync::Arc;

use async_trait::async_trait;
use sapi_core::Bucket;
use serde_json::Value;
use tracing::debug;

use crate::error::StoreResult;
use crate::store::{Filters, ObjectStore, PutOptions, ReadOptions, StoredObject};

pub struct TransitionStore {
    old: Arc<dyn ObjectStore>,
    new: Arc<dyn ObjectStore>,
}

impl TransitionStore {
    pub fn new(old: Arc<dyn ObjectStore>, new: Arc<dyn ObjectStore>) -> Self {
        Self { old, new }
    }
}

#[async_trait]
impl ObjectStore for TransitionStore {
    fn kind(&self) -> &'static str {
        "transition"
    }

    async fn init(&self) -> StoreResult<()> {
        self.old.init().await?;
        self.new.init().await
    }

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()> {
        self.old.put_object(bucket, uuid, value, opts).await?;
        // Etags are per store; the old store already enforced the precondition.
        self.new
            .put_object(bucket, uuid, value, &PutOptions::default())
            .await
    }

    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>> {
        self.old.get_object(bucket, uuid, opts).await
    }

    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()> {
        self.old.del_object(bucket, uuid).await?;
        match self.new.del_object(bucket, uuid).await {
            // Not copied over yet.
            Err(e) if e.is_not_found() => {
                debug!(%bucket, %uuid, "delete ahead of copy in new store");
                Ok(())
            }
            other => other,
        }
    }

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>> {
        self.old.list_object_values(bucket, filters, opts).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.old.ping().await?;
        self.new.ping().await
    }

    /// The wrapped stores outlive the transition; they are not closed here.
    async fn close(&self) {}
}
