//! The registry model: entry point for every read and write.
//!
//! Requests are delegated to whichever object store is currently active.
//! The active store (and the compute client) change exactly once, when the
//! registry upgrades from proto mode to full mode.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use futures::future::try_join_all;
use sapi_core::config::ModelSection;
use sapi_core::{Attributes, Bucket, ChangeAction, Entity, SapiConfig};
use sapi_store::{
    Filters, ObjectStore, PutOptions, ReadOptions, StaticZoneIdentity, StoreError, StoredObject,
    ZoneIdentity,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::attributes;
use crate::error::{ModelError, ModelResult};
use crate::external::{
    CommandRunner, ComputeApi, FullModeBackends, JsonSchemaValidator, ProtoMarker,
    SchemaValidator,
};

/// Tunables for the model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Conflict retries for the update protocol.
    pub update_retries: u32,
    /// Pause between conflicting update attempts.
    pub update_backoff: Duration,
    pub job_poll_interval: Duration,
    pub job_poll_attempts: u32,
    /// Refresh cadence of the cache built during the upgrade to full mode.
    pub refresh_interval: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::from(&ModelSection::default())
    }
}

impl From<&ModelSection> for ModelConfig {
    fn from(section: &ModelSection) -> Self {
        Self {
            update_retries: section.update_retries,
            update_backoff: Duration::from_millis(section.update_backoff_ms),
            job_poll_interval: Duration::from_millis(section.job_poll_interval_ms),
            job_poll_attempts: section.job_poll_attempts,
            refresh_interval: sapi_store::DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl From<&SapiConfig> for ModelConfig {
    fn from(config: &SapiConfig) -> Self {
        Self {
            refresh_interval: Duration::from_secs(config.moray.refresh_interval_secs),
            ..Self::from(&config.model)
        }
    }
}

/// Operating mode of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Single-node bootstrap against the local store, no compute.
    Proto,
    /// Upgrade in flight.
    Transitioning,
    /// Moray-backed with compute orchestration.
    Full,
}

impl Mode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Mode::Proto => 0,
            Mode::Transitioning => 1,
            Mode::Full => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Mode::Proto,
            1 => Mode::Transitioning,
            _ => Mode::Full,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Proto => "proto",
            Mode::Transitioning => "transitioning",
            Mode::Full => "full",
        }
    }
}

pub struct Model {
    pub(crate) config: ModelConfig,
    pub(crate) store: RwLock<Arc<dyn ObjectStore>>,
    /// Proto-mode store; becomes the cache half of the full-mode store.
    pub(crate) local: Arc<dyn ObjectStore>,
    pub(crate) mode: AtomicU8,
    pub(crate) compute: RwLock<Option<Arc<dyn ComputeApi>>>,
    pub(crate) commands: Option<Arc<dyn CommandRunner>>,
    pub(crate) validator: Arc<dyn SchemaValidator>,
    pub(crate) marker: Arc<dyn ProtoMarker>,
    pub(crate) backends: Option<Arc<dyn FullModeBackends>>,
    pub(crate) identity: Arc<dyn ZoneIdentity>,
}

impl Model {
    /// A model in proto mode, serving from `local`.
    pub fn new(config: ModelConfig, local: Arc<dyn ObjectStore>, marker: Arc<dyn ProtoMarker>) -> Self {
        Self {
            config,
            store: RwLock::new(local.clone()),
            local,
            mode: AtomicU8::new(Mode::Proto.as_u8()),
            compute: RwLock::new(None),
            commands: None,
            validator: Arc::new(JsonSchemaValidator),
            marker,
            backends: None,
            identity: Arc::new(StaticZoneIdentity(String::new())),
        }
    }

    /// A model in the mode the persisted marker records. Once the marker is
    /// gone the registry has been upgraded and never serves proto mode
    /// again; without compute it is limited to the cached objects.
    pub async fn open(
        config: ModelConfig,
        local: Arc<dyn ObjectStore>,
        marker: Arc<dyn ProtoMarker>,
    ) -> Self {
        let proto = marker.is_set().await;
        let model = Self::new(config, local, marker);
        if !proto {
            model.mode.store(Mode::Full.as_u8(), Ordering::SeqCst);
            warn!("proto mode marker absent, registry already upgraded");
        }
        model
    }

    /// Start directly in full mode on an already composed store.
    pub fn with_full_mode(mut self, store: Arc<dyn ObjectStore>, compute: Arc<dyn ComputeApi>) -> Self {
        self.store = RwLock::new(store);
        self.compute = RwLock::new(Some(compute));
        self.mode = AtomicU8::new(Mode::Full.as_u8());
        self
    }

    pub fn with_backends(mut self, backends: Arc<dyn FullModeBackends>) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn with_commands(mut self, commands: Arc<dyn CommandRunner>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn ZoneIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Initialize the active store.
    pub async fn init(&self) -> ModelResult<()> {
        let store = self.store().await;
        store.init().await?;
        info!(store = store.kind(), mode = self.mode().as_str(), "model initialized");
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        Mode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn is_proto_mode(&self) -> bool {
        self.mode() == Mode::Proto
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Snapshot of the active store. Callers keep using the snapshot for
    /// the rest of one operation even if the store is swapped meanwhile.
    pub async fn store(&self) -> Arc<dyn ObjectStore> {
        self.store.read().await.clone()
    }

    pub(crate) async fn compute(&self) -> Option<Arc<dyn ComputeApi>> {
        self.compute.read().await.clone()
    }

    pub(crate) async fn require_compute(&self) -> ModelResult<Arc<dyn ComputeApi>> {
        self.compute().await.ok_or(ModelError::ProtoMode)
    }

    pub async fn ping(&self) -> ModelResult<()> {
        Ok(self.store().await.ping().await?)
    }

    /// Force a cache refresh where the active store keeps one.
    pub async fn sync_store(&self) -> ModelResult<()> {
        Ok(self.store().await.sync().await?)
    }

    pub async fn close(&self) {
        self.store().await.close().await;
    }

    // -- Generic object access --------------------------------------------

    pub(crate) async fn find_entity<E: Entity>(
        &self,
        uuid: &str,
        opts: &ReadOptions,
    ) -> ModelResult<Option<E>> {
        let found = self.store().await.get_object(E::BUCKET, uuid, opts).await?;
        found.map(|obj| decode::<E>(obj.value)).transpose()
    }

    pub(crate) async fn get_entity<E: Entity>(&self, uuid: &str, opts: &ReadOptions) -> ModelResult<E> {
        self.find_entity(uuid, opts)
            .await?
            .ok_or_else(|| ModelError::not_found(E::BUCKET, uuid))
    }

    /// Look an object up by uuid wherever it lives: the local datacenter
    /// first, then the master datacenter when one is connected.
    pub(crate) async fn locate_entity<E: Entity>(&self, uuid: &str) -> ModelResult<E> {
        let store = self.store().await;
        let found = locate(store.as_ref(), E::BUCKET, uuid)
            .await?
            .ok_or_else(|| ModelError::not_found(E::BUCKET, uuid))?;
        decode(found.value)
    }

    pub(crate) async fn list_entities<E: Entity>(
        &self,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> ModelResult<Vec<E>> {
        let values = self
            .store()
            .await
            .list_object_values(E::BUCKET, filters, opts)
            .await?;
        values.into_iter().map(decode::<E>).collect()
    }

    /// Validate and write a new object, then return what was stored.
    pub(crate) async fn put_entity<E: Entity>(&self, entity: &E) -> ModelResult<E> {
        let value = encode(entity)?;
        if let Value::Object(obj) = &value {
            self.validate_object(obj).await?;
        }
        let store = self.store().await;
        store
            .put_object(E::BUCKET, entity.uuid(), &value, &PutOptions::default())
            .await?;
        let stored = store
            .get_object(E::BUCKET, entity.uuid(), &read_back(&value))
            .await?
            .ok_or_else(|| ModelError::not_found(E::BUCKET, entity.uuid()))?;
        decode(stored.value)
    }

    pub(crate) async fn delete_entity(&self, bucket: Bucket, uuid: &str) -> ModelResult<()> {
        self.store()
            .await
            .del_object(bucket, uuid)
            .await
            .map_err(|e| ModelError::from_store(bucket, uuid, e))?;
        info!(%bucket, %uuid, "object deleted");
        Ok(())
    }

    // -- Update protocol ---------------------------------------------------

    /// Apply `change` to a stored object under optimistic concurrency.
    ///
    /// Conflicting writes are retried up to `max_retries` times with a fixed
    /// backoff; every other failure is returned immediately. The value
    /// returned is re-read from the store after the write.
    pub async fn update_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        change: &Attributes,
        action: ChangeAction,
        max_retries: u32,
    ) -> ModelResult<Value> {
        self.mutate_object(bucket, uuid, max_retries, |current| {
            let mut updated = attributes::apply_change(current, change, action);
            if bucket == Bucket::Applications && action != ChangeAction::Delete {
                // Applications own owner_uuid and may reassign it here.
                if let Some(owner) = change.get("owner_uuid") {
                    updated.insert("owner_uuid".to_string(), owner.clone());
                }
            }
            updated
        })
        .await
    }

    /// Read-modify-write loop shared by every mutation of a stored object.
    pub(crate) async fn mutate_object<F>(
        &self,
        bucket: Bucket,
        uuid: &str,
        max_retries: u32,
        mutate: F,
    ) -> ModelResult<Value>
    where
        F: Fn(&Attributes) -> Attributes + Send + Sync,
    {
        let mut retries = max_retries;
        loop {
            match self.try_mutate(bucket, uuid, &mutate).await {
                Err(ModelError::Store(e)) if e.is_conflict() => {
                    if retries == 0 {
                        warn!(%bucket, %uuid, "update retries exhausted");
                        return Err(ModelError::Conflict(e.to_string()));
                    }
                    retries -= 1;
                    debug!(%bucket, %uuid, retries_left = retries, "etag conflict, retrying");
                    tokio::time::sleep(self.config.update_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn try_mutate<F>(&self, bucket: Bucket, uuid: &str, mutate: &F) -> ModelResult<Value>
    where
        F: Fn(&Attributes) -> Attributes + Send + Sync,
    {
        let store = self.store().await;
        let current = locate(store.as_ref(), bucket, uuid)
            .await?
            .ok_or_else(|| ModelError::not_found(bucket, uuid))?;
        let Value::Object(obj) = &current.value else {
            return Err(StoreError::Corrupt(format!("{bucket}/{uuid} is not an object")).into());
        };

        let updated = mutate(obj);
        self.validate_object(&updated).await?;
        let updated = Value::Object(updated);

        store
            .put_object(bucket, uuid, &updated, &PutOptions::with_etag(current.etag))
            .await?;

        let stored = store
            .get_object(bucket, uuid, &read_back(&updated))
            .await?
            .ok_or_else(|| ModelError::not_found(bucket, uuid))?;
        debug!(%bucket, %uuid, "object updated");
        Ok(stored.value)
    }

    // -- Validation --------------------------------------------------------

    /// Check an object before it is written: metadata against its schema,
    /// structural rules, then manifest references. First failure wins.
    pub(crate) async fn validate_object(&self, obj: &Attributes) -> ModelResult<()> {
        if let (Some(schema), Some(metadata)) = (obj.get("metadata_schema"), obj.get("metadata")) {
            if !schema.is_null() && !metadata.is_null() {
                self.validator
                    .validate(schema, metadata)
                    .map_err(ModelError::SchemaInvalid)?;
            }
        }

        attributes::check_shape(obj).map_err(ModelError::Invalid)?;

        let refs = attributes::referenced_manifests(obj);
        if refs.is_empty() {
            return Ok(());
        }
        let store = self.store().await;
        let store = &store;
        try_join_all(refs.into_iter().map(|uuid| async move {
            match store
                .get_object(Bucket::Manifests, &uuid, &ReadOptions::default())
                .await?
            {
                Some(_) => Ok(()),
                None => Err(ModelError::Invalid(format!("manifest {uuid} does not exist"))),
            }
        }))
        .await?;
        Ok(())
    }
}

/// Read options that see `value` on whichever connection its `master`
/// flag routed the write to.
fn read_back(value: &Value) -> ReadOptions {
    ReadOptions {
        include_master: value.get("master").and_then(Value::as_bool) == Some(true),
    }
}

/// Local read, falling back to the master datacenter on a miss.
async fn locate(
    store: &dyn ObjectStore,
    bucket: Bucket,
    uuid: &str,
) -> ModelResult<Option<StoredObject>> {
    if let Some(found) = store.get_object(bucket, uuid, &ReadOptions::default()).await? {
        return Ok(Some(found));
    }
    let opts = ReadOptions {
        include_master: true,
    };
    Ok(store.get_object(bucket, uuid, &opts).await?)
}

pub(crate) fn encode<E: Entity>(entity: &E) -> ModelResult<Value> {
    serde_json::to_value(entity).map_err(|e| StoreError::Serialize(e.to_string()).into())
}

pub(crate) fn decode<E: Entity>(value: Value) -> ModelResult<E> {
    serde_json::from_value(value).map_err(|e| {
        StoreError::Corrupt(format!("malformed {} record: {e}", E::BUCKET)).into()
    })
}

/// A fresh object uuid.
pub(crate) fn new_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Assign a uuid when the caller did not supply one.
pub(crate) fn ensure_uuid<E: Entity>(entity: &mut E) {
    if entity.uuid().is_empty() {
        entity.set_uuid(new_uuid());
    }
}
