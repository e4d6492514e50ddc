//! MorayLocalStore: Moray as the authority, a local store as a cache.
//!
//! Writes go to Moray and are mirrored into the cache. Reads go to Moray
//! and only fall back to the cache when Moray itself looks unreachable;
//! usage errors (bad bucket, bad filter, etag conflict) are returned as is.
//!
//! A background task rebuilds the cache from Moray at `init` and then on a
//! fixed interval. The cache holds the object graph of this process's own
//! application: its services, their instances, and every manifest any of
//! them references.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use sapi_core::Bucket;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::store::{Filters, ObjectStore, PutOptions, ReadOptions, StoredObject};

/// Default interval between cache rebuilds.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Resolves the zone this process runs in.
#[async_trait]
pub trait ZoneIdentity: Send + Sync {
    async fn current_zone_id(&self) -> StoreResult<String>;
}

/// Zone identity known up front (from configuration).
pub struct StaticZoneIdentity(pub String);

#[async_trait]
impl ZoneIdentity for StaticZoneIdentity {
    async fn current_zone_id(&self) -> StoreResult<String> {
        Ok(self.0.clone())
    }
}

/// Outcome of one cache rebuild.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub written: usize,
    pub purged: usize,
}

/// Rebuilds the local cache from Moray.
#[derive(Clone)]
struct CacheRefresher {
    moray: Arc<dyn ObjectStore>,
    local: Arc<dyn ObjectStore>,
    identity: Arc<dyn ZoneIdentity>,
}

fn uuid_of(value: &Value) -> Option<&str> {
    value.get("uuid").and_then(Value::as_str)
}

fn str_field<'a>(value: &'a Value, field: &str) -> StoreResult<&'a str> {
    value.get(field).and_then(Value::as_str).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "object {} has no {field}",
            uuid_of(value).unwrap_or("<unknown>")
        ))
    })
}

fn manifest_refs(value: &Value) -> impl Iterator<Item = &str> {
    value
        .get("manifests")
        .and_then(Value::as_object)
        .into_iter()
        .flat_map(|refs| refs.values().filter_map(Value::as_str))
}

impl CacheRefresher {
    async fn fetch(&self, bucket: Bucket, uuid: &str) -> StoreResult<Value> {
        self.moray
            .get_object(bucket, uuid, &ReadOptions::default())
            .await?
            .map(|obj| obj.value)
            .ok_or_else(|| StoreError::not_found(bucket.name(), uuid))
    }

    async fn refresh(&self) -> StoreResult<RefreshStats> {
        let opts = ReadOptions::default();
        let zone = self.identity.current_zone_id().await?;

        let instance = self.fetch(Bucket::Instances, &zone).await?;
        let service = self
            .fetch(Bucket::Services, str_field(&instance, "service_uuid")?)
            .await?;
        let app_uuid = str_field(&service, "application_uuid")?.to_string();
        let application = self.fetch(Bucket::Applications, &app_uuid).await?;

        let services = self
            .moray
            .list_object_values(
                Bucket::Services,
                &Filters::new().eq("application_uuid", app_uuid.as_str()),
                &opts,
            )
            .await?;

        let instances: Vec<Value> = try_join_all(services.iter().filter_map(uuid_of).map(|svc| {
            let filters = Filters::new().eq("service_uuid", svc);
            let moray = &self.moray;
            let opts = &opts;
            async move {
                moray
                    .list_object_values(Bucket::Instances, &filters, opts)
                    .await
            }
        }))
        .await?
        .into_iter()
        .flatten()
        .collect();

        let wanted: BTreeSet<&str> = std::iter::once(&application)
            .chain(&services)
            .chain(&instances)
            .flat_map(manifest_refs)
            .collect();
        let manifests: Vec<Value> = try_join_all(
            wanted
                .iter()
                .map(|uuid| self.moray.get_object(Bucket::Manifests, uuid, &opts)),
        )
        .await?
        .into_iter()
        .flatten()
        .map(|obj| obj.value)
        .collect();

        let mut stats = RefreshStats::default();
        let put = PutOptions::default();
        let batches = [
            (Bucket::Applications, std::slice::from_ref(&application)),
            (Bucket::Services, services.as_slice()),
            (Bucket::Instances, instances.as_slice()),
            (Bucket::Manifests, manifests.as_slice()),
        ];
        for (bucket, values) in batches {
            for value in values {
                if let Some(uuid) = uuid_of(value) {
                    self.local.put_object(bucket, uuid, value, &put).await?;
                    stats.written += 1;
                }
            }
        }

        // Manifests are never purged: a stale cached manifest is harmless,
        // while purging could race one that was only just created.
        for (bucket, current) in [
            (Bucket::Services, &services),
            (Bucket::Instances, &instances),
        ] {
            let keep: BTreeSet<&str> = current.iter().filter_map(uuid_of).collect();
            let cached = self
                .local
                .list_object_values(bucket, &Filters::new(), &opts)
                .await?;
            for stale in cached.iter().filter_map(uuid_of).filter(|u| !keep.contains(u)) {
                match self.local.del_object(bucket, stale).await {
                    Ok(()) => stats.purged += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }

        info!(
            application = %app_uuid,
            written = stats.written,
            purged = stats.purged,
            "local cache refreshed from moray"
        );
        Ok(stats)
    }
}

struct RefreshTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct MorayLocalStore {
    moray: Arc<dyn ObjectStore>,
    local: Arc<dyn ObjectStore>,
    refresher: CacheRefresher,
    refresh_interval: Duration,
    task: Mutex<Option<RefreshTask>>,
}

impl MorayLocalStore {
    pub fn new(
        moray: Arc<dyn ObjectStore>,
        local: Arc<dyn ObjectStore>,
        identity: Arc<dyn ZoneIdentity>,
        refresh_interval: Duration,
    ) -> Self {
        let refresher = CacheRefresher {
            moray: Arc::clone(&moray),
            local: Arc::clone(&local),
            identity,
        };
        Self {
            moray,
            local,
            refresher,
            refresh_interval,
            task: Mutex::new(None),
        }
    }

    /// Rebuild the cache now.
    pub async fn refresh(&self) -> StoreResult<RefreshStats> {
        self.refresher.refresh().await
    }

    fn start_refresh_loop(&self) {
        let (shutdown_tx, mut shutdown) = watch::channel(false);
        let refresher = self.refresher.clone();
        let period = self.refresh_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately; init already refreshed.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = refresher.refresh().await {
                            warn!(error = %e, "periodic cache refresh failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("cache refresh loop stopped");
        });

        let mut slot = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(old) = slot.replace(RefreshTask {
            handle,
            shutdown_tx,
        }) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
    }

    fn stop_refresh_loop(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(true);
            task.handle.abort();
        }
    }
}

#[async_trait]
impl ObjectStore for MorayLocalStore {
    fn kind(&self) -> &'static str {
        "moray+local"
    }

    async fn init(&self) -> StoreResult<()> {
        self.moray.init().await?;
        self.local.init().await?;
        if let Err(e) = self.refresher.refresh().await {
            warn!(error = %e, "initial cache refresh failed");
        }
        self.start_refresh_loop();
        info!(interval = ?self.refresh_interval, "moray+local store initialized");
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()> {
        self.moray.put_object(bucket, uuid, value, opts).await?;
        // Cache etags differ from Moray's; mirror unconditionally.
        if let Err(e) = self
            .local
            .put_object(bucket, uuid, value, &PutOptions::default())
            .await
        {
            warn!(%bucket, %uuid, error = %e, "failed to mirror write to local cache");
        }
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>> {
        let err = match self.moray.get_object(bucket, uuid, opts).await {
            Ok(found) => return Ok(found),
            Err(e) if e.is_usage() => return Err(e),
            Err(e) => e,
        };

        warn!(%bucket, %uuid, error = %err, "moray unavailable, trying local cache");
        match self.local.get_object(bucket, uuid, opts).await {
            Ok(Some(obj)) => {
                warn!(%bucket, %uuid, "served object from local cache; may be stale");
                Ok(Some(obj))
            }
            Ok(None) => Err(err),
            Err(local_err) => {
                debug!(%bucket, %uuid, error = %local_err, "local cache read failed");
                Err(err)
            }
        }
    }

    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()> {
        let (moray, local) = tokio::join!(
            self.moray.del_object(bucket, uuid),
            self.local.del_object(bucket, uuid),
        );
        if let Err(e) = local {
            debug!(%bucket, %uuid, error = %e, "local cache delete failed; next refresh reconciles");
        }
        moray
    }

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>> {
        let err = match self.moray.list_object_values(bucket, filters, opts).await {
            Ok(values) => return Ok(values),
            Err(e) if e.is_usage() => return Err(e),
            Err(e) => e,
        };

        warn!(%bucket, filter = %filters.to_ldap(), error = %err, "moray unavailable, listing from local cache");
        match self.local.list_object_values(bucket, filters, opts).await {
            Ok(values) if !values.is_empty() => {
                warn!(%bucket, count = values.len(), "served listing from local cache; may be stale");
                Ok(values)
            }
            Ok(_) => Err(err),
            Err(local_err) => {
                debug!(%bucket, error = %local_err, "local cache listing failed");
                Err(err)
            }
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.moray.ping().await
    }

    async fn close(&self) {
        self.stop_refresh_loop();
        self.moray.close().await;
        self.local.close().await;
    }

    async fn sync(&self) -> StoreResult<()> {
        self.refresher.refresh().await.map(|_| ()).inspect_err(|e| {
            error!(error = %e, "forced cache refresh failed");
        })
    }
}
