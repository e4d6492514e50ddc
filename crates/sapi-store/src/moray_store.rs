//! MorayStore: object store backed by one or two Moray connections.
//!
//! The `local` connection is always present. The optional `master`
//! connection points at the master datacenter's Moray and is only used
//! while this control plane bootstraps from a master region: objects
//! flagged `master: true` are written there, and reads may include it on
//! request.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sapi_core::config::MoraySection;
use sapi_core::{Bucket, SapiConfig};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::moray::{FindOptions, MorayClient};
use crate::store::{Filters, ObjectStore, PutOptions, ReadOptions, StoredObject};
use crate::tables::bucket_schema;

/// Records fetched per `find_objects` call while listing.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone)]
pub struct MorayStoreConfig {
    pub page_size: usize,
    /// Delay between bucket provisioning attempts.
    pub init_retry: Duration,
    /// How long `init` waits for provisioning before reporting success anyway.
    pub init_timeout: Duration,
}

impl Default for MorayStoreConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            init_retry: Duration::from_secs(5),
            init_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&MoraySection> for MorayStoreConfig {
    fn from(section: &MoraySection) -> Self {
        Self {
            page_size: section.page_size,
            init_retry: Duration::from_secs(section.init_retry_secs),
            init_timeout: Duration::from_secs(section.init_timeout_secs),
        }
    }
}

impl From<&SapiConfig> for MorayStoreConfig {
    fn from(config: &SapiConfig) -> Self {
        Self::from(&config.moray)
    }
}

pub struct MorayStore {
    local: Arc<dyn MorayClient>,
    master: Option<Arc<dyn MorayClient>>,
    config: MorayStoreConfig,
    /// Bucket provisioning still retrying after `init` returned.
    provisioner: Mutex<Option<JoinHandle<()>>>,
}

impl MorayStore {
    pub fn new(
        local: Arc<dyn MorayClient>,
        master: Option<Arc<dyn MorayClient>>,
        config: MorayStoreConfig,
    ) -> Self {
        Self {
            local,
            master,
            config,
            provisioner: Mutex::new(None),
        }
    }

    fn clients(&self) -> Vec<Arc<dyn MorayClient>> {
        std::iter::once(Arc::clone(&self.local))
            .chain(self.master.iter().cloned())
            .collect()
    }

    /// Connection a write of `value` goes to.
    fn route(&self, value: &Value) -> &Arc<dyn MorayClient> {
        let flagged = value.get("master").and_then(Value::as_bool) == Some(true);
        match &self.master {
            Some(master) if flagged => master,
            _ => &self.local,
        }
    }

    fn set_provisioner(&self, handle: Option<JoinHandle<()>>) {
        let mut slot = self
            .provisioner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(old) = std::mem::replace(&mut *slot, handle) {
            old.abort();
        }
    }
}

/// Create or upgrade every registry bucket on every connection.
async fn provision_buckets(clients: &[Arc<dyn MorayClient>]) -> StoreResult<()> {
    for client in clients {
        for bucket in Bucket::ALL {
            let wanted = bucket_schema(bucket);
            match client.get_bucket(bucket.name()).await {
                Ok(existing) if existing.version >= wanted.version => {
                    debug!(%bucket, version = existing.version, "bucket up to date");
                }
                Ok(existing) => {
                    info!(%bucket, from = existing.version, to = wanted.version, "updating bucket");
                    client.put_bucket(bucket.name(), &wanted).await?;
                }
                Err(StoreError::BucketNotFound(_)) => {
                    info!(%bucket, "creating bucket");
                    client.put_bucket(bucket.name(), &wanted).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

async fn get_one(
    client: &dyn MorayClient,
    bucket: Bucket,
    uuid: &str,
) -> StoreResult<Option<StoredObject>> {
    match client.get_object(bucket.name(), uuid).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Page through every match on one connection.
async fn find_all(
    client: &dyn MorayClient,
    bucket: Bucket,
    filters: &Filters,
    page_size: usize,
) -> StoreResult<Vec<Value>> {
    let mut values = Vec::new();
    let mut offset = 0;
    loop {
        let page = client
            .find_objects(
                bucket.name(),
                filters,
                &FindOptions {
                    limit: page_size,
                    offset,
                },
            )
            .await?;
        let count = page.len();
        values.extend(page.into_iter().map(|obj| obj.value));
        if count < page_size {
            break;
        }
        offset += count;
    }
    debug!(%bucket, filter = %filters.to_ldap(), count = values.len(), "moray listing done");
    Ok(values)
}

#[async_trait]
impl ObjectStore for MorayStore {
    fn kind(&self) -> &'static str {
        "moray"
    }

    async fn init(&self) -> StoreResult<()> {
        let clients = self.clients();
        let retry = self.config.init_retry;
        let mut handle = tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match provision_buckets(&clients).await {
                    Ok(()) => {
                        info!(attempt, "moray buckets provisioned");
                        return;
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "moray bucket provisioning failed, retrying");
                        tokio::time::sleep(retry).await;
                    }
                }
            }
        });

        match tokio::time::timeout(self.config.init_timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StoreError::Unavailable(format!(
                "bucket provisioning task failed: {e}"
            ))),
            Err(_) => {
                warn!(
                    timeout = ?self.config.init_timeout,
                    "moray not ready, continuing startup while provisioning retries"
                );
                self.set_provisioner(Some(handle));
                Ok(())
            }
        }
    }

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()> {
        let client = self.route(value);
        client
            .put_object(bucket.name(), uuid, value, opts.etag.as_deref())
            .await?;
        debug!(%bucket, %uuid, "moray object stored");
        Ok(())
    }

    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>> {
        match (&self.master, opts.include_master) {
            (Some(master), true) => {
                let (local, remote) = tokio::try_join!(
                    get_one(self.local.as_ref(), bucket, uuid),
                    get_one(master.as_ref(), bucket, uuid),
                )?;
                Ok(local.or(remote))
            }
            _ => get_one(self.local.as_ref(), bucket, uuid).await,
        }
    }

    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()> {
        match self.local.delete_object(bucket.name(), uuid).await {
            Err(e) if e.is_not_found() => match &self.master {
                Some(master) => master.delete_object(bucket.name(), uuid).await,
                None => Err(e),
            },
            other => other,
        }
    }

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>> {
        let page_size = self.config.page_size.max(1);
        match (&self.master, opts.include_master) {
            (Some(master), true) => {
                let (mut local, remote) = tokio::try_join!(
                    find_all(self.local.as_ref(), bucket, filters, page_size),
                    find_all(master.as_ref(), bucket, filters, page_size),
                )?;
                local.extend(remote);
                Ok(local)
            }
            _ => find_all(self.local.as_ref(), bucket, filters, page_size).await,
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.local.ping().await?;
        if let Some(master) = &self.master {
            master.ping().await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.set_provisioner(None);
        for client in self.clients() {
            client.close().await;
        }
        debug!("moray store closed");
    }
}
