//! Upgrade from proto mode to full mode.
//!
//! The upgrade runs as an ordered list of steps. Each step that changes
//! state registers how to undo it; on failure the undo list is unwound in
//! reverse and the model is back in proto mode, serving from the local
//! store. Clearing the proto marker is the last fallible step.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::{StreamExt, TryStreamExt};
use sapi_core::{Application, Bucket, Entity, HistoryEntry, Instance, Manifest, Service};
use sapi_store::{Filters, MorayLocalStore, ObjectStore, ReadOptions, TransitionStore};
use tracing::{info, warn};

use crate::error::{ModelError, ModelResult};
use crate::instances::CreateInstanceOptions;
use crate::model::{Mode, Model, decode};

/// Objects copied concurrently per bucket.
const COPY_CONCURRENCY: usize = 8;

enum Undo {
    DropCompute,
    CloseStore(Arc<dyn ObjectStore>),
    RestoreLocal,
}

#[derive(Default)]
struct Rollback(Vec<Undo>);

impl Rollback {
    fn push(&mut self, undo: Undo) {
        self.0.push(undo);
    }

    async fn unwind(self, model: &Model) {
        for undo in self.0.into_iter().rev() {
            match undo {
                Undo::RestoreLocal => {
                    *model.store.write().await = Arc::clone(&model.local);
                    info!("active store restored to local");
                }
                Undo::CloseStore(store) => {
                    store.close().await;
                    info!(store = store.kind(), "store closed");
                }
                Undo::DropCompute => {
                    *model.compute.write().await = None;
                    info!("compute clients dropped");
                }
            }
        }
    }
}

fn step_failed(step: &'static str, detail: impl fmt::Display) -> ModelError {
    ModelError::Migration {
        step,
        detail: detail.to_string(),
    }
}

/// Per-bucket counts from the bulk copy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub manifests: usize,
    pub applications: usize,
    pub services: usize,
    pub instances: usize,
    pub history: usize,
}

impl Model {
    /// Move the registry onto Moray. A no-op when an upgrade is already
    /// running or done.
    pub async fn upgrade_to_full_mode(&self) -> ModelResult<()> {
        if self
            .mode
            .compare_exchange(
                Mode::Proto.as_u8(),
                Mode::Transitioning.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            info!(mode = self.mode().as_str(), "upgrade already in progress or done");
            return Ok(());
        }
        info!("upgrading to full mode");

        let mut rollback = Rollback::default();
        match self.run_upgrade(&mut rollback).await {
            Ok(stats) => {
                self.mode.store(Mode::Full.as_u8(), Ordering::SeqCst);
                info!(
                    manifests = stats.manifests,
                    applications = stats.applications,
                    services = stats.services,
                    instances = stats.instances,
                    history = stats.history,
                    "full mode active"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "upgrade failed, rolling back");
                rollback.unwind(self).await;
                self.mode.store(Mode::Proto.as_u8(), Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn run_upgrade(&self, rollback: &mut Rollback) -> ModelResult<CopyStats> {
        let backends = self
            .backends
            .clone()
            .ok_or_else(|| step_failed("connect", "no full-mode backends configured"))?;

        let compute = backends
            .connect_compute()
            .await
            .map_err(|e| step_failed("connect compute", e))?;
        *self.compute.write().await = Some(compute);
        rollback.push(Undo::DropCompute);
        info!("compute clients connected");

        let moray = backends
            .connect_moray()
            .await
            .map_err(|e| step_failed("connect moray", e))?;
        rollback.push(Undo::CloseStore(Arc::clone(&moray)));
        moray
            .init()
            .await
            .map_err(|e| step_failed("init moray", e))?;
        info!(store = moray.kind(), "moray store initialized");

        let transition: Arc<dyn ObjectStore> =
            Arc::new(TransitionStore::new(Arc::clone(&self.local), Arc::clone(&moray)));
        *self.store.write().await = transition;
        rollback.push(Undo::RestoreLocal);
        info!("dual-writing to local and moray");

        let stats = self
            .copy_local_objects()
            .await
            .map_err(|e| step_failed("copy objects", e))?;

        let composite: Arc<dyn ObjectStore> = Arc::new(MorayLocalStore::new(
            moray,
            Arc::clone(&self.local),
            Arc::clone(&self.identity),
            self.config.refresh_interval,
        ));
        rollback.push(Undo::CloseStore(Arc::clone(&composite)));
        composite
            .init()
            .await
            .map_err(|e| step_failed("init moray+local", e))?;

        self.marker
            .clear()
            .await
            .map_err(|e| step_failed("clear proto marker", e))?;

        *self.store.write().await = composite;
        Ok(stats)
    }

    /// Copy every object of the local store through the create paths, in
    /// dependency order. Instances are copied as already existing so no VM
    /// is provisioned for them. History entries keep their `started` time.
    async fn copy_local_objects(&self) -> ModelResult<CopyStats> {
        let manifests = self
            .copy_bucket::<Manifest, _, _>(|m| async move { self.create_manifest(m).await })
            .await?;
        let applications = self
            .copy_bucket::<Application, _, _>(|a| async move { self.create_application(a).await })
            .await?;
        let services = self
            .copy_bucket::<Service, _, _>(|s| async move { self.create_service(s).await })
            .await?;
        let instances = self
            .copy_bucket::<Instance, _, _>(|mut i| async move {
                i.exists = true;
                self.create_instance(i, CreateInstanceOptions::default()).await
            })
            .await?;
        let history = self
            .copy_bucket::<HistoryEntry, _, _>(|h| async move { self.create_history(h).await })
            .await?;
        Ok(CopyStats {
            manifests,
            applications,
            services,
            instances,
            history,
        })
    }

    async fn copy_bucket<E, F, Fut>(&self, create: F) -> ModelResult<usize>
    where
        E: Entity,
        F: Fn(E) -> Fut,
        Fut: Future<Output = ModelResult<E>>,
    {
        let bucket: Bucket = E::BUCKET;
        let values = self
            .local
            .list_object_values(bucket, &Filters::new(), &ReadOptions::default())
            .await?;
        let entities = values
            .into_iter()
            .map(decode::<E>)
            .collect::<ModelResult<Vec<E>>>()?;

        let copied: Vec<E> = futures::stream::iter(entities)
            .map(&create)
            .buffer_unordered(COPY_CONCURRENCY)
            .try_collect()
            .await?;
        info!(%bucket, count = copied.len(), "bucket copied");
        Ok(copied.len())
    }
}
