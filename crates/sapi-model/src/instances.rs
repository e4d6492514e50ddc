//! Instance operations, including the VM lifecycle behind them.
//!
//! An instance of a `vm` service is backed by a VM provisioned through the
//! compute orchestrator; agents have no VM. The VM side is only reachable
//! in full mode.

use std::sync::Arc;

use sapi_core::{Attributes, Bucket, ChangeAction, Instance, Service, ServiceType};
use sapi_store::{Filters, ReadOptions};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::attributes::TEARDOWN_SCRIPT_KEY;
use crate::error::{ExternalKind, ModelError, ModelResult};
use crate::external::{ComputeApi, CreateVmOptions};
use crate::model::{Model, decode, ensure_uuid};

#[derive(Debug, Clone, Default)]
pub struct CreateInstanceOptions {
    /// Block until the provisioning job finishes.
    pub wait: bool,
    /// Passed on to the compute orchestrator.
    pub request_id: Option<String>,
}

impl Model {
    /// Record a new instance and, for `vm` services, provision its VM.
    ///
    /// The instance takes its type from the service. With `exists` set no
    /// VM is provisioned. If provisioning fails the record is removed again.
    pub async fn create_instance(
        &self,
        mut inst: Instance,
        opts: CreateInstanceOptions,
    ) -> ModelResult<Instance> {
        let svc: Service = self.locate_entity(&inst.service_uuid).await?;
        inst.kind = svc.kind;
        ensure_uuid(&mut inst);

        let needs_vm = inst.kind == ServiceType::Vm && !inst.exists;
        let compute = if needs_vm {
            Some(self.require_compute().await?)
        } else {
            None
        };

        let stored = self.put_entity(&inst).await?;
        info!(
            uuid = %stored.uuid,
            service = %stored.service_uuid,
            kind = stored.kind.as_str(),
            "instance created"
        );

        let Some(compute) = compute else {
            return Ok(stored);
        };

        match self.provision(compute.as_ref(), &stored.uuid, &opts).await {
            Ok(job_uuid) => self.record_job(&stored.uuid, &job_uuid).await,
            Err(e) => {
                warn!(uuid = %stored.uuid, error = %e, "provisioning failed, removing instance");
                if let Err(cleanup) = self.delete_entity(Bucket::Instances, &stored.uuid).await {
                    warn!(uuid = %stored.uuid, error = %cleanup, "instance rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        compute: &dyn ComputeApi,
        uuid: &str,
        opts: &CreateInstanceOptions,
    ) -> ModelResult<String> {
        let params = self.generate_zone_params(uuid).await?;
        let vm_opts = CreateVmOptions {
            request_id: opts.request_id.clone(),
        };
        let job_uuid = compute
            .create_vm(&params, &vm_opts)
            .await
            .map_err(|e| ModelError::external(ExternalKind::ProvisionFailed, e))?;
        debug!(%uuid, job = %job_uuid, "provisioning job started");
        if opts.wait {
            self.wait_for_job(compute, &job_uuid, ExternalKind::ProvisionFailed)
                .await?;
        }
        Ok(job_uuid)
    }

    async fn record_job(&self, uuid: &str, job_uuid: &str) -> ModelResult<Instance> {
        let job = Value::String(job_uuid.to_string());
        let value = self
            .mutate_object(Bucket::Instances, uuid, self.config.update_retries, |current| {
                let mut updated = current.clone();
                updated.insert("job_uuid".to_string(), job.clone());
                updated
            })
            .await?;
        decode(value)
    }

    pub async fn list_instances(
        &self,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> ModelResult<Vec<Instance>> {
        self.list_entities(filters, opts).await
    }

    pub async fn get_instance(&self, uuid: &str, opts: &ReadOptions) -> ModelResult<Instance> {
        self.get_entity(uuid, opts).await
    }

    pub async fn update_instance(
        &self,
        uuid: &str,
        change: &Attributes,
        action: ChangeAction,
    ) -> ModelResult<Instance> {
        let value = self
            .update_object(Bucket::Instances, uuid, change, action, self.config.update_retries)
            .await?;
        decode(value)
    }

    /// Tear down the instance's VM (running the pre-teardown hook first)
    /// and remove the record. The record is removed even when the VM side
    /// fails; the first failure is returned.
    pub async fn delete_instance(&self, uuid: &str) -> ModelResult<()> {
        let inst: Instance = self.locate_entity(uuid).await?;
        let mut first_err = None;

        if inst.kind == ServiceType::Vm {
            match self.compute().await {
                Some(compute) => {
                    if let Err(e) = self.destroy_vm(&compute, &inst).await {
                        warn!(%uuid, error = %e, "VM teardown failed");
                        first_err = Some(e);
                    }
                }
                None => debug!(%uuid, "no compute in proto mode, skipping VM teardown"),
            }
        }

        if let Err(e) = self.delete_entity(Bucket::Instances, uuid).await {
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn destroy_vm(&self, compute: &Arc<dyn ComputeApi>, inst: &Instance) -> ModelResult<()> {
        let vm = compute
            .get_vm(&inst.uuid)
            .await
            .map_err(|e| ModelError::external(ExternalKind::DestroyFailed, e))?;
        let Some(vm) = vm else {
            debug!(uuid = %inst.uuid, "VM already gone");
            return Ok(());
        };

        let hook = self.run_teardown_hook(inst, vm.server_uuid.as_deref()).await;

        let job_uuid = compute
            .delete_vm(&inst.uuid)
            .await
            .map_err(|e| ModelError::external(ExternalKind::DestroyFailed, e))?;
        self.wait_for_job(compute.as_ref(), &job_uuid, ExternalKind::DestroyFailed)
            .await?;
        info!(uuid = %inst.uuid, job = %job_uuid, "VM destroyed");
        hook
    }

    /// Run the composed `pre_teardown_script` on the VM's compute node.
    async fn run_teardown_hook(&self, inst: &Instance, server_uuid: Option<&str>) -> ModelResult<()> {
        let chain = self.instance_chain(&inst.uuid).await?;
        let metadata = chain.metadata();
        let Some(script) = metadata.get(TEARDOWN_SCRIPT_KEY).and_then(Value::as_str) else {
            return Ok(());
        };
        let fail = |detail: String| ModelError::external(ExternalKind::TeardownHookFailed, detail);
        let server = server_uuid.ok_or_else(|| fail(format!("VM {} has no server", inst.uuid)))?;
        let runner = self
            .commands
            .as_ref()
            .ok_or_else(|| fail("no command runner configured".to_string()))?;
        runner
            .run_command(server, script)
            .await
            .map_err(|e| fail(e.to_string()))?;
        info!(uuid = %inst.uuid, server = %server, "teardown hook ran");
        Ok(())
    }

    /// Reprovision the instance's VM onto another image and record it.
    pub async fn reprovision_instance(&self, uuid: &str, image_uuid: &str) -> ModelResult<Instance> {
        let inst: Instance = self.locate_entity(uuid).await?;
        if inst.kind == ServiceType::Agent {
            return Err(ModelError::Invalid(format!(
                "instance {uuid} is an agent and has no VM"
            )));
        }
        let compute = self.require_compute().await?;
        let job_uuid = compute
            .reprovision_vm(uuid, image_uuid)
            .await
            .map_err(|e| ModelError::external(ExternalKind::ReprovisionFailed, e))?;
        self.wait_for_job(compute.as_ref(), &job_uuid, ExternalKind::ReprovisionFailed)
            .await?;

        let change = attributes_object(json!({ "params": { "image_uuid": image_uuid } }));
        let updated = self
            .update_instance(uuid, &change, ChangeAction::Update)
            .await?;
        info!(%uuid, image = %image_uuid, "instance reprovisioned");
        Ok(updated)
    }
}

fn attributes_object(value: Value) -> Attributes {
    match value {
        Value::Object(m) => m,
        _ => Attributes::new(),
    }
}
