//! Instance-scoped reads: the provisioning payload and the zone config.

use futures::future::try_join_all;
use sapi_core::{Application, Attributes, Instance, Manifest, Service};

use crate::attributes::{self, InstanceChain, ZoneConfig};
use crate::error::ModelResult;
use crate::model::Model;

impl Model {
    /// Resolve instance → service → application.
    pub async fn instance_chain(&self, instance_uuid: &str) -> ModelResult<InstanceChain> {
        let instance: Instance = self.locate_entity(instance_uuid).await?;
        let service: Service = self.locate_entity(&instance.service_uuid).await?;
        let application: Application = self.locate_entity(&service.application_uuid).await?;
        Ok(InstanceChain {
            application,
            service,
            instance,
        })
    }

    /// Parameters the compute orchestrator provisions the instance's VM
    /// with. Empty for agents.
    pub async fn generate_zone_params(&self, instance_uuid: &str) -> ModelResult<Attributes> {
        let chain = self.instance_chain(instance_uuid).await?;
        Ok(attributes::zone_params(&chain))
    }

    /// Configuration for the agent running inside the instance's zone.
    /// Every referenced manifest must exist.
    pub async fn generate_zone_config(&self, instance_uuid: &str) -> ModelResult<ZoneConfig> {
        let chain = self.instance_chain(instance_uuid).await?;
        let uuids = chain.manifest_uuids();
        let manifests = try_join_all(uuids.iter().map(|uuid| self.locate_entity::<Manifest>(uuid))).await?;
        Ok(attributes::zone_config(&chain, manifests))
    }

    pub async fn get_instance_payload(&self, instance_uuid: &str) -> ModelResult<Attributes> {
        self.generate_zone_params(instance_uuid).await
    }

    pub async fn get_config(&self, instance_uuid: &str) -> ModelResult<ZoneConfig> {
        self.generate_zone_config(instance_uuid).await
    }
}
