//! Service operations.

use sapi_core::{Application, Attributes, Bucket, ChangeAction, Service};
use sapi_store::{Filters, ReadOptions};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::model::{Model, decode, ensure_uuid};

impl Model {
    /// The parent application must exist.
    pub async fn create_service(&self, mut svc: Service) -> ModelResult<Service> {
        if svc.name.is_empty() {
            return Err(ModelError::Invalid("service name is required".into()));
        }
        self.locate_entity::<Application>(&svc.application_uuid).await?;
        ensure_uuid(&mut svc);

        let stored = self.put_entity(&svc).await?;
        info!(
            uuid = %stored.uuid,
            name = %stored.name,
            application = %stored.application_uuid,
            kind = stored.kind.as_str(),
            "service created"
        );
        Ok(stored)
    }

    pub async fn list_services(
        &self,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> ModelResult<Vec<Service>> {
        self.list_entities(filters, opts).await
    }

    pub async fn get_service(&self, uuid: &str, opts: &ReadOptions) -> ModelResult<Service> {
        self.get_entity(uuid, opts).await
    }

    pub async fn update_service(
        &self,
        uuid: &str,
        change: &Attributes,
        action: ChangeAction,
    ) -> ModelResult<Service> {
        let value = self
            .update_object(Bucket::Services, uuid, change, action, self.config.update_retries)
            .await?;
        decode(value)
    }

    pub async fn delete_service(&self, uuid: &str) -> ModelResult<()> {
        self.delete_entity(Bucket::Services, uuid).await
    }
}
