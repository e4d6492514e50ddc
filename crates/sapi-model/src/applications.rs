//! Application operations.

use sapi_core::{Application, Attributes, Bucket, ChangeAction};
use sapi_store::{Filters, ReadOptions};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::model::{Model, decode, ensure_uuid};

impl Model {
    pub async fn create_application(&self, mut app: Application) -> ModelResult<Application> {
        if app.name.is_empty() {
            return Err(ModelError::Invalid("application name is required".into()));
        }
        if app.owner_uuid.is_empty() {
            return Err(ModelError::Invalid("owner_uuid is required".into()));
        }
        ensure_uuid(&mut app);

        let stored = self.put_entity(&app).await?;
        info!(uuid = %stored.uuid, name = %stored.name, "application created");
        Ok(stored)
    }

    pub async fn list_applications(
        &self,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> ModelResult<Vec<Application>> {
        self.list_entities(filters, opts).await
    }

    /// Objects stored in the master datacenter are only visible with
    /// `include_master`.
    pub async fn get_application(&self, uuid: &str, opts: &ReadOptions) -> ModelResult<Application> {
        self.get_entity(uuid, opts).await
    }

    /// Besides the managed fields, an application update may reassign
    /// `owner_uuid`.
    pub async fn update_application(
        &self,
        uuid: &str,
        change: &Attributes,
        action: ChangeAction,
    ) -> ModelResult<Application> {
        let value = self
            .update_object(Bucket::Applications, uuid, change, action, self.config.update_retries)
            .await?;
        decode(value)
    }

    pub async fn delete_application(&self, uuid: &str) -> ModelResult<()> {
        self.delete_entity(Bucket::Applications, uuid).await
    }
}
