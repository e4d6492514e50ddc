//! Manifest operations. Manifests are immutable once created.

use sapi_core::{Bucket, Manifest};
use sapi_store::{Filters, ReadOptions};
use tracing::info;

use crate::error::{ModelError, ModelResult};
use crate::model::{Model, ensure_uuid};

impl Model {
    pub async fn create_manifest(&self, mut manifest: Manifest) -> ModelResult<Manifest> {
        if manifest.name.is_empty() {
            return Err(ModelError::Invalid("manifest name is required".into()));
        }
        if manifest.path.is_empty() {
            return Err(ModelError::Invalid("manifest path is required".into()));
        }
        if manifest.template.is_null() {
            return Err(ModelError::Invalid("manifest template is required".into()));
        }
        semver::Version::parse(&manifest.version).map_err(|e| {
            ModelError::Invalid(format!("manifest version {}: {e}", manifest.version))
        })?;
        ensure_uuid(&mut manifest);

        let stored = self.put_entity(&manifest).await?;
        info!(uuid = %stored.uuid, name = %stored.name, version = %stored.version, "manifest created");
        Ok(stored)
    }

    pub async fn list_manifests(
        &self,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> ModelResult<Vec<Manifest>> {
        self.list_entities(filters, opts).await
    }

    pub async fn get_manifest(&self, uuid: &str, opts: &ReadOptions) -> ModelResult<Manifest> {
        self.get_entity(uuid, opts).await
    }

    pub async fn delete_manifest(&self, uuid: &str) -> ModelResult<()> {
        self.delete_entity(Bucket::Manifests, uuid).await
    }
}
