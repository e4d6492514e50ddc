//! Admin commands over the registry model.

use std::sync::Arc;

use anyhow::Context;
use sapi_core::{Bucket, SapiConfig};
use sapi_model::{FileProtoMarker, Model, ModelConfig};
use sapi_store::{Filters, LocalStore, LocalStoreConfig, ReadOptions, StaticZoneIdentity};
use serde_json::{Value, json};
use tracing::info;

/// Open the registry on the node's local store. The proto marker decides
/// the mode: without it the store is the cache of an upgraded registry.
pub async fn open_model(config: &SapiConfig) -> anyhow::Result<Model> {
    let local = Arc::new(LocalStore::new(LocalStoreConfig::from(config)));
    let marker = Arc::new(FileProtoMarker::new(config.proto_marker_path()));

    let mut model = Model::open(ModelConfig::from(config), local, marker).await;
    if let Some(zone_id) = &config.zone_id {
        model = model.with_identity(Arc::new(StaticZoneIdentity(zone_id.clone())));
    }
    model
        .init()
        .await
        .with_context(|| format!("opening store under {}", config.data_dir.display()))?;
    info!(mode = model.mode().as_str(), "registry opened");
    Ok(model)
}

pub fn parse_filter(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty filter key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[derive(Debug, Default)]
pub struct ListQuery {
    pub filters: Vec<(String, String)>,
    pub since: Option<i64>,
    pub until: Option<i64>,
}

impl ListQuery {
    fn filters(&self) -> Filters {
        let mut filters = self
            .filters
            .iter()
            .fold(Filters::new(), |f, (k, v)| f.eq(k.as_str(), v.as_str()));
        if let Some(since) = self.since {
            filters = filters.since(since);
        }
        if let Some(until) = self.until {
            filters = filters.until(until);
        }
        filters
    }
}

pub async fn status(model: &Model, config: &SapiConfig) -> Value {
    let store = model.store().await;
    let ping = match model.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => e.to_string(),
    };
    json!({
        "mode": model.mode().as_str(),
        "store": store.kind(),
        "ping": ping,
        "data_dir": config.data_dir.display().to_string(),
    })
}

pub async fn list(model: &Model, bucket: Bucket, query: &ListQuery) -> anyhow::Result<Value> {
    let filters = query.filters();
    let opts = ReadOptions::default();
    let value = match bucket {
        Bucket::Applications => serde_json::to_value(model.list_applications(&filters, &opts).await?)?,
        Bucket::Services => serde_json::to_value(model.list_services(&filters, &opts).await?)?,
        Bucket::Instances => serde_json::to_value(model.list_instances(&filters, &opts).await?)?,
        Bucket::Manifests => serde_json::to_value(model.list_manifests(&filters, &opts).await?)?,
        Bucket::History => serde_json::to_value(model.list_history(query.since, query.until).await?)?,
    };
    Ok(value)
}

pub async fn get(model: &Model, bucket: Bucket, uuid: &str) -> anyhow::Result<Value> {
    let opts = ReadOptions::default();
    let value = match bucket {
        Bucket::Applications => serde_json::to_value(model.get_application(uuid, &opts).await?)?,
        Bucket::Services => serde_json::to_value(model.get_service(uuid, &opts).await?)?,
        Bucket::Instances => serde_json::to_value(model.get_instance(uuid, &opts).await?)?,
        Bucket::Manifests => serde_json::to_value(model.get_manifest(uuid, &opts).await?)?,
        Bucket::History => serde_json::to_value(model.get_history(uuid).await?)?,
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sapi_core::{Application, Instance, Service, ServiceType};
    use sapi_model::{Mode, ProtoMarker};

    fn test_config(dir: &tempfile::TempDir) -> SapiConfig {
        SapiConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    /// A fresh registry still bootstrapping in proto mode.
    async fn proto_registry(dir: &tempfile::TempDir) -> SapiConfig {
        let config = test_config(dir);
        FileProtoMarker::new(config.proto_marker_path())
            .set()
            .await
            .unwrap();
        config
    }

    async fn seeded(dir: &tempfile::TempDir) -> (Model, Instance) {
        let model = open_model(&proto_registry(dir).await).await.unwrap();
        let app = model
            .create_application(Application {
                name: "sdc".into(),
                owner_uuid: "930896af-bf8c-48d4-885c-6573a94b1853".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let svc = model
            .create_service(Service {
                name: "cnapi".into(),
                application_uuid: app.uuid.clone(),
                kind: ServiceType::Vm,
                ..Default::default()
            })
            .await
            .unwrap();
        let inst = model
            .create_instance(
                Instance {
                    service_uuid: svc.uuid.clone(),
                    exists: true,
                    ..Default::default()
                },
                Default::default(),
            )
            .await
            .unwrap();
        (model, inst)
    }

    #[test]
    fn filter_arguments() {
        assert_eq!(
            parse_filter("name=cnapi").unwrap(),
            ("name".to_string(), "cnapi".to_string())
        );
        assert_eq!(
            parse_filter("tag=a=b").unwrap(),
            ("tag".to_string(), "a=b".to_string())
        );
        assert!(parse_filter("name").is_err());
        assert!(parse_filter("=x").is_err());
    }

    #[tokio::test]
    async fn status_reports_proto_mode() {
        let dir = tempfile::tempdir().unwrap();
        let config = proto_registry(&dir).await;
        let model = open_model(&config).await.unwrap();
        let status = status(&model, &config).await;
        assert_eq!(status["mode"], "proto");
        assert_eq!(status["store"], "local");
        assert_eq!(status["ping"], "ok");
    }

    #[tokio::test]
    async fn list_and_get_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let (model, inst) = seeded(&dir).await;

        let query = ListQuery {
            filters: vec![("name".into(), "cnapi".into())],
            ..Default::default()
        };
        let services = list(&model, Bucket::Services, &query).await.unwrap();
        assert_eq!(services.as_array().unwrap().len(), 1);

        let got = get(&model, Bucket::Instances, &inst.uuid).await.unwrap();
        assert_eq!(got["uuid"], inst.uuid.as_str());
        assert_eq!(got["type"], "vm");

        assert!(get(&model, Bucket::Services, "nope").await.is_err());
    }

    #[tokio::test]
    async fn reopened_registry_sees_earlier_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (_model, inst) = seeded(&dir).await;

        let model = open_model(&test_config(&dir)).await.unwrap();
        assert!(model.is_proto_mode());
        let payload = model.get_instance_payload(&inst.uuid).await.unwrap();
        assert_eq!(payload["brand"], "joyent-minimal");
        assert_eq!(payload["customer_metadata"], json!({}));
    }

    #[tokio::test]
    async fn upgraded_registry_reopens_in_full_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (_model, inst) = seeded(&dir).await;
        let config = SapiConfig {
            zone_id: Some(inst.uuid.clone()),
            ..test_config(&dir)
        };
        FileProtoMarker::new(config.proto_marker_path())
            .clear()
            .await
            .unwrap();

        let model = open_model(&config).await.unwrap();
        assert_eq!(model.mode(), Mode::Full);
        assert!(!model.is_proto_mode());
        assert_eq!(status(&model, &config).await["mode"], "full");

        // Never drops back to proto mode, and upgrading again is a no-op.
        model.upgrade_to_full_mode().await.unwrap();
        assert_eq!(model.mode(), Mode::Full);
        let got = get(&model, Bucket::Instances, &inst.uuid).await.unwrap();
        assert_eq!(got["uuid"], inst.uuid.as_str());
    }
}
