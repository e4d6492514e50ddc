//! Update protocol, validation and attribute resolution through the model.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;
use sapi_core::{Bucket, ChangeAction, ServiceType};
use sapi_model::{FileProtoMarker, Model, ModelError};
use sapi_store::{Filters, MemoryMoray, MorayStore, MorayStoreConfig, ReadOptions};
use serde_json::json;

async fn conflicting_model(
    dir: &tempfile::TempDir,
    conflicts: u32,
) -> (Arc<ConflictingStore>, Model) {
    let store = Arc::new(ConflictingStore::new(local_store(dir), conflicts));
    let model = Model::new(
        test_config(),
        store.clone(),
        Arc::new(FileProtoMarker::new(dir.path().join("proto_mode"))),
    );
    model.init().await.unwrap();
    (store, model)
}

#[tokio::test]
async fn update_succeeds_after_fewer_conflicts_than_retries() {
    let dir = tempfile::tempdir().unwrap();
    let (store, model) = conflicting_model(&dir, 2).await;
    let app = model.create_application(application("sdc")).await.unwrap();

    let updated = model
        .update_application(&app.uuid, &attrs(json!({"params": {"dns": "x"}})), ChangeAction::Update)
        .await
        .unwrap();

    assert_eq!(updated.params.unwrap()["dns"], "x");
    assert_eq!(store.conditional_puts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn update_surfaces_conflict_when_retries_run_out() {
    let dir = tempfile::tempdir().unwrap();
    let (store, model) = conflicting_model(&dir, 10).await;
    let app = model.create_application(application("sdc")).await.unwrap();

    let err = model
        .update_object(
            Bucket::Applications,
            &app.uuid,
            &attrs(json!({"metadata": {"k": "v"}})),
            ChangeAction::Update,
            3,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::Conflict(_)), "{err}");
    // One initial attempt plus three retries.
    assert_eq!(store.conditional_puts.load(Ordering::SeqCst), 4);
    let stored = model.get_application(&app.uuid, &ReadOptions::default()).await.unwrap();
    assert!(stored.metadata.is_none());
}

#[tokio::test]
async fn update_of_missing_object_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let err = model
        .update_service(
            "7b1c5e7a-6a42-4e1c-9a0c-8c1b4a3f2d10",
            &attrs(json!({"params": {}})),
            ChangeAction::Update,
        )
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn schema_violation_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (store, model) = conflicting_model(&dir, 0).await;
    let mut app = application("sdc");
    app.metadata_schema = Some(json!({
        "type": "object",
        "properties": {"port": {"type": "integer"}}
    }));
    let app = model.create_application(app).await.unwrap();

    let err = model
        .update_application(&app.uuid, &attrs(json!({"metadata": {"port": "http"}})), ChangeAction::Update)
        .await
        .unwrap_err();

    assert!(matches!(err, ModelError::SchemaInvalid(_)), "{err}");
    assert_eq!(store.conditional_puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn application_owner_can_be_reassigned() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let app = model.create_application(application("sdc")).await.unwrap();
    let svc = model
        .create_service(service(&app, "cnapi", ServiceType::Vm))
        .await
        .unwrap();

    let owner = "0f3fbfe5-1a1d-4a39-a1a3-5d5b8f0b7b11";
    let updated = model
        .update_application(&app.uuid, &attrs(json!({"owner_uuid": owner})), ChangeAction::Update)
        .await
        .unwrap();
    assert_eq!(updated.owner_uuid, owner);

    // Other entities ignore fields outside the managed set.
    let updated = model
        .update_service(&svc.uuid, &attrs(json!({"name": "renamed"})), ChangeAction::Update)
        .await
        .unwrap();
    assert_eq!(updated.name, "cnapi");
}

#[tokio::test]
async fn replace_and_delete_actions() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let mut app = application("sdc");
    app.params = Some(attrs(json!({"a": 1, "b": 2})));
    let app = model.create_application(app).await.unwrap();

    let replaced = model
        .update_application(&app.uuid, &attrs(json!({"params": {"c": 3}})), ChangeAction::Replace)
        .await
        .unwrap();
    assert_eq!(replaced.params, Some(attrs(json!({"c": 3}))));

    let deleted = model
        .update_application(&app.uuid, &attrs(json!({"params": {"c": null}})), ChangeAction::Delete)
        .await
        .unwrap();
    assert_eq!(deleted.params, Some(attrs(json!({}))));
}

#[tokio::test]
async fn service_requires_existing_application() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let mut app = application("ghost");
    app.uuid = "3d4f4b8e-2f7c-4d36-9f6e-0d0c0b0a0908".to_string();
    let err = model
        .create_service(service(&app, "cnapi", ServiceType::Vm))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn dangling_manifest_reference_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let mut app = application("sdc");
    app.manifests = Some([("registrar".to_string(), "missing".to_string())].into());
    let err = model.create_application(app).await.unwrap_err();
    assert!(matches!(err, ModelError::Invalid(_)), "{err}");

    let m = model.create_manifest(manifest("registrar")).await.unwrap();
    let mut app = application("sdc");
    app.manifests = Some([("registrar".to_string(), m.uuid.clone())].into());
    assert!(model.create_application(app).await.is_ok());
}

#[tokio::test]
async fn manifest_version_must_be_semver() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let mut m = manifest("registrar");
    m.version = "one".to_string();
    let err = model.create_manifest(m).await.unwrap_err();
    assert!(matches!(err, ModelError::Invalid(_)), "{err}");
}

#[tokio::test]
async fn zone_params_force_owner_and_brand() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let app = model.create_application(application("sdc")).await.unwrap();
    let svc = model
        .create_service(service(&app, "cnapi", ServiceType::Vm))
        .await
        .unwrap();
    let mut inst = instance(&svc);
    inst.exists = true;
    let inst = model.create_instance(inst, Default::default()).await.unwrap();

    let params = model.get_instance_payload(&inst.uuid).await.unwrap();
    assert_eq!(params["owner_uuid"], app.owner_uuid.as_str());
    assert_eq!(params["brand"], "joyent-minimal");
    assert_eq!(params["uuid"], inst.uuid.as_str());
}

#[tokio::test]
async fn instance_params_take_precedence() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let mut app = application("sdc");
    app.params = Some(attrs(json!({"dns": "x"})));
    let app = model.create_application(app).await.unwrap();
    let svc = model
        .create_service(service(&app, "binder", ServiceType::Vm))
        .await
        .unwrap();
    let mut inst = instance(&svc);
    inst.exists = true;
    inst.params = Some(attrs(json!({"dns": "y"})));
    let inst = model.create_instance(inst, Default::default()).await.unwrap();

    let params = model.generate_zone_params(&inst.uuid).await.unwrap();
    assert_eq!(params["dns"], "y");
}

#[tokio::test]
async fn zone_config_resolves_manifests() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let m = model.create_manifest(manifest("registrar")).await.unwrap();
    let mut app = application("sdc");
    app.metadata = Some(attrs(json!({"dns": "10.0.0.1", "user-script": "#!/bin/sh"})));
    app.manifests = Some([("registrar".to_string(), m.uuid.clone())].into());
    let app = model.create_application(app).await.unwrap();
    let svc = model
        .create_service(service(&app, "sapi", ServiceType::Agent))
        .await
        .unwrap();
    let inst = model
        .create_instance(instance(&svc), Default::default())
        .await
        .unwrap();

    let config = model.get_config(&inst.uuid).await.unwrap();
    assert_eq!(config.instance, inst.uuid);
    assert_eq!(config.metadata["dns"], "10.0.0.1");
    assert_eq!(config.metadata["SERVICE_NAME"], "sapi");
    assert!(!config.metadata.contains_key("user-script"));
    assert_eq!(config.manifests, vec![m]);

    // Agents have no VM to provision.
    assert!(model.get_instance_payload(&inst.uuid).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_filters_by_indexed_field() {
    let dir = tempfile::tempdir().unwrap();
    let model = proto_model(&dir).await;
    let a1 = model.create_application(application("sdc")).await.unwrap();
    let a2 = model.create_application(application("manta")).await.unwrap();
    for name in ["cnapi", "vmapi"] {
        model
            .create_service(service(&a1, name, ServiceType::Vm))
            .await
            .unwrap();
    }
    model
        .create_service(service(&a2, "storage", ServiceType::Vm))
        .await
        .unwrap();

    let services = model
        .list_services(
            &Filters::new().eq("application_uuid", a1.uuid.as_str()),
            &ReadOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(services.len(), 2);
    assert!(services.iter().all(|s| s.application_uuid == a1.uuid));
}

/// A full-mode model whose Moray store also has a master datacenter
/// connection.
async fn model_with_master(dir: &tempfile::TempDir) -> (Arc<MemoryMoray>, Arc<MemoryMoray>, Model) {
    let local = Arc::new(MemoryMoray::new());
    let master = Arc::new(MemoryMoray::new());
    let store = Arc::new(MorayStore::new(
        local.clone(),
        Some(master.clone()),
        MorayStoreConfig::default(),
    ));
    let model = Model::new(
        test_config(),
        local_store(dir),
        Arc::new(FileProtoMarker::new(dir.path().join("proto_mode"))),
    )
    .with_full_mode(store, Arc::new(FakeCompute::default()));
    model.init().await.unwrap();
    (local, master, model)
}

#[tokio::test]
async fn master_objects_are_readable_after_create_and_update() {
    let dir = tempfile::tempdir().unwrap();
    let (local, master, model) = model_with_master(&dir).await;

    let mut app = application("sdc");
    app.master = Some(true);
    let app = model.create_application(app).await.unwrap();
    assert_eq!(master.object_count("sapi_applications").await, 1);
    assert_eq!(local.object_count("sapi_applications").await, 0);

    let plain = ReadOptions::default();
    let with_master = ReadOptions {
        include_master: true,
    };
    assert!(model
        .get_application(&app.uuid, &plain)
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(model.get_application(&app.uuid, &with_master).await.unwrap(), app);

    let updated = model
        .update_application(&app.uuid, &attrs(json!({"params": {"dns": "x"}})), ChangeAction::Update)
        .await
        .unwrap();
    assert_eq!(updated.params.unwrap()["dns"], "x");
    assert_eq!(master.object_count("sapi_applications").await, 1);
    assert_eq!(local.object_count("sapi_applications").await, 0);

    // Children of a master application resolve their parent there.
    let svc = model
        .create_service(service(&app, "cnapi", ServiceType::Vm))
        .await
        .unwrap();
    assert_eq!(local.object_count("sapi_services").await, 1);
    assert_eq!(svc.application_uuid, app.uuid);

    model.delete_application(&app.uuid).await.unwrap();
    assert_eq!(master.object_count("sapi_applications").await, 0);
}
