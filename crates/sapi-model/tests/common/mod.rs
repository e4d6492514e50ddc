//! Shared fixtures and test doubles for the model integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sapi_core::{Application, Attributes, Bucket, Instance, Manifest, Service, ServiceType};
use sapi_model::{
    CommandRunner, ComputeApi, CreateVmOptions, FileProtoMarker, FullModeBackends, Job, JobExecution, Model,
    ModelConfig, ProtoMarker, Vm,
};
use sapi_store::{
    Filters, LocalStore, LocalStoreConfig, MemoryMoray, MorayStore, MorayStoreConfig,
    ObjectStore, PutOptions, ReadOptions, StoreError, StoreResult, StoredObject,
};
use serde_json::{Value, json};
use tokio::sync::Notify;

pub fn test_config() -> ModelConfig {
    ModelConfig {
        update_retries: 3,
        update_backoff: Duration::from_millis(5),
        job_poll_interval: Duration::from_millis(1),
        job_poll_attempts: 5,
        refresh_interval: Duration::from_secs(3600),
    }
}

pub fn attrs(v: Value) -> Attributes {
    match v {
        Value::Object(m) => m,
        other => panic!("not an object: {other}"),
    }
}

pub fn local_store(dir: &tempfile::TempDir) -> Arc<LocalStore> {
    Arc::new(LocalStore::new(LocalStoreConfig::new(dir.path().join("store"))))
}

pub async fn proto_model(dir: &tempfile::TempDir) -> Model {
    let marker = Arc::new(FileProtoMarker::new(dir.path().join("proto_mode")));
    marker.set().await.unwrap();
    let model = Model::new(test_config(), local_store(dir), marker);
    model.init().await.unwrap();
    model
}

pub fn moray_store(moray: &Arc<MemoryMoray>) -> Arc<MorayStore> {
    Arc::new(MorayStore::new(
        moray.clone(),
        None,
        MorayStoreConfig::default(),
    ))
}

/// A model already in full mode on Moray, with the given compute double.
pub async fn full_model(
    dir: &tempfile::TempDir,
    compute: Arc<FakeCompute>,
    runner: Arc<FakeRunner>,
) -> (Arc<MemoryMoray>, Model) {
    let moray = Arc::new(MemoryMoray::new());
    let model = Model::new(
        test_config(),
        local_store(dir),
        Arc::new(FileProtoMarker::new(dir.path().join("proto_mode"))),
    )
    .with_full_mode(moray_store(&moray), compute)
    .with_commands(runner);
    model.init().await.unwrap();
    (moray, model)
}

pub fn application(name: &str) -> Application {
    Application {
        name: name.to_string(),
        owner_uuid: "930896af-bf8c-48d4-885c-6573a94b1853".to_string(),
        ..Default::default()
    }
}

pub fn service(app: &Application, name: &str, kind: ServiceType) -> Service {
    Service {
        name: name.to_string(),
        application_uuid: app.uuid.clone(),
        kind,
        ..Default::default()
    }
}

pub fn instance(svc: &Service) -> Instance {
    Instance {
        service_uuid: svc.uuid.clone(),
        ..Default::default()
    }
}

pub fn manifest(name: &str) -> Manifest {
    Manifest {
        uuid: String::new(),
        name: name.to_string(),
        path: format!("/opt/smartdc/{name}/etc/config.json"),
        template: json!("{\"dns\": \"{{dns}}\"}"),
        post_cmd: None,
        version: "1.0.0".to_string(),
        master: None,
    }
}

// -- Compute double -----------------------------------------------------------

#[derive(Default)]
pub struct FakeCompute {
    pub created: Mutex<Vec<Attributes>>,
    pub request_ids: Mutex<Vec<Option<String>>>,
    pub deleted: Mutex<Vec<String>>,
    pub reprovisioned: Mutex<Vec<(String, String)>>,
    vms: Mutex<HashMap<String, Vm>>,
    jobs: AtomicUsize,
    /// Jobs settle as failed while set.
    pub fail_jobs: AtomicBool,
    /// Jobs never leave the pending state while set.
    pub hang_jobs: AtomicBool,
}

impl FakeCompute {
    pub fn has_vm(&self, uuid: &str) -> bool {
        self.vms.lock().unwrap().contains_key(uuid)
    }

    pub fn add_vm(&self, uuid: &str, server_uuid: &str) {
        self.vms.lock().unwrap().insert(
            uuid.to_string(),
            Vm {
                uuid: uuid.to_string(),
                server_uuid: Some(server_uuid.to_string()),
                state: "running".to_string(),
            },
        );
    }

    fn next_job(&self) -> String {
        format!("job-{}", self.jobs.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn create_vm(&self, params: &Attributes, opts: &CreateVmOptions) -> anyhow::Result<String> {
        self.created.lock().unwrap().push(params.clone());
        self.request_ids.lock().unwrap().push(opts.request_id.clone());
        if let Some(uuid) = params.get("uuid").and_then(Value::as_str) {
            self.add_vm(uuid, "cn-0001");
        }
        Ok(self.next_job())
    }

    async fn get_vm(&self, uuid: &str) -> anyhow::Result<Option<Vm>> {
        Ok(self.vms.lock().unwrap().get(uuid).cloned())
    }

    async fn delete_vm(&self, uuid: &str) -> anyhow::Result<String> {
        self.vms.lock().unwrap().remove(uuid);
        self.deleted.lock().unwrap().push(uuid.to_string());
        Ok(self.next_job())
    }

    async fn reprovision_vm(&self, uuid: &str, image_uuid: &str) -> anyhow::Result<String> {
        self.reprovisioned
            .lock()
            .unwrap()
            .push((uuid.to_string(), image_uuid.to_string()));
        Ok(self.next_job())
    }

    async fn get_job(&self, uuid: &str) -> anyhow::Result<Job> {
        let execution = if self.hang_jobs.load(Ordering::SeqCst) {
            JobExecution::Pending
        } else if self.fail_jobs.load(Ordering::SeqCst) {
            JobExecution::Failed
        } else {
            JobExecution::Succeeded
        };
        Ok(Job {
            uuid: uuid.to_string(),
            execution,
            error: (execution == JobExecution::Failed).then(|| "no capacity".to_string()),
        })
    }
}

#[derive(Default)]
pub struct FakeRunner {
    pub runs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run_command(&self, server_uuid: &str, script: &str) -> anyhow::Result<()> {
        self.runs
            .lock()
            .unwrap()
            .push((server_uuid.to_string(), script.to_string()));
        Ok(())
    }
}

// -- Full-mode backends -------------------------------------------------------

pub struct FakeBackends {
    pub moray: Arc<MemoryMoray>,
    pub compute: Arc<FakeCompute>,
    pub connects: AtomicUsize,
    pub fail_compute: AtomicBool,
    /// Handed out instead of a plain Moray store when set.
    pub gated: Option<Arc<GatedStore>>,
}

impl FakeBackends {
    pub fn new() -> Self {
        Self {
            moray: Arc::new(MemoryMoray::new()),
            compute: Arc::new(FakeCompute::default()),
            connects: AtomicUsize::new(0),
            fail_compute: AtomicBool::new(false),
            gated: None,
        }
    }

    /// Backends whose Moray store is wrapped in a [`GatedStore`].
    pub fn gated(gate: Gate) -> (Self, Arc<GatedStore>) {
        let mut backends = Self::new();
        let store = Arc::new(GatedStore::new(moray_store(&backends.moray), gate));
        backends.gated = Some(store.clone());
        (backends, store)
    }
}

#[async_trait]
impl FullModeBackends for FakeBackends {
    async fn connect_compute(&self) -> anyhow::Result<Arc<dyn ComputeApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_compute.load(Ordering::SeqCst) {
            anyhow::bail!("vmapi: connection refused");
        }
        Ok(self.compute.clone())
    }

    async fn connect_moray(&self) -> StoreResult<Arc<dyn ObjectStore>> {
        match &self.gated {
            Some(gated) => Ok(gated.clone()),
            None => Ok(moray_store(&self.moray)),
        }
    }
}

/// Marker whose removal always fails.
pub struct StuckMarker;

#[async_trait]
impl ProtoMarker for StuckMarker {
    async fn is_set(&self) -> bool {
        true
    }

    async fn set(&self) -> io::Result<()> {
        Ok(())
    }

    async fn clear(&self) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"))
    }
}

// -- Gated Moray store -------------------------------------------------------

/// What a [`GatedStore`] does to the writes and inits passing through it.
/// Counts are 1-based.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gate {
    /// Hold this put until [`GatedStore::release`] is called.
    pub pause_put: Option<usize>,
    /// Fail this put and every later one.
    pub fail_put: Option<usize>,
    /// Fail this init and every later one.
    pub fail_init: Option<usize>,
}

/// Wraps a store to pause or fail chosen operations.
pub struct GatedStore {
    inner: Arc<dyn ObjectStore>,
    gate: Mutex<Gate>,
    puts: AtomicUsize,
    inits: AtomicUsize,
    paused: Notify,
    released: Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<dyn ObjectStore>, gate: Gate) -> Self {
        Self {
            inner,
            gate: Mutex::new(gate),
            puts: AtomicUsize::new(0),
            inits: AtomicUsize::new(0),
            paused: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Resolves once the paused put is being held.
    pub async fn wait_paused(&self) {
        self.paused.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    /// Let every later operation through.
    pub fn open(&self) {
        *self.gate.lock().unwrap() = Gate::default();
    }

    fn gate(&self) -> Gate {
        *self.gate.lock().unwrap()
    }
}

fn reached(limit: Option<usize>, n: usize) -> bool {
    limit.is_some_and(|limit| n >= limit)
}

#[async_trait]
impl ObjectStore for GatedStore {
    fn kind(&self) -> &'static str {
        "gated"
    }

    async fn init(&self) -> StoreResult<()> {
        let n = self.inits.fetch_add(1, Ordering::SeqCst) + 1;
        if reached(self.gate().fail_init, n) {
            return Err(StoreError::Unavailable(format!("init {n} refused")));
        }
        self.inner.init().await
    }

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()> {
        let n = self.puts.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = self.gate();
        if reached(gate.fail_put, n) {
            return Err(StoreError::Unavailable(format!("put {n} of {bucket}/{uuid} refused")));
        }
        if gate.pause_put == Some(n) {
            self.paused.notify_one();
            self.released.notified().await;
        }
        self.inner.put_object(bucket, uuid, value, opts).await
    }

    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>> {
        self.inner.get_object(bucket, uuid, opts).await
    }

    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()> {
        self.inner.del_object(bucket, uuid).await
    }

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>> {
        self.inner.list_object_values(bucket, filters, opts).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

// -- Conflict-injecting store -------------------------------------------------

/// Wraps a store and fails the next `n` conditional writes with an etag
/// conflict.
pub struct ConflictingStore {
    inner: Arc<dyn ObjectStore>,
    conflicts: AtomicU32,
    pub conditional_puts: AtomicU32,
}

impl ConflictingStore {
    pub fn new(inner: Arc<dyn ObjectStore>, conflicts: u32) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(conflicts),
            conditional_puts: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for ConflictingStore {
    fn kind(&self) -> &'static str {
        "conflicting"
    }

    async fn init(&self) -> StoreResult<()> {
        self.inner.init().await
    }

    async fn put_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        value: &Value,
        opts: &PutOptions,
    ) -> StoreResult<()> {
        if let Some(expected) = &opts.etag {
            self.conditional_puts.fetch_add(1, Ordering::SeqCst);
            let injected = self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(StoreError::EtagConflict {
                    bucket: bucket.to_string(),
                    key: uuid.to_string(),
                    expected: expected.clone(),
                    found: "concurrent".to_string(),
                });
            }
        }
        self.inner.put_object(bucket, uuid, value, opts).await
    }

    async fn get_object(
        &self,
        bucket: Bucket,
        uuid: &str,
        opts: &ReadOptions,
    ) -> StoreResult<Option<StoredObject>> {
        self.inner.get_object(bucket, uuid, opts).await
    }

    async fn del_object(&self, bucket: Bucket, uuid: &str) -> StoreResult<()> {
        self.inner.del_object(bucket, uuid).await
    }

    async fn list_object_values(
        &self,
        bucket: Bucket,
        filters: &Filters,
        opts: &ReadOptions,
    ) -> StoreResult<Vec<Value>> {
        self.inner.list_object_values(bucket, filters, opts).await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.inner.ping().await
    }

    async fn close(&self) {}
}
