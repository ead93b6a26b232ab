//! In-memory collaborators for reconciler tests

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use pdcsi_common::config::{CharmConfig, TrustChannel, TrustError};
use pdcsi_common::Error;
use pdcsi_manifests::{ClusterApi, Collector, ManifestSet, ResourceRef};
use pdcsi_relations::relation::databag;
use pdcsi_relations::{
    CertificatesRequires, InstanceIdentity, IntegratorRequires, KubeControlRequires,
    KubeconfigTarget, MemoryRelationChannel, MetadataClient, RelationChannel,
};

use crate::reconciler::{Context, Paths, Reconciler, UnitInfo};
use crate::record::{FileStateStore, ReconciliationRecord, StateStore};
use crate::status::{MemoryStatusSink, UnitStatus};
use crate::trigger::Trigger;

pub const UNIT: &str = "gcp-k8s-storage/0";
pub const INSTANCE: &str = "juju-a1b2c3-0";
pub const SA_JSON: &str = r#"{"type": "service_account", "project_id": "demo"}"#;
pub const CA: &str = include_str!("../../pdcsi-relations/testdata/ca.crt");
pub const REGISTRY: &str = "rocks.canonical.com/cdk";

pub fn charm_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Cluster holding applied objects in memory
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

struct ClusterState {
    objects: BTreeMap<ResourceRef, Value>,
    apply_calls: usize,
    delete_calls: usize,
    apply_failures: VecDeque<fn() -> Error>,
    delete_failures: VecDeque<fn() -> Error>,
    deny_deletes: bool,
    workloads_ready: bool,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState {
                objects: BTreeMap::new(),
                apply_calls: 0,
                delete_calls: 0,
                apply_failures: VecDeque::new(),
                delete_failures: VecDeque::new(),
                deny_deletes: false,
                workloads_ready: true,
            }),
        }
    }

    pub fn fail_next_applies(&self, count: usize, error: fn() -> Error) {
        self.state.lock().apply_failures.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_next_deletes(&self, count: usize, error: fn() -> Error) {
        self.state.lock().delete_failures.extend(std::iter::repeat(error).take(count));
    }

    pub fn deny_deletes(&self) {
        self.state.lock().deny_deletes = true;
    }

    pub fn set_workloads_ready(&self, ready: bool) {
        self.state.lock().workloads_ready = ready;
    }

    pub fn apply_calls(&self) -> usize {
        self.state.lock().apply_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.state.lock().delete_calls
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn insert(&self, obj: Value) {
        let reference = ResourceRef::from_value(&obj).unwrap();
        self.state.lock().objects.insert(reference, obj);
    }

    pub fn remove(&self, kind: &str, name: &str) {
        self.state
            .lock()
            .objects
            .retain(|r, _| !(r.kind == kind && r.name == name));
    }

    pub fn container_image(&self, kind: &str, name: &str) -> Option<String> {
        let state = self.state.lock();
        let obj = state
            .objects
            .iter()
            .find(|(r, _)| r.kind == kind && r.name == name)
            .map(|(_, obj)| obj)?;
        obj.pointer("/spec/template/spec/containers/0/image")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn with_status(obj: &Value, ready: bool) -> Value {
        let mut obj = obj.clone();
        match obj["kind"].as_str() {
            Some("Deployment") => {
                let replicas = obj.pointer("/spec/replicas").and_then(Value::as_i64).unwrap_or(1);
                obj["status"] = json!({"readyReplicas": if ready { replicas } else { 0 }});
            }
            Some("DaemonSet") => {
                obj["status"] =
                    json!({"numberReady": if ready { 3 } else { 1 }, "desiredNumberScheduled": 3});
            }
            _ => {}
        }
        obj
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(&self, obj: &Value) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.apply_calls += 1;
        if let Some(error) = state.apply_failures.pop_front() {
            return Err(error());
        }
        let reference = ResourceRef::from_value(obj)?;
        state.objects.insert(reference, obj.clone());
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.delete_calls += 1;
        if let Some(error) = state.delete_failures.pop_front() {
            return Err(error());
        }
        if state.deny_deletes {
            return Err(Error::Unauthorized {
                context: "delete".into(),
                message: format!("{} is forbidden", resource),
            });
        }
        match state.objects.remove(resource) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound {
                kind: resource.kind.clone(),
                name: resource.name.clone(),
            }),
        }
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>, Error> {
        let state = self.state.lock();
        Ok(state
            .objects
            .get(resource)
            .map(|obj| Self::with_status(obj, state.workloads_ready)))
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, Error> {
        let (key, value) = label_selector.split_once('=').unwrap_or((label_selector, ""));
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(r, _)| r.api_version == api_version && r.kind == kind)
            .filter(|(_, obj)| obj["metadata"]["labels"][key] == value)
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

/// Metadata server answering with a fixed identity
#[derive(Default)]
pub struct FakeMetadata {
    calls: AtomicUsize,
}

impl FakeMetadata {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataClient for FakeMetadata {
    async fn identity(&self) -> Result<InstanceIdentity, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(InstanceIdentity {
            instance: INSTANCE.into(),
            zone: "us-east1-b".into(),
        })
    }
}

/// Behaviour of the operator trust channel
#[derive(Clone, Debug)]
pub enum Trust {
    NotAvailable,
    Grants(String),
    Broken,
}

struct FakeTrust(Trust);

#[async_trait]
impl TrustChannel for FakeTrust {
    async fn credential(&self) -> Result<String, TrustError> {
        match &self.0 {
            Trust::NotAvailable => Err(TrustError::NotAvailable),
            Trust::Grants(raw) => Ok(raw.clone()),
            Trust::Broken => Err(TrustError::Failed("credential-get crashed".into())),
        }
    }
}

/// One unit with its relations, cluster and persisted record.
///
/// Every `run` is a fresh invocation: the record is loaded, a new context
/// is built from the current inputs and the record is saved at the end.
pub struct Harness {
    _dir: tempfile::TempDir,
    pub paths: Paths,
    pub relations: Arc<MemoryRelationChannel>,
    pub cluster: Arc<FakeCluster>,
    pub status: Arc<MemoryStatusSink>,
    pub metadata: Arc<FakeMetadata>,
    store: FileStateStore,
    options: Mutex<BTreeMap<String, String>>,
    trust: Mutex<Trust>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let target = |user: &str| KubeconfigTarget {
            path: dir.path().join(user).join(".kube/config"),
            user: user.into(),
            owner: None,
        };
        let paths = Paths {
            ca_cert: dir.path().join("srv/kubernetes/ca.crt"),
            kubeconfigs: vec![target("root"), target("ubuntu")],
        };
        let store = FileStateStore::new(dir.path().join("state/record.json"));
        Self {
            paths,
            store,
            _dir: dir,
            relations: Arc::new(MemoryRelationChannel::new()),
            cluster: Arc::new(FakeCluster::new()),
            status: Arc::new(MemoryStatusSink::new()),
            metadata: Arc::new(FakeMetadata::default()),
            options: Mutex::new(BTreeMap::new()),
            trust: Mutex::new(Trust::NotAvailable),
        }
    }

    /// All relations complete
    pub fn ready() -> Self {
        let h = Self::new();
        h.complete_broker();
        h.provide_certificates();
        h.provide_control_plane(false);
        h
    }

    pub fn set_option(&self, key: &str, value: &str) {
        self.options.lock().insert(key.into(), value.into());
    }

    pub fn set_trust(&self, trust: Trust) {
        *self.trust.lock() = trust;
    }

    pub fn context(&self, cached: Option<InstanceIdentity>) -> Context {
        let relations: Arc<dyn RelationChannel> = self.relations.clone();
        Context {
            unit: UnitInfo {
                unit: UNIT.into(),
                model_uuid: "cafef00d-0000-4000-8000-000000000000".into(),
            },
            paths: self.paths.clone(),
            config: CharmConfig::new(
                self.options.lock().clone(),
                Box::new(FakeTrust(self.trust.lock().clone())),
            ),
            integrator: IntegratorRequires::new(relations.clone(), self.metadata.clone(), cached),
            certificates: CertificatesRequires::new(relations.clone()),
            kube_control: KubeControlRequires::new(relations),
            collector: Collector::new(vec![ManifestSet::gce_pd_csi_driver(
                "gcp-k8s-storage",
                &charm_dir(),
            )]),
            cluster: self.cluster.clone(),
            status: self.status.clone(),
        }
    }

    pub async fn try_run(&self, trigger: Trigger) -> Result<(), Error> {
        let record = self.store.load()?;
        let reconciler = Reconciler::new(self.context(record.identity.clone()));
        crate::dispatch(&reconciler, &self.store, record, trigger).await
    }

    pub async fn run(&self, name: &str) {
        self.try_run(Trigger::new(name)).await.unwrap();
    }

    pub fn record(&self) -> ReconciliationRecord {
        self.store.load().unwrap()
    }

    pub fn assert_unit(&self, expected: UnitStatus) {
        assert_eq!(self.status.unit(), Some(expected));
    }

    /// Objects currently held by the cluster
    pub fn rendered_count(&self) -> usize {
        self.cluster.object_count()
    }

    /// Answer the latest capability request with `credentials`
    pub fn answer_broker(&self, credentials: &str) {
        const ENDPOINT: &str = "gcp-integration";
        self.relations.join(ENDPOINT);
        let nonce = match self.relations.local(ENDPOINT).get("requested") {
            Some(nonce) => nonce.clone(),
            None => {
                self.relations
                    .publish(ENDPOINT, databag([("requested", "h4rn3ss0")]))
                    .unwrap();
                "h4rn3ss0".to_string()
            }
        };
        let completed = json!({ INSTANCE: nonce }).to_string();
        self.relations.set_remote(
            ENDPOINT,
            "gcp-integrator/0",
            databag([("completed", completed.as_str()), ("credentials", credentials)]),
        );
    }

    pub fn complete_broker(&self) {
        self.answer_broker(SA_JSON);
    }

    pub fn rotate_broker_credentials(&self, credentials: &str) {
        self.answer_broker(credentials);
    }

    pub fn provide_certificates(&self) {
        self.relations
            .set_remote("certificates", "easyrsa/0", databag([("ca", CA)]));
    }

    pub fn provide_control_plane(&self, with_ca: bool) {
        self.provide_control_plane_for(UNIT, with_ca);
    }

    pub fn provide_control_plane_for(&self, unit: &str, with_ca: bool) {
        let creds = json!({
            unit: {
                "client_token": "admin::token",
                "kubelet_token": "kubelet::token",
                "proxy_token": "proxy::token",
                "scope": unit,
            }
        })
        .to_string();
        let mut bag = databag([
            ("api-endpoints", r#"["https://10.0.0.1:6443"]"#),
            ("creds", creds.as_str()),
            ("registry-location", REGISTRY),
        ]);
        if with_ca {
            bag.insert("ca-certificate".into(), CA.into());
        }
        self.relations
            .set_remote("kube-control", "kubernetes-control-plane/0", bag);
    }
}
