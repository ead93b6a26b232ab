//! Requires side of the `gcp-integration` credential broker relation
//!
//! The unit publishes capability requests, each tagged with a fresh random
//! nonce in `requested`. The broker answers by publishing `completed`, a JSON
//! map from instance name to the nonce it last served, plus `credentials`.
//! A request is satisfied only when the broker echoes the current nonce for
//! this instance; an older nonce means the broker has not caught up yet.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use pdcsi_common::{Credential, Error, Readiness};

use crate::metadata::{InstanceIdentity, MetadataClient};
use crate::relation::{Databag, RelationChannel};

/// Relation endpoint name
pub const ENDPOINT: &str = "gcp-integration";

const NONCE_LEN: usize = 8;

/// Capability flag for managing persistent disks
pub const BLOCK_STORAGE_MANAGEMENT: &str = "enable-block-storage-management";

/// Capability flag for reading instance details
pub const INSTANCE_INSPECTION: &str = "enable-instance-inspection";

/// Broker response, validated
struct BrokerData {
    completed: BTreeMap<String, String>,
    credentials: Credential,
}

impl BrokerData {
    fn parse(bag: &Databag) -> Result<Self, Error> {
        let completed = bag
            .get("completed")
            .ok_or_else(|| Error::validation_for_field("completed", "field required"))?;
        let completed: BTreeMap<String, String> = serde_json::from_str(completed)
            .map_err(|e| Error::validation_for_field("completed", e.to_string()))?;
        let credentials = bag
            .get("credentials")
            .ok_or_else(|| Error::validation_for_field("credentials", "field required"))?;
        let credentials = Credential::from_json(credentials)?;
        Ok(Self {
            completed,
            credentials,
        })
    }
}

/// Client for the credential broker
pub struct IntegratorRequires {
    channel: Arc<dyn RelationChannel>,
    metadata: Arc<dyn MetadataClient>,
    identity: OnceCell<InstanceIdentity>,
}

impl IntegratorRequires {
    /// Create a client; `cached` is the identity resolved by an earlier run
    pub fn new(
        channel: Arc<dyn RelationChannel>,
        metadata: Arc<dyn MetadataClient>,
        cached: Option<InstanceIdentity>,
    ) -> Self {
        Self {
            channel,
            metadata,
            identity: OnceCell::new_with(cached),
        }
    }

    /// This unit's instance identity, fetched once and then cached
    pub async fn identity(&self) -> Result<&InstanceIdentity, Error> {
        self.identity
            .get_or_try_init(|| async {
                let identity = self.metadata.identity().await?;
                info!(instance = %identity.instance, zone = %identity.zone, "resolved instance identity");
                Ok::<_, Error>(identity)
            })
            .await
    }

    /// Identity resolved so far, for persisting across runs
    pub fn cached_identity(&self) -> Option<InstanceIdentity> {
        self.identity.get().cloned()
    }

    /// Introduce this unit to a newly joined broker
    pub async fn joined(&self, app_name: &str, model_uuid: &str) -> Result<(), Error> {
        let identity = self.identity().await?.clone();
        let mut bag = Databag::new();
        bag.insert("charm".into(), app_name.to_string());
        bag.insert("instance".into(), identity.instance);
        bag.insert("zone".into(), identity.zone);
        bag.insert("model-uuid".into(), model_uuid.to_string());
        self.channel.publish(ENDPOINT, bag)
    }

    /// Publish a capability request with a fresh nonce, returning the nonce
    pub fn request(&self, keyvals: BTreeMap<String, Value>) -> Result<String, Error> {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();

        let mut bag = Databag::new();
        for (key, value) in keyvals {
            bag.insert(key, serde_json::to_string(&value)?);
        }
        bag.insert("requested".into(), nonce.clone());
        debug!(nonce = %nonce, "requesting broker capabilities");
        self.channel.publish(ENDPOINT, bag)?;
        Ok(nonce)
    }

    /// Request the ability to manage block storage
    pub fn enable_block_storage_management(&self) -> Result<String, Error> {
        self.request(BTreeMap::from([(
            BLOCK_STORAGE_MANAGEMENT.to_string(),
            Value::Bool(true),
        )]))
    }

    /// Request the ability to inspect instances
    pub fn enable_instance_inspection(&self) -> Result<String, Error> {
        self.request(BTreeMap::from([(
            INSTANCE_INSPECTION.to_string(),
            Value::Bool(true),
        )]))
    }

    /// Validated broker data and the nonce we last requested
    fn response(&self) -> Result<Option<(BrokerData, Option<String>)>, Error> {
        let Some(relation) = self.channel.relation(ENDPOINT)? else {
            debug!("{} relation data not yet available", ENDPOINT);
            return Ok(None);
        };
        let Some(bag) = relation.first_unit().filter(|bag| !bag.is_empty()) else {
            debug!("{} relation data not yet available", ENDPOINT);
            return Ok(None);
        };
        match BrokerData::parse(bag) {
            Ok(data) => Ok(Some((data, relation.local.get("requested").cloned()))),
            Err(e) => {
                warn!(error = %e, "{} relation data not yet valid", ENDPOINT);
                Ok(None)
            }
        }
    }

    /// Whether the broker has completed the request for this instance
    pub async fn is_ready(&self) -> Result<bool, Error> {
        let Some((data, requested)) = self.response()? else {
            return Ok(false);
        };
        let instance = &self.identity().await?.instance;
        let completed = data.completed.get(instance);
        info!(
            completed = ?completed,
            requested = ?requested,
            "{} completion check", ENDPOINT
        );
        Ok(match (requested, completed) {
            (Some(requested), Some(completed)) => !requested.is_empty() && *completed == requested,
            _ => false,
        })
    }

    /// Gate verdict; `broken` is set when this relation is being removed
    pub async fn evaluate(&self, broken: bool) -> Result<Readiness, Error> {
        if broken {
            return Ok(Readiness::relation_unready(ENDPOINT, false));
        }
        if self.is_ready().await? {
            return Ok(Readiness::Ready);
        }
        let present = self.channel.relation(ENDPOINT)?.is_some();
        Ok(Readiness::relation_unready(ENDPOINT, present))
    }

    /// Credentials granted by the broker, once the request completed
    pub async fn credentials(&self) -> Result<Option<Credential>, Error> {
        if !self.is_ready().await? {
            return Ok(None);
        }
        Ok(self.response()?.map(|(data, _)| data.credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MockMetadataClient;
    use crate::relation::{databag, MemoryRelationChannel};

    const BROKER_UNIT: &str = "gcp-integrator/0";
    const SA_JSON: &str = r#"{"type": "service_account", "project_id": "demo"}"#;

    fn identity() -> InstanceIdentity {
        InstanceIdentity {
            instance: "juju-a1b2c3-0".into(),
            zone: "us-east1-b".into(),
        }
    }

    fn client(channel: Arc<MemoryRelationChannel>) -> IntegratorRequires {
        let mut metadata = MockMetadataClient::new();
        metadata.expect_identity().times(0..=1).returning(|| Ok(identity()));
        IntegratorRequires::new(channel, Arc::new(metadata), None)
    }

    fn complete(channel: &MemoryRelationChannel, nonce: &str) {
        let completed = serde_json::json!({ "juju-a1b2c3-0": nonce }).to_string();
        channel.set_remote(
            ENDPOINT,
            BROKER_UNIT,
            databag([("completed", completed.as_str()), ("credentials", SA_JSON)]),
        );
    }

    #[tokio::test]
    async fn test_missing_relation_blocks() {
        let channel = Arc::new(MemoryRelationChannel::new());
        let integrator = client(channel);
        assert_eq!(
            integrator.evaluate(false).await.unwrap(),
            Readiness::Blocked("Missing required gcp-integration".into())
        );
    }

    #[tokio::test]
    async fn test_joined_without_response_waits() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel);
        integrator.enable_block_storage_management().unwrap();
        assert_eq!(
            integrator.evaluate(false).await.unwrap(),
            Readiness::Waiting("Waiting for gcp-integration".into())
        );
    }

    #[tokio::test]
    async fn test_broken_relation_is_reported_missing() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel);
        assert_eq!(
            integrator.evaluate(true).await.unwrap(),
            Readiness::Blocked("Missing required gcp-integration".into())
        );
    }

    /// Story: the broker answers a request that has since been superseded
    #[tokio::test]
    async fn story_stale_nonce_is_not_ready() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel.clone());

        let first = integrator.enable_block_storage_management().unwrap();
        let second = integrator.enable_instance_inspection().unwrap();
        assert_ne!(first, second);

        complete(&channel, &first);
        assert!(!integrator.is_ready().await.unwrap());
        assert!(integrator.credentials().await.unwrap().is_none());

        complete(&channel, &second);
        assert!(integrator.is_ready().await.unwrap());
        let credential = integrator.credentials().await.unwrap().unwrap();
        assert_eq!(credential, Credential::from_json(SA_JSON).unwrap());
    }

    #[tokio::test]
    async fn test_completion_for_other_instance_is_not_ready() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel.clone());
        let nonce = integrator.enable_block_storage_management().unwrap();

        let completed = serde_json::json!({ "juju-other-1": nonce }).to_string();
        channel.set_remote(
            ENDPOINT,
            BROKER_UNIT,
            databag([("completed", completed.as_str()), ("credentials", SA_JSON)]),
        );
        assert!(!integrator.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_without_request_is_not_ready() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel.clone());
        complete(&channel, "");
        assert!(!integrator.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_broker_data_is_not_ready() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel.clone());
        integrator.enable_block_storage_management().unwrap();

        channel.set_remote(
            ENDPOINT,
            BROKER_UNIT,
            databag([("completed", "not json"), ("credentials", SA_JSON)]),
        );
        assert_eq!(
            integrator.evaluate(false).await.unwrap(),
            Readiness::Waiting("Waiting for gcp-integration".into())
        );

        channel.set_remote(
            ENDPOINT,
            BROKER_UNIT,
            databag([("completed", "{}"), ("credentials", "not json")]),
        );
        assert!(!integrator.is_ready().await.unwrap());
    }

    #[tokio::test]
    async fn test_request_publishes_json_encoded_flags_and_nonce() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel.clone());

        let nonce = integrator.enable_block_storage_management().unwrap();
        assert_eq!(nonce.len(), 8);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));

        let local = channel.local(ENDPOINT);
        assert_eq!(local.get(BLOCK_STORAGE_MANAGEMENT).map(String::as_str), Some("true"));
        assert_eq!(local.get("requested"), Some(&nonce));
    }

    #[tokio::test]
    async fn test_joined_publishes_identity() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let integrator = client(channel.clone());

        integrator.joined("gcp-k8s-storage", "0f1e2d3c").await.unwrap();

        let local = channel.local(ENDPOINT);
        assert_eq!(local.get("charm").map(String::as_str), Some("gcp-k8s-storage"));
        assert_eq!(local.get("instance").map(String::as_str), Some("juju-a1b2c3-0"));
        assert_eq!(local.get("zone").map(String::as_str), Some("us-east1-b"));
        assert_eq!(local.get("model-uuid").map(String::as_str), Some("0f1e2d3c"));
    }

    #[tokio::test]
    async fn test_cached_identity_skips_metadata_server() {
        let channel = Arc::new(MemoryRelationChannel::new());
        let mut metadata = MockMetadataClient::new();
        metadata.expect_identity().never();
        let integrator = IntegratorRequires::new(channel, Arc::new(metadata), Some(identity()));

        assert_eq!(integrator.identity().await.unwrap(), &identity());
        assert_eq!(integrator.cached_identity(), Some(identity()));
    }

    #[tokio::test]
    async fn test_identity_resolved_once() {
        let channel = Arc::new(MemoryRelationChannel::new());
        let mut metadata = MockMetadataClient::new();
        metadata.expect_identity().times(1).returning(|| Ok(identity()));
        let integrator = IntegratorRequires::new(channel, Arc::new(metadata), None);

        assert!(integrator.cached_identity().is_none());
        integrator.identity().await.unwrap();
        integrator.identity().await.unwrap();
        assert_eq!(integrator.cached_identity(), Some(identity()));
    }
}
