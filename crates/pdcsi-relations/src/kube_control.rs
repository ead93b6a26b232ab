//! Requires side of the `kube-control` relation
//!
//! The control plane publishes API endpoints, per-user credentials keyed by
//! the requesting user, the image registry and (optionally) its CA. This
//! unit asks for credentials by publishing `kubelet_user` and `auth_group`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use pdcsi_common::{Error, Readiness};

use crate::certificates::validate_ca;
use crate::kubeconfig::{Kubeconfig, KubeconfigTarget};
use crate::relation::{Databag, RelationChannel};

/// Relation endpoint name
pub const ENDPOINT: &str = "kube-control";

/// Name used in user-facing messages
const DISPLAY_NAME: &str = "kube-control relation";

/// Credentials issued to one user
#[derive(Clone, Deserialize)]
pub struct UserCredentials {
    /// Token for API access
    pub client_token: String,
    /// Token for the kubelet
    #[serde(default)]
    pub kubelet_token: String,
    /// Token for the proxy
    #[serde(default)]
    pub proxy_token: String,
    /// Scope the tokens were issued for
    #[serde(default)]
    pub scope: String,
}

impl std::fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCredentials")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Control plane data, validated
#[derive(Debug)]
struct ControlPlaneData {
    api_endpoints: Vec<String>,
    creds: BTreeMap<String, UserCredentials>,
    registry_location: Option<String>,
    ca_certificate: Option<String>,
}

impl ControlPlaneData {
    fn parse(bag: &Databag) -> Result<Self, Error> {
        let endpoints = bag
            .get("api-endpoints")
            .ok_or_else(|| Error::validation_for_field("api-endpoints", "field required"))?;
        let api_endpoints: Vec<String> = serde_json::from_str(endpoints)
            .map_err(|e| Error::validation_for_field("api-endpoints", e.to_string()))?;
        if api_endpoints.is_empty() {
            return Err(Error::validation_for_field("api-endpoints", "no endpoints"));
        }
        let creds = bag
            .get("creds")
            .ok_or_else(|| Error::validation_for_field("creds", "field required"))?;
        let creds = serde_json::from_str(creds)
            .map_err(|e| Error::validation_for_field("creds", e.to_string()))?;
        let non_empty = |key: &str| bag.get(key).filter(|v| !v.is_empty()).cloned();
        Ok(Self {
            api_endpoints,
            creds,
            registry_location: non_empty("registry-location"),
            ca_certificate: non_empty("ca-certificate"),
        })
    }
}

/// Client for the control plane
pub struct KubeControlRequires {
    channel: Arc<dyn RelationChannel>,
}

impl KubeControlRequires {
    /// Create a client over `channel`
    pub fn new(channel: Arc<dyn RelationChannel>) -> Self {
        Self { channel }
    }

    fn data(&self) -> Result<Option<ControlPlaneData>, Error> {
        let Some(relation) = self.channel.relation(ENDPOINT)? else {
            return Ok(None);
        };
        let Some(bag) = relation.first_unit().filter(|bag| !bag.is_empty()) else {
            return Ok(None);
        };
        match ControlPlaneData::parse(bag) {
            Ok(data) => Ok(Some(data)),
            Err(e) => {
                warn!(error = %e, "{} relation data not yet valid", ENDPOINT);
                Ok(None)
            }
        }
    }

    /// Ask the control plane for credentials for `user` in `group`
    pub fn set_auth_request(&self, user: &str, group: &str) -> Result<(), Error> {
        let mut bag = Databag::new();
        bag.insert("kubelet_user".into(), user.to_string());
        bag.insert("auth_group".into(), group.to_string());
        debug!(user, group, "requesting cluster credentials");
        self.channel.publish(ENDPOINT, bag)
    }

    /// Whether the control plane has published valid data
    pub fn is_ready(&self) -> Result<bool, Error> {
        Ok(self.data()?.is_some())
    }

    /// Gate verdict; `broken` is set when this relation is being removed
    pub fn evaluate(&self, broken: bool) -> Result<Readiness, Error> {
        if broken {
            return Ok(Readiness::relation_unready(DISPLAY_NAME, false));
        }
        if self.is_ready()? {
            return Ok(Readiness::Ready);
        }
        let present = self.channel.relation(ENDPOINT)?.is_some();
        Ok(Readiness::relation_unready(DISPLAY_NAME, present))
    }

    /// Credentials issued for `user`, if any
    pub fn get_auth_credentials(&self, user: &str) -> Result<Option<UserCredentials>, Error> {
        Ok(self.data()?.and_then(|mut data| data.creds.remove(user)))
    }

    /// CA certificate supplied by the control plane, if valid
    pub fn get_ca_certificate(&self) -> Result<Option<String>, Error> {
        let Some(ca) = self.data()?.and_then(|data| data.ca_certificate) else {
            return Ok(None);
        };
        match validate_ca(&ca) {
            Ok(()) => Ok(Some(ca)),
            Err(e) => {
                warn!(error = %e, "{} relation published an unusable CA", ENDPOINT);
                Ok(None)
            }
        }
    }

    /// Image registry the cluster pulls from
    pub fn get_registry_location(&self) -> Result<Option<String>, Error> {
        Ok(self.data()?.and_then(|data| data.registry_location))
    }

    /// API server URLs
    pub fn get_api_endpoints(&self) -> Result<Vec<String>, Error> {
        Ok(self.data()?.map(|data| data.api_endpoints).unwrap_or_default())
    }

    /// Write a kubeconfig for `target` using the credentials issued to `user`
    pub fn create_kubeconfig(
        &self,
        ca_pem: &str,
        target: &KubeconfigTarget,
        user: &str,
    ) -> Result<(), Error> {
        let data = self
            .data()?
            .ok_or_else(|| Error::internal_with_context("kubeconfig", "kube-control not ready"))?;
        let creds = data.creds.get(user).ok_or_else(|| {
            Error::internal_with_context("kubeconfig", format!("no credentials for {}", user))
        })?;
        let server = data
            .api_endpoints
            .first()
            .ok_or_else(|| Error::internal_with_context("kubeconfig", "no API endpoints"))?;
        Kubeconfig::with_token(server, ca_pem, &target.user, &creds.client_token).write(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relation::{databag, MemoryRelationChannel};

    const CA: &str = include_str!("../testdata/ca.crt");
    const UNIT: &str = "gcp-k8s-storage/0";

    fn control_plane(channel: &MemoryRelationChannel, extra: &[(&str, &str)]) {
        let creds = serde_json::json!({
            UNIT: {
                "client_token": "admin::token",
                "kubelet_token": "kubelet::token",
                "proxy_token": "proxy::token",
                "scope": UNIT,
            }
        })
        .to_string();
        let mut bag = databag([
            ("api-endpoints", r#"["https://10.0.0.1:6443"]"#),
            ("creds", creds.as_str()),
        ]);
        bag.extend(databag(extra.iter().copied()));
        channel.set_remote(ENDPOINT, "kubernetes-control-plane/0", bag);
    }

    #[test]
    fn test_verdicts() {
        let channel = Arc::new(MemoryRelationChannel::new());
        let kube_control = KubeControlRequires::new(channel.clone());

        assert_eq!(
            kube_control.evaluate(false).unwrap(),
            Readiness::Blocked("Missing required kube-control relation".into())
        );
        channel.join(ENDPOINT);
        assert_eq!(
            kube_control.evaluate(false).unwrap(),
            Readiness::Waiting("Waiting for kube-control relation".into())
        );
        control_plane(&channel, &[]);
        assert_eq!(kube_control.evaluate(false).unwrap(), Readiness::Ready);
        assert_eq!(
            kube_control.evaluate(true).unwrap(),
            Readiness::Blocked("Missing required kube-control relation".into())
        );
    }

    #[test]
    fn test_auth_request_is_published() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.join(ENDPOINT);
        let kube_control = KubeControlRequires::new(channel.clone());

        kube_control.set_auth_request(UNIT, "system:masters").unwrap();

        let local = channel.local(ENDPOINT);
        assert_eq!(local.get("kubelet_user").map(String::as_str), Some(UNIT));
        assert_eq!(local.get("auth_group").map(String::as_str), Some("system:masters"));
    }

    #[test]
    fn test_credentials_are_scoped_to_the_user() {
        let channel = Arc::new(MemoryRelationChannel::new());
        control_plane(&channel, &[]);
        let kube_control = KubeControlRequires::new(channel);

        let creds = kube_control.get_auth_credentials(UNIT).unwrap().unwrap();
        assert_eq!(creds.client_token, "admin::token");
        assert!(kube_control.get_auth_credentials("other/0").unwrap().is_none());
        assert!(!format!("{:?}", creds).contains("admin::token"));
    }

    #[test]
    fn test_optional_fields() {
        let channel = Arc::new(MemoryRelationChannel::new());
        control_plane(&channel, &[]);
        let kube_control = KubeControlRequires::new(channel.clone());
        assert!(kube_control.get_ca_certificate().unwrap().is_none());
        assert!(kube_control.get_registry_location().unwrap().is_none());

        control_plane(
            &channel,
            &[("ca-certificate", CA), ("registry-location", "rocks.canonical.com/cdk")],
        );
        assert_eq!(kube_control.get_ca_certificate().unwrap().as_deref(), Some(CA));
        assert_eq!(
            kube_control.get_registry_location().unwrap().as_deref(),
            Some("rocks.canonical.com/cdk")
        );
        assert_eq!(kube_control.get_api_endpoints().unwrap(), vec!["https://10.0.0.1:6443"]);
    }

    #[test]
    fn test_malformed_data_is_not_ready() {
        let channel = Arc::new(MemoryRelationChannel::new());
        channel.set_remote(
            ENDPOINT,
            "kubernetes-control-plane/0",
            databag([("api-endpoints", "https://not-a-list"), ("creds", "{}")]),
        );
        let kube_control = KubeControlRequires::new(channel);
        assert_eq!(
            kube_control.evaluate(false).unwrap(),
            Readiness::Waiting("Waiting for kube-control relation".into())
        );
    }

    #[test]
    fn test_create_kubeconfig_uses_user_token() {
        let channel = Arc::new(MemoryRelationChannel::new());
        control_plane(&channel, &[]);
        let kube_control = KubeControlRequires::new(channel);

        let dir = tempfile::tempdir().unwrap();
        let target = KubeconfigTarget {
            path: dir.path().join("config"),
            user: "root".into(),
            owner: None,
        };
        kube_control.create_kubeconfig(CA, &target, UNIT).unwrap();

        let written = std::fs::read_to_string(&target.path).unwrap();
        let value = pdcsi_common::yaml::parse_yaml(&written).unwrap();
        assert_eq!(value["users"][0]["user"]["token"], "admin::token");
        assert_eq!(value["clusters"][0]["cluster"]["server"], "https://10.0.0.1:6443");

        assert!(kube_control.create_kubeconfig(CA, &target, "other/0").is_err());
    }
}
