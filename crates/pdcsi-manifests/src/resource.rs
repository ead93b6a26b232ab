//! Identity and ordering of rendered resources

use std::cmp::Ordering;

use kube::discovery::ApiResource;
use serde_json::Value;

use pdcsi_common::Error;

/// Identity of a cluster object
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    /// apiVersion, e.g. `apps/v1`
    pub api_version: String,
    /// Kind, e.g. `Deployment`
    pub kind: String,
    /// Namespace for namespaced objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceRef {
    /// Identity of a JSON object
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let field = |pointer: &str| value.pointer(pointer).and_then(Value::as_str);
        let kind = field("/kind")
            .ok_or_else(|| Error::serialization("resource missing kind"))?
            .to_string();
        let api_version = field("/apiVersion")
            .ok_or_else(|| Error::serialization_for_kind(&kind, "resource missing apiVersion"))?
            .to_string();
        let name = field("/metadata/name")
            .ok_or_else(|| Error::serialization_for_kind(&kind, "resource missing metadata.name"))?
            .to_string();
        let namespace = field("/metadata/namespace").map(str::to_string);
        Ok(Self {
            api_version,
            kind,
            namespace,
            name,
        })
    }

    /// API resource for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(&self.api_version, &self.kind)
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

impl Ord for ResourceRef {
    fn cmp(&self, other: &Self) -> Ordering {
        kind_priority(&self.kind)
            .cmp(&kind_priority(&other.kind))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.namespace.cmp(&other.namespace))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.api_version.cmp(&other.api_version))
    }
}

impl PartialOrd for ResourceRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Apply order for a kind; lower applies first and deletes last.
///
/// Namespaces and identities come before anything that references them,
/// the driver registration and storage class before the workloads that
/// serve them.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "PriorityClass" => 2,
        "ServiceAccount" => 3,
        "ClusterRole" | "Role" => 4,
        "ClusterRoleBinding" | "RoleBinding" => 5,
        "ConfigMap" | "Secret" => 6,
        "CSIDriver" | "StorageClass" => 7,
        "Service" => 8,
        "Deployment" | "DaemonSet" | "StatefulSet" => 9,
        _ => 10,
    }
}

/// Parse apiVersion into (group, version)
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

const KIND_PLURALS: &[(&str, &str)] = &[("endpoints", "endpoints")];

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
