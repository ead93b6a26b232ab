//! Kubeconfig rendering for the cluster credentials from kube-control

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use pdcsi_common::Error;

const CLUSTER_NAME: &str = "juju-cluster";
const CONTEXT_NAME: &str = "juju-context";

/// Kubeconfig structure
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    pub certificate_authority_data: String,
}

/// User entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Serialize, Deserialize)]
pub struct UserConfig {
    /// Bearer token
    pub token: String,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig").field("token", &"<redacted>").finish()
    }
}

/// Context entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// Where a kubeconfig is written and who owns it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigTarget {
    /// Destination path
    pub path: PathBuf,
    /// Name of the user entry inside the kubeconfig
    pub user: String,
    /// File owner as (uid, gid); left unchanged when `None`
    pub owner: Option<(u32, u32)>,
}

impl KubeconfigTarget {
    /// Target for root at `/root/.kube/config`
    pub fn root() -> Self {
        Self {
            path: PathBuf::from("/root/.kube/config"),
            user: "root".into(),
            owner: Some((0, 0)),
        }
    }

    /// Target for the default login user at `/home/ubuntu/.kube/config`
    pub fn ubuntu() -> Self {
        Self {
            path: PathBuf::from("/home/ubuntu/.kube/config"),
            user: "ubuntu".into(),
            owner: Some((1000, 1000)),
        }
    }
}

impl Kubeconfig {
    /// Single-context kubeconfig authenticating with a bearer token
    pub fn with_token(server: &str, ca_pem: &str, user: &str, token: &str) -> Self {
        Self {
            api_version: "v1".into(),
            kind: "Config".into(),
            clusters: vec![NamedCluster {
                name: CLUSTER_NAME.into(),
                cluster: ClusterConfig {
                    server: server.to_string(),
                    certificate_authority_data: STANDARD.encode(ca_pem.as_bytes()),
                },
            }],
            users: vec![NamedUser {
                name: user.to_string(),
                user: UserConfig {
                    token: token.to_string(),
                },
            }],
            contexts: vec![NamedContext {
                name: CONTEXT_NAME.into(),
                context: ContextConfig {
                    cluster: CLUSTER_NAME.into(),
                    user: user.to_string(),
                },
            }],
            current_context: CONTEXT_NAME.into(),
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
    }

    /// Write to `target` with mode 0600 and the target's ownership
    pub fn write(&self, target: &KubeconfigTarget) -> Result<(), Error> {
        let yaml = self.to_yaml()?;
        pdcsi_common::fs::write_atomic(&target.path, yaml.as_bytes(), Some(0o600))?;
        if let Some((uid, gid)) = target.owner {
            std::os::unix::fs::chown(&target.path, Some(uid), Some(gid))
                .map_err(|e| Error::io(&target.path, e))?;
        }
        info!(path = %target.path.display(), user = %target.user, "wrote kubeconfig");
        Ok(())
    }
}
