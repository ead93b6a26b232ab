//! Cluster API access for rendered resources

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use pdcsi_common::{Error, FIELD_MANAGER};

use crate::resource::{build_api_resource, ResourceRef};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Operations the manifest set needs from the cluster.
///
/// Implementations classify failures with [`Error::from_kube`] so callers can
/// tell transient unavailability and authorization denials apart.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply an object
    async fn apply(&self, obj: &Value) -> Result<(), Error>;

    /// Delete an object
    async fn delete(&self, resource: &ResourceRef) -> Result<(), Error>;

    /// Fetch an object, `None` if it does not exist
    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>, Error>;

    /// List objects of a kind across namespaces matching a label selector
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, Error>;
}

/// Create a kube client from a kubeconfig file with default timeouts.
///
/// Any failure means the cluster is not reachable yet.
pub async fn create_client(kubeconfig: &Path) -> Result<Client, Error> {
    let unavailable = |what: &str, e: &dyn std::fmt::Display| {
        Error::unavailable("create_client", format!("{}: {}", what, e))
    };
    let kubeconfig = Kubeconfig::read_from(kubeconfig)
        .map_err(|e| unavailable("failed to read kubeconfig", &e))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| unavailable("failed to load kubeconfig", &e))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| unavailable("failed to create client", &e))
}

/// [`ClusterApi`] over kube-rs, connecting on first use
pub struct KubeClusterApi {
    kubeconfig: PathBuf,
    client: OnceCell<Client>,
}

impl KubeClusterApi {
    /// Connect lazily using the kubeconfig at `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, Error> {
        self.client
            .get_or_try_init(|| create_client(&self.kubeconfig))
            .await
    }

    async fn api(&self, resource: &ResourceRef) -> Result<Api<DynamicObject>, Error> {
        let client = self.client().await?.clone();
        let ar = resource.api_resource();
        Ok(match &resource.namespace {
            Some(ns) => Api::namespaced_with(client, ns, &ar),
            None => Api::all_with(client, &ar),
        })
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, obj: &Value) -> Result<(), Error> {
        let resource = ResourceRef::from_value(obj)?;
        let api = self.api(&resource).await?;
        debug!(resource = %resource, "applying");
        api.patch(
            &resource.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
        .map_err(|e| Error::from_kube("apply", &resource.kind, &resource.name, e))?;
        Ok(())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), Error> {
        let api = self.api(resource).await?;
        debug!(resource = %resource, "deleting");
        api.delete(&resource.name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube("delete", &resource.kind, &resource.name, e))?;
        Ok(())
    }

    async fn get(&self, resource: &ResourceRef) -> Result<Option<Value>, Error> {
        let api = self.api(resource).await?;
        let obj = api
            .get_opt(&resource.name)
            .await
            .map_err(|e| Error::from_kube("get", &resource.kind, &resource.name, e))?;
        obj.map(|o| serde_json::to_value(o).map_err(Error::from))
            .transpose()
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        label_selector: &str,
    ) -> Result<Vec<Value>, Error> {
        let client = self.client().await?.clone();
        let api: Api<DynamicObject> = Api::all_with(client, &build_api_resource(api_version, kind));
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| Error::from_kube("list", kind, label_selector, e))?;

        list.items
            .into_iter()
            .map(|item| -> Result<Value, Error> {
                let mut value = serde_json::to_value(item)?;
                // list items come back without type information
                if let Some(map) = value.as_object_mut() {
                    map.entry("apiVersion")
                        .or_insert_with(|| Value::String(api_version.to_string()));
                    map.entry("kind")
                        .or_insert_with(|| Value::String(kind.to_string()));
                }
                Ok(value)
            })
            .collect()
    }
}
