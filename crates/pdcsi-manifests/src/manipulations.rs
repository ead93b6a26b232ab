//! Additions and patches applied on top of the upstream documents
//!
//! Additions produce new objects from the configuration (namespace, secret,
//! storage class). Patches rewrite every rendered object (labels, image
//! registry). Additions are rendered first so patches reach them too.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde_json::Value;
use tracing::{error, info};

use pdcsi_common::{Configuration, Error, IMAGE_REGISTRY_KEY, STORAGE_NAMESPACE};

use crate::resource::ResourceRef;

/// Name of the secret holding the service-account key
pub const SECRET_NAME: &str = "cloud-sa";

/// Configuration keys copied into the secret, and the secret key for each
pub const CONFIG_TO_SECRET: &[(&str, &str)] = &[("cloud_sa", "cloud-sa.json")];

/// CSI provisioner name of the driver
pub const PROVISIONER: &str = "pd.csi.storage.gke.io";

/// Label naming the owning application
pub const LABEL_APPLICATION: &str = "juju.io/application";
/// Label naming the manifest set
pub const LABEL_MANIFEST: &str = "juju.io/manifest";
/// Label naming the manifest set and release
pub const LABEL_MANIFEST_VERSION: &str = "juju.io/manifest-version";

/// Everything a manipulation may read
pub struct RenderContext<'a> {
    /// Manifest set name
    pub manifest: &'a str,
    /// Application name
    pub app: &'a str,
    /// Release being rendered
    pub release: &'a str,
    /// Merged configuration
    pub config: &'a Configuration,
}

impl RenderContext<'_> {
    /// Value of the `juju.io/manifest-version` label
    pub fn manifest_version(&self) -> String {
        format!("{}-{}", self.manifest, self.release.replace('.', "-"))
    }
}

/// One step of manifest rendering
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Manipulation {
    /// Add the named namespace
    CreateNamespace(String),
    /// Add the credentials secret
    CreateSecret,
    /// Label every object with application, manifest and release
    ManifestLabel,
    /// Point container images at the configured registry
    ConfigRegistry,
    /// Add the `csi-gce-pd-<type>` storage class
    CreateStorageClass(String),
}

impl Manipulation {
    /// Object added by this manipulation, if it is an addition that applies
    pub fn addition(&self, ctx: &RenderContext<'_>) -> Result<Option<Value>, Error> {
        match self {
            Manipulation::CreateNamespace(name) => to_value(&Namespace {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .map(Some),
            Manipulation::CreateSecret => secret(ctx.config),
            Manipulation::CreateStorageClass(sc_type) => {
                let name = storage_class_name(sc_type);
                info!("Creating storage class {}", name);
                to_value(&StorageClass {
                    metadata: ObjectMeta {
                        name: Some(name),
                        ..Default::default()
                    },
                    provisioner: PROVISIONER.to_string(),
                    volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
                    ..Default::default()
                })
                .map(Some)
            }
            Manipulation::ManifestLabel | Manipulation::ConfigRegistry => Ok(None),
        }
    }

    /// Identity of the object an addition creates, whatever the configuration
    pub fn owned(&self) -> Option<ResourceRef> {
        let (api_version, kind, namespace, name) = match self {
            Manipulation::CreateNamespace(name) => ("v1", "Namespace", None, name.clone()),
            Manipulation::CreateSecret => (
                "v1",
                "Secret",
                Some(STORAGE_NAMESPACE.to_string()),
                SECRET_NAME.to_string(),
            ),
            Manipulation::CreateStorageClass(sc_type) => (
                "storage.k8s.io/v1",
                "StorageClass",
                None,
                storage_class_name(sc_type),
            ),
            Manipulation::ManifestLabel | Manipulation::ConfigRegistry => return None,
        };
        Some(ResourceRef {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace,
            name,
        })
    }

    /// Rewrite `obj` in place if this manipulation is a patch
    pub fn patch(&self, ctx: &RenderContext<'_>, obj: &mut Value) {
        match self {
            Manipulation::ManifestLabel => {
                let labels = [
                    (LABEL_APPLICATION, ctx.app.to_string()),
                    (LABEL_MANIFEST, ctx.manifest.to_string()),
                    (LABEL_MANIFEST_VERSION, ctx.manifest_version()),
                ];
                if let Some(metadata) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
                    let entry = metadata
                        .entry("labels")
                        .or_insert_with(|| Value::Object(Default::default()));
                    if let Some(map) = entry.as_object_mut() {
                        for (key, value) in labels {
                            map.insert(key.to_string(), Value::String(value));
                        }
                    }
                }
            }
            Manipulation::ConfigRegistry => {
                if let Some(registry) = ctx.config.get_str(IMAGE_REGISTRY_KEY) {
                    for_each_container(obj, |container| {
                        if let Some(Value::String(image)) = container.get_mut("image") {
                            *image = rewrite_registry(image, registry);
                        }
                    });
                }
            }
            _ => {}
        }
    }
}

/// Name of the storage class of the given type
pub fn storage_class_name(sc_type: &str) -> String {
    format!("csi-gce-pd-{}", sc_type)
}

/// The fixed manipulation list for the CSI driver
pub fn default_manipulations() -> Vec<Manipulation> {
    vec![
        Manipulation::CreateNamespace(STORAGE_NAMESPACE.to_string()),
        Manipulation::CreateSecret,
        Manipulation::ManifestLabel,
        Manipulation::ConfigRegistry,
        Manipulation::CreateStorageClass("default".to_string()),
    ]
}

/// First configuration key the secret needs but is missing
pub fn missing_secret_field(config: &Configuration) -> Option<&'static str> {
    CONFIG_TO_SECRET
        .iter()
        .map(|(key, _)| *key)
        .find(|key| config.get_str(key).map_or(true, str::is_empty))
}

fn secret(config: &Configuration) -> Result<Option<Value>, Error> {
    if missing_secret_field(config).is_some() {
        error!("secret data item is None");
        return Ok(None);
    }

    let mut data = BTreeMap::new();
    for (key, secret_key) in CONFIG_TO_SECRET {
        let encoded = config.get_str(key).unwrap_or_default();
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| Error::validation_for_field(*key, e.to_string()))?;
        data.insert(secret_key.to_string(), ByteString(decoded));
    }

    info!("Encode secret data for storage.");
    to_value(&Secret {
        metadata: ObjectMeta {
            name: Some(SECRET_NAME.to_string()),
            namespace: Some(STORAGE_NAMESPACE.to_string()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Default::default()
    })
    .map(Some)
}

fn to_value<T: serde::Serialize>(obj: &T) -> Result<Value, Error> {
    serde_json::to_value(obj).map_err(Error::from)
}

fn for_each_container(obj: &mut Value, mut f: impl FnMut(&mut Value)) {
    let pod_spec = if obj.get("kind").and_then(Value::as_str) == Some("Pod") {
        obj.get_mut("spec")
    } else {
        obj.pointer_mut("/spec/template/spec")
    };
    let Some(pod_spec) = pod_spec else {
        return;
    };
    for field in ["initContainers", "containers"] {
        if let Some(Value::Array(containers)) = pod_spec.get_mut(field) {
            containers.iter_mut().for_each(&mut f);
        }
    }
}

/// Replace the registry part of an image reference
pub fn rewrite_registry(image: &str, registry: &str) -> String {
    let path = match image.split_once('/') {
        Some((host, rest)) if host.contains('.') || host.contains(':') || host == "localhost" => rest,
        _ => image,
    };
    format!("{}/{}", registry.trim_end_matches('/'), path)
}
