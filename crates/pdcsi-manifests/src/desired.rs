//! Desired state: the merged configuration handed to manifest rendering

use tracing::debug;

use pdcsi_common::config::ConfigSnapshot;
use pdcsi_common::{Configuration, Credential, CLOUD_SA_KEY, IMAGE_REGISTRY_KEY, RELEASE_KEY};

use crate::manipulations::missing_secret_field;

/// Option selecting the upstream release
pub const STORAGE_RELEASE_OPTION: &str = "storage-release";

/// Merge the three configuration sources.
///
/// Later sources override earlier ones: the registry published by the
/// control plane, then operator options, then the credential. An operator
/// credential wins over the broker's. Empty values never survive, and the
/// `storage-release` option is renamed to `release`.
pub fn build(
    source: &ConfigSnapshot,
    broker: Option<&Credential>,
    registry: Option<&str>,
) -> Configuration {
    let mut config = Configuration::new();
    if let Some(registry) = registry {
        config.insert(IMAGE_REGISTRY_KEY, registry);
    }
    config.extend(source.data.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(credential) = source.credential.as_ref().or(broker) {
        config.insert(CLOUD_SA_KEY, credential.expose());
    }
    config.rename(STORAGE_RELEASE_OPTION, RELEASE_KEY);
    debug!(keys = ?config.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(), "built desired configuration");
    config
}

/// Reason the configuration cannot render the manifest set yet
pub fn evaluate(config: &Configuration) -> Option<String> {
    missing_secret_field(config)
        .map(|field| format!("Storage manifests waiting for definition of {}", field))
}
