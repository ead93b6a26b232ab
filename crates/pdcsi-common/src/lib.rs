//! Common types for the GCE PD CSI storage operator: errors, configuration,
//! credentials and configuration fingerprints.

#![deny(missing_docs)]

pub mod config;
pub mod configuration;
pub mod credentials;
pub mod error;
pub mod fs;
pub mod readiness;
pub mod telemetry;
pub mod yaml;

pub use configuration::{ConfigFingerprint, Configuration};
pub use credentials::Credential;
pub use error::Error;
pub use readiness::Readiness;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the CSI driver is deployed into
pub const STORAGE_NAMESPACE: &str = "gce-pd-csi-driver";

/// Name of the manifest set for the CSI driver
pub const STORAGE_MANIFEST_NAME: &str = "gce-pd-csi-driver";

/// Configuration key carrying the base64 encoded service-account JSON
pub const CLOUD_SA_KEY: &str = "cloud_sa";

/// Configuration key carrying the selected upstream release
pub const RELEASE_KEY: &str = "release";

/// Configuration key carrying the container image registry
pub const IMAGE_REGISTRY_KEY: &str = "image-registry";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "pdcsi-operator";
