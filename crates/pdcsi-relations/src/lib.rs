//! Relation clients for the GCE PD CSI storage operator
//!
//! Each peer exchange is a narrow client over a [`RelationChannel`]:
//! - [`integrator`]: the `gcp-integration` credential broker
//! - [`certificates`]: the certificate authority
//! - [`kube_control`]: control plane endpoints, credentials and registry

#![deny(missing_docs)]

pub mod certificates;
pub mod integrator;
pub mod kube_control;
pub mod kubeconfig;
pub mod metadata;
pub mod relation;

pub use certificates::CertificatesRequires;
pub use integrator::IntegratorRequires;
pub use kube_control::KubeControlRequires;
pub use kubeconfig::{Kubeconfig, KubeconfigTarget};
pub use metadata::{GceMetadataClient, InstanceIdentity, MetadataClient};
pub use relation::{Databag, FileRelationChannel, MemoryRelationChannel, Relation, RelationChannel};
