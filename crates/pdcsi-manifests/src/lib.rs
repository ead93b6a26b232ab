//! Manifest rendering and cluster reconciliation for the GCE PD CSI driver
//!
//! Upstream bundles are loaded per release, extended and patched by
//! [`manipulations`], and applied through the [`ClusterApi`] seam.

#![deny(missing_docs)]

pub mod bundle;
pub mod cluster;
pub mod collector;
pub mod desired;
pub mod manifests;
pub mod manipulations;
pub mod resource;

pub use bundle::ManifestBundle;
pub use cluster::{ClusterApi, KubeClusterApi};
pub use collector::{ActionResults, Collector, Filter};
pub use manifests::{ManifestSet, RenderedResource};
pub use manipulations::Manipulation;
pub use resource::ResourceRef;
