//! A manifest set: one upstream bundle plus its manipulations
//!
//! Rendering is a pure function of the merged configuration. Apply walks
//! the rendered objects in kind-priority order; delete walks them in
//! reverse.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;
use tracing::{info, warn};

use pdcsi_common::{ConfigFingerprint, Configuration, Error, RELEASE_KEY, STORAGE_MANIFEST_NAME};

use crate::bundle::ManifestBundle;
use crate::cluster::ClusterApi;
use crate::desired;
use crate::manipulations::{default_manipulations, Manipulation, RenderContext, LABEL_MANIFEST};
use crate::resource::ResourceRef;

/// A rendered object with its identity
#[derive(Clone, Debug)]
pub struct RenderedResource {
    /// Identity
    pub reference: ResourceRef,
    /// Full object
    pub object: Value,
}

/// One deployable component
pub struct ManifestSet {
    name: String,
    app: String,
    bundle: ManifestBundle,
    manipulations: Vec<Manipulation>,
}

impl ManifestSet {
    /// Create a manifest set
    pub fn new(
        name: impl Into<String>,
        app: impl Into<String>,
        bundle: ManifestBundle,
        manipulations: Vec<Manipulation>,
    ) -> Self {
        Self {
            name: name.into(),
            app: app.into(),
            bundle,
            manipulations,
        }
    }

    /// The GCE PD CSI driver set, bundle at `<charm_dir>/upstream/cloud_storage`
    pub fn gce_pd_csi_driver(app: impl Into<String>, charm_dir: &Path) -> Self {
        Self::new(
            STORAGE_MANIFEST_NAME,
            app,
            ManifestBundle::new(charm_dir.join("upstream").join("cloud_storage")),
            default_manipulations(),
        )
    }

    /// Manifest set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mirrored releases, oldest first
    pub fn releases(&self) -> Result<Vec<String>, Error> {
        self.bundle.releases()
    }

    /// Release selected by `config`, or the bundle default
    pub fn current_release(&self, config: &Configuration) -> Result<String, Error> {
        match config.get_str(RELEASE_KEY) {
            Some(release) => Ok(release.to_string()),
            None => self.bundle.default_release(),
        }
    }

    /// Fingerprint of the configuration this set renders from
    pub fn hash(&self, config: &Configuration) -> ConfigFingerprint {
        config.fingerprint()
    }

    /// Reason `config` cannot be rendered, if any
    pub fn evaluate(&self, config: &Configuration) -> Result<Option<String>, Error> {
        if let Some(reason) = desired::evaluate(config) {
            return Ok(Some(reason));
        }
        let release = self.current_release(config)?;
        if !self.bundle.has_release(&release)? {
            return Ok(Some(format!(
                "Storage manifests release {} is not available",
                release
            )));
        }
        Ok(None)
    }

    /// Render every object, sorted for apply
    pub fn render(&self, config: &Configuration) -> Result<Vec<RenderedResource>, Error> {
        let release = self.current_release(config)?;
        self.render_release(config, &release)
    }

    fn render_release(
        &self,
        config: &Configuration,
        release: &str,
    ) -> Result<Vec<RenderedResource>, Error> {
        let ctx = RenderContext {
            manifest: &self.name,
            app: &self.app,
            release,
            config,
        };

        let mut objects = self.bundle.load(release)?;
        for manipulation in &self.manipulations {
            if let Some(obj) = manipulation.addition(&ctx)? {
                objects.push(obj);
            }
        }
        for obj in objects.iter_mut() {
            for manipulation in &self.manipulations {
                manipulation.patch(&ctx, obj);
            }
        }

        let mut rendered = objects
            .into_iter()
            .map(|object| {
                Ok(RenderedResource {
                    reference: ResourceRef::from_value(&object)?,
                    object,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        rendered.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(rendered)
    }

    /// Label selector matching objects this set installed
    pub fn label_selector(&self) -> String {
        format!("{}={}", LABEL_MANIFEST, self.name)
    }

    /// Apply every rendered object; the first failure aborts
    pub async fn apply(&self, cluster: &dyn ClusterApi, config: &Configuration) -> Result<(), Error> {
        let rendered = self.render(config)?;
        info!(manifest = %self.name, resources = rendered.len(), "applying manifests");
        for resource in &rendered {
            cluster.apply(&resource.object).await?;
        }
        Ok(())
    }

    /// Objects to remove on teardown, sorted for apply.
    ///
    /// The configuration may have drifted since the last apply: a release
    /// that is not mirrored falls back to the bundle default, and objects
    /// added by manipulations are named even when their data is gone.
    pub fn teardown_resources(&self, config: &Configuration) -> Result<Vec<ResourceRef>, Error> {
        let mut release = self.current_release(config)?;
        if !self.bundle.has_release(&release)? {
            let fallback = self.bundle.default_release()?;
            warn!(manifest = %self.name, release = %release, fallback = %fallback, "release not available, tearing down default release");
            release = fallback;
        }
        let mut resources: BTreeSet<ResourceRef> = self
            .render_release(config, &release)?
            .into_iter()
            .map(|resource| resource.reference)
            .collect();
        resources.extend(self.manipulations.iter().filter_map(Manipulation::owned));
        Ok(resources.into_iter().collect())
    }

    /// Delete every teardown object in reverse order.
    ///
    /// Objects already gone are skipped. With `ignore_unauthorized`,
    /// authorization denials are logged and skipped too.
    pub async fn delete(
        &self,
        cluster: &dyn ClusterApi,
        config: &Configuration,
        ignore_unauthorized: bool,
    ) -> Result<(), Error> {
        let resources = self.teardown_resources(config)?;
        info!(manifest = %self.name, resources = resources.len(), "deleting manifests");
        for resource in resources.iter().rev() {
            match cluster.delete(resource).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) if ignore_unauthorized && e.is_unauthorized() => {
                    warn!(resource = %resource, error = %e, "unauthorized to delete, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Human-readable description of each rendered object that is not ready
    pub async fn unready(
        &self,
        cluster: &dyn ClusterApi,
        config: &Configuration,
    ) -> Result<Vec<String>, Error> {
        let mut unready = Vec::new();
        for resource in self.render(config)? {
            match cluster.get(&resource.reference).await? {
                None => unready.push(format!("{} does not exist", resource.reference)),
                Some(obj) if !is_ready(&obj) => {
                    unready.push(format!("{} is not Ready", resource.reference))
                }
                Some(_) => {}
            }
        }
        Ok(unready)
    }
}

/// Whether an object reports itself ready
pub fn is_ready(obj: &Value) -> bool {
    let int = |pointer: &str| obj.pointer(pointer).and_then(Value::as_i64).unwrap_or(0);
    match obj.get("kind").and_then(Value::as_str) {
        Some("Deployment") | Some("StatefulSet") => {
            let wanted = obj.pointer("/spec/replicas").and_then(Value::as_i64).unwrap_or(1);
            int("/status/readyReplicas") >= wanted
        }
        Some("DaemonSet") => {
            int("/status/numberReady") >= int("/status/desiredNumberScheduled")
                && obj.pointer("/status/desiredNumberScheduled").is_some()
        }
        _ => {
            let conditions = obj
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            !conditions.iter().any(|c| {
                matches!(
                    c.get("type").and_then(Value::as_str),
                    Some("Ready") | Some("Available")
                ) && c.get("status").and_then(Value::as_str) == Some("False")
            })
        }
    }
}
