//! Aggregate views over every manifest set
//!
//! Versions and readiness feed the unit status; the resource listings back
//! the operator actions.

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use pdcsi_common::{Configuration, Error};

use crate::cluster::ClusterApi;
use crate::manifests::{ManifestSet, RenderedResource};
use crate::resource::ResourceRef;

/// Key/value results reported back to the action invoker
pub type ActionResults = BTreeMap<String, String>;

/// Space-separated name filter; empty matches everything
#[derive(Clone, Debug, Default)]
pub struct Filter(BTreeSet<String>);

impl Filter {
    /// Parse a space-separated list, compared case-insensitively
    pub fn parse(raw: &str) -> Self {
        Self(raw.split_whitespace().map(str::to_lowercase).collect())
    }

    /// Whether `name` passes the filter
    pub fn matches(&self, name: &str) -> bool {
        self.0.is_empty() || self.0.contains(&name.to_lowercase())
    }
}

/// Comparison of the desired objects with what the cluster holds
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceAnalysis {
    /// Desired and present
    pub correct: BTreeSet<ResourceRef>,
    /// Present but no longer desired
    pub extra: BTreeSet<ResourceRef>,
    /// Desired but absent
    pub missing: BTreeSet<ResourceRef>,
}

/// Every manifest set the operator deploys
pub struct Collector {
    manifests: Vec<ManifestSet>,
}

impl Collector {
    /// Collect the given manifest sets
    pub fn new(manifests: Vec<ManifestSet>) -> Self {
        Self { manifests }
    }

    /// The collected manifest sets
    pub fn manifests(&self) -> &[ManifestSet] {
        &self.manifests
    }

    /// Unready descriptions across all sets
    pub async fn unready(
        &self,
        cluster: &dyn ClusterApi,
        config: &Configuration,
    ) -> Result<Vec<String>, Error> {
        let mut unready = Vec::new();
        for manifest in &self.manifests {
            unready.extend(manifest.unready(cluster, config).await?);
        }
        Ok(unready)
    }

    /// Releases of every set, comma separated
    pub fn short_version(&self, config: &Configuration) -> Result<String, Error> {
        let releases = self
            .manifests
            .iter()
            .map(|m| m.current_release(config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(releases.join(","))
    }

    /// `Versions: name=release, ...`
    pub fn long_version(&self, config: &Configuration) -> Result<String, Error> {
        let pairs = self
            .manifests
            .iter()
            .map(|m| Ok(format!("{}={}", m.name(), m.current_release(config)?)))
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(format!("Versions: {}", pairs.join(", ")))
    }

    /// Mirrored releases of each set, newest first
    pub fn list_versions(&self) -> Result<ActionResults, Error> {
        let mut results = ActionResults::new();
        for manifest in &self.manifests {
            let mut releases = manifest.releases()?;
            releases.reverse();
            results.insert(format!("{}-versions", manifest.name()), releases.join("\n"));
        }
        Ok(results)
    }

    fn selected<'a>(&'a self, manifests: &'a Filter) -> impl Iterator<Item = &'a ManifestSet> {
        self.manifests.iter().filter(move |m| manifests.matches(m.name()))
    }

    /// Compare one set's desired objects of the selected kinds with the cluster
    pub async fn analyze(
        &self,
        manifest: &ManifestSet,
        cluster: &dyn ClusterApi,
        config: &Configuration,
        kinds: &Filter,
    ) -> Result<(ResourceAnalysis, Vec<RenderedResource>), Error> {
        let desired: Vec<RenderedResource> = manifest
            .render(config)?
            .into_iter()
            .filter(|r| kinds.matches(&r.reference.kind))
            .collect();
        let expected: BTreeSet<ResourceRef> = desired.iter().map(|r| r.reference.clone()).collect();

        let types: BTreeSet<(String, String)> = expected
            .iter()
            .map(|r| (r.api_version.clone(), r.kind.clone()))
            .collect();
        let selector = manifest.label_selector();
        let mut installed = BTreeSet::new();
        for (api_version, kind) in &types {
            for obj in cluster.list(api_version, kind, &selector).await? {
                installed.insert(ResourceRef::from_value(&obj)?);
            }
        }

        let analysis = ResourceAnalysis {
            correct: expected.intersection(&installed).cloned().collect(),
            extra: installed.difference(&expected).cloned().collect(),
            missing: expected.difference(&installed).cloned().collect(),
        };
        Ok((analysis, desired))
    }

    /// Correct, extra and missing resources per selected set
    pub async fn list_resources(
        &self,
        cluster: &dyn ClusterApi,
        config: &Configuration,
        manifests: &Filter,
        kinds: &Filter,
    ) -> Result<ActionResults, Error> {
        let mut results = ActionResults::new();
        for manifest in self.selected(manifests) {
            let (analysis, _) = self.analyze(manifest, cluster, config, kinds).await?;
            for (suffix, set) in [
                ("correct", &analysis.correct),
                ("extra", &analysis.extra),
                ("missing", &analysis.missing),
            ] {
                if !set.is_empty() {
                    let lines: Vec<String> = set.iter().map(ToString::to_string).collect();
                    results.insert(format!("{}-{}", manifest.name(), suffix), lines.join("\n"));
                }
            }
        }
        Ok(results)
    }

    /// Delete installed resources that are no longer desired, then list again
    pub async fn scrub_resources(
        &self,
        cluster: &dyn ClusterApi,
        config: &Configuration,
        manifests: &Filter,
        kinds: &Filter,
    ) -> Result<ActionResults, Error> {
        for manifest in self.selected(manifests) {
            let (analysis, _) = self.analyze(manifest, cluster, config, kinds).await?;
            for resource in analysis.extra.iter().rev() {
                info!(resource = %resource, "scrubbing extra resource");
                match cluster.delete(resource).await {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                }
            }
        }
        self.list_resources(cluster, config, manifests, kinds).await
    }

    /// Apply desired resources absent from the cluster, then list again
    pub async fn apply_missing_resources(
        &self,
        cluster: &dyn ClusterApi,
        config: &Configuration,
        manifests: &Filter,
        kinds: &Filter,
    ) -> Result<ActionResults, Error> {
        for manifest in self.selected(manifests) {
            let (analysis, desired) = self.analyze(manifest, cluster, config, kinds).await?;
            for resource in desired.iter().filter(|r| analysis.missing.contains(&r.reference)) {
                info!(resource = %resource.reference, "applying missing resource");
                cluster.apply(&resource.object).await?;
            }
        }
        self.list_resources(cluster, config, manifests, kinds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockClusterApi;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::{json, Value};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    fn collector() -> Collector {
        let charm_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        Collector::new(vec![ManifestSet::gce_pd_csi_driver("gcp-k8s-storage", &charm_dir)])
    }

    fn config() -> Configuration {
        [("cloud_sa", STANDARD.encode("{}"))].into_iter().collect()
    }

    fn object(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> Value {
        let mut obj = json!({"apiVersion": api_version, "kind": kind, "metadata": {"name": name}});
        if let Some(ns) = namespace {
            obj["metadata"]["namespace"] = json!(ns);
        }
        obj
    }

    #[test]
    fn test_versions() {
        let collector = collector();
        let mut config = config();
        assert_eq!(collector.short_version(&config).unwrap(), "v1.10.1");
        assert_eq!(
            collector.long_version(&config).unwrap(),
            "Versions: gce-pd-csi-driver=v1.10.1"
        );
        config.insert("release", "v1.9.0");
        assert_eq!(collector.short_version(&config).unwrap(), "v1.9.0");

        let versions = collector.list_versions().unwrap();
        assert!(versions["gce-pd-csi-driver-versions"].starts_with("v1.10.1"));
    }

    #[test]
    fn test_filter() {
        let filter = Filter::parse("Deployment  daemonset");
        assert!(filter.matches("deployment"));
        assert!(filter.matches("DaemonSet"));
        assert!(!filter.matches("Secret"));
        assert!(Filter::parse("").matches("anything"));
    }

    #[tokio::test]
    async fn test_list_resources_by_kind() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list()
            .withf(|_, kind, selector| kind == "StorageClass" && selector == "juju.io/manifest=gce-pd-csi-driver")
            .returning(|_, _, _| {
                Ok(vec![object("storage.k8s.io/v1", "StorageClass", None, "csi-gce-pd-old")])
            });
        let results = collector()
            .list_resources(&cluster, &config(), &Filter::default(), &Filter::parse("storageclass"))
            .await
            .unwrap();
        assert_eq!(results["gce-pd-csi-driver-extra"], "StorageClass/csi-gce-pd-old");
        assert_eq!(results["gce-pd-csi-driver-missing"], "StorageClass/csi-gce-pd-default");
        assert!(!results.contains_key("gce-pd-csi-driver-correct"));
    }

    #[tokio::test]
    async fn test_unselected_manifest_is_skipped() {
        let cluster = MockClusterApi::new();
        let results = collector()
            .list_resources(&cluster, &config(), &Filter::parse("other"), &Filter::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    /// Story: an operator removes leftovers from an older release
    #[tokio::test]
    async fn story_scrub_deletes_only_extra_resources() {
        let installed = Arc::new(Mutex::new(vec![
            object("storage.k8s.io/v1", "StorageClass", None, "csi-gce-pd-default"),
            object("storage.k8s.io/v1", "StorageClass", None, "csi-gce-pd-old"),
        ]));

        let mut cluster = MockClusterApi::new();
        let listed = installed.clone();
        cluster
            .expect_list()
            .returning(move |_, _, _| Ok(listed.lock().unwrap().clone()));
        let remaining = installed.clone();
        cluster.expect_delete().times(1).returning(move |r| {
            assert_eq!(r.name, "csi-gce-pd-old");
            remaining.lock().unwrap().retain(|o| o["metadata"]["name"] != "csi-gce-pd-old");
            Ok(())
        });

        let results = collector()
            .scrub_resources(&cluster, &config(), &Filter::default(), &Filter::parse("StorageClass"))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results["gce-pd-csi-driver-correct"], "StorageClass/csi-gce-pd-default");
    }

    /// Story: the storage class was deleted by hand and is synced back
    #[tokio::test]
    async fn story_sync_applies_only_missing_resources() {
        let installed = Arc::new(Mutex::new(Vec::<Value>::new()));

        let mut cluster = MockClusterApi::new();
        let listed = installed.clone();
        cluster
            .expect_list()
            .returning(move |_, _, _| Ok(listed.lock().unwrap().clone()));
        let applied = installed.clone();
        cluster.expect_apply().times(1).returning(move |obj| {
            assert_eq!(obj["metadata"]["labels"]["juju.io/manifest"], "gce-pd-csi-driver");
            applied.lock().unwrap().push(obj.clone());
            Ok(())
        });

        let results = collector()
            .apply_missing_resources(&cluster, &config(), &Filter::default(), &Filter::parse("StorageClass"))
            .await
            .unwrap();
        assert_eq!(results["gce-pd-csi-driver-correct"], "StorageClass/csi-gce-pd-default");
        assert!(!results.contains_key("gce-pd-csi-driver-missing"));
    }

    #[tokio::test]
    async fn test_sync_reports_unavailable_cluster() {
        let mut cluster = MockClusterApi::new();
        cluster
            .expect_list()
            .returning(|_, _, _| Err(Error::unavailable("list", "connection refused")));
        let err = collector()
            .apply_missing_resources(&cluster, &config(), &Filter::default(), &Filter::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
