//! Upstream manifest bundles
//!
//! A bundle directory looks like:
//!
//! ```text
//! upstream/cloud_storage/
//!   version                      # default release, e.g. "v1.10.1"
//!   manifests/<release>/*.yaml   # one directory per mirrored release
//! ```

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use pdcsi_common::yaml::parse_yaml_multi;
use pdcsi_common::Error;

/// Mirrored upstream releases of one component
#[derive(Clone, Debug)]
pub struct ManifestBundle {
    base: PathBuf,
}

impl ManifestBundle {
    /// Bundle rooted at `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn manifests_dir(&self) -> PathBuf {
        self.base.join("manifests")
    }

    /// Available releases, oldest first
    pub fn releases(&self) -> Result<Vec<String>, Error> {
        let dir = self.manifests_dir();
        let entries = std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))?;
        let mut releases = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            if entry.path().is_dir() {
                releases.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        releases.sort_by(|a, b| compare_versions(a, b));
        Ok(releases)
    }

    /// Release used when none is configured.
    ///
    /// The `version` file wins when it names a mirrored release; otherwise
    /// the newest release.
    pub fn default_release(&self) -> Result<String, Error> {
        let releases = self.releases()?;
        let pinned = std::fs::read_to_string(self.base.join("version"))
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| releases.contains(v));
        pinned
            .or_else(|| releases.last().cloned())
            .ok_or_else(|| {
                Error::validation(format!("no releases under {}", self.manifests_dir().display()))
            })
    }

    /// Whether `release` is mirrored
    pub fn has_release(&self, release: &str) -> Result<bool, Error> {
        Ok(self.releases()?.iter().any(|r| r == release))
    }

    /// Parse every document of a release, files in name order
    pub fn load(&self, release: &str) -> Result<Vec<Value>, Error> {
        if !self.has_release(release)? {
            return Err(Error::validation_for_field(
                "release",
                format!("release {} is not available", release),
            ));
        }
        let dir = self.manifests_dir().join(release);
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| Error::io(&dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_yaml(path))
            .collect();
        files.sort();

        let mut documents = Vec::new();
        for file in files {
            let text = std::fs::read_to_string(&file).map_err(|e| Error::io(&file, e))?;
            let docs = parse_yaml_multi(&text).map_err(|e| {
                Error::serialization(format!("failed to parse {}: {}", file.display(), e))
            })?;
            debug!(file = %file.display(), documents = docs.len(), "loaded manifest file");
            documents.extend(docs);
        }
        Ok(documents)
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Compare release names like `v1.10.1` numerically, falling back to text
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn parts(v: &str) -> Vec<u64> {
        v.trim_start_matches('v')
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    }
    parts(a).cmp(&parts(b)).then_with(|| a.cmp(b))
}
