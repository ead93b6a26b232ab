//! The reconciliation record persisted between invocations

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use pdcsi_common::{ConfigFingerprint, Error};
use pdcsi_relations::InstanceIdentity;

use crate::trigger::Trigger;

/// State carried from one invocation to the next.
///
/// Read once when an invocation starts and written once when it ends.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRecord {
    /// Fingerprint of the configuration last applied successfully
    #[serde(default)]
    pub last_applied_fingerprint: Option<ConfigFingerprint>,
    /// Whether the last applied configuration is fully deployed
    #[serde(default)]
    pub deployed: bool,
    /// Instance identity, resolved once
    #[serde(default)]
    pub identity: Option<InstanceIdentity>,
    /// Triggers re-armed after a transient failure, oldest first
    #[serde(default)]
    pub deferred: Vec<Trigger>,
}

impl ReconciliationRecord {
    /// Re-arm `trigger`; a trigger already waiting is not queued twice
    pub fn defer(&mut self, trigger: Trigger) {
        if !self.deferred.contains(&trigger) {
            self.deferred.push(trigger);
        }
    }
}

/// Persistence for [`ReconciliationRecord`]
#[cfg_attr(test, automock)]
pub trait StateStore: Send + Sync {
    /// Load the record, or a fresh one on first run
    fn load(&self) -> Result<ReconciliationRecord, Error>;

    /// Replace the stored record
    fn save(&self, record: &ReconciliationRecord) -> Result<(), Error>;
}

/// Record kept as a JSON file, replaced atomically
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Store the record at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<ReconciliationRecord, Error> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no reconciliation record, starting fresh");
            return Ok(ReconciliationRecord::default());
        }
        let data = std::fs::read(&self.path).map_err(|e| Error::io(&self.path, e))?;
        serde_json::from_slice(&data).map_err(|e| {
            Error::serialization(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }

    fn save(&self, record: &ReconciliationRecord) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(record)?;
        pdcsi_common::fs::write_atomic(&self.path, &data, Some(0o600))
    }
}
