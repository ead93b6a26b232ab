//! Operator-visible status and action results

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use pdcsi_common::{Error, Readiness};
use pdcsi_manifests::ActionResults;

/// Workload status shown to the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    /// Running as intended
    Active(String),
    /// Busy with work that needs no operator action
    Maintenance(String),
    /// Waiting on something outside the operator's control
    Waiting(String),
    /// Needs operator action
    Blocked(String),
}

impl UnitStatus {
    /// Status for a gate that did not pass
    pub fn from_readiness(verdict: &Readiness) -> Option<Self> {
        match verdict {
            Readiness::Ready => None,
            Readiness::Waiting(reason) => Some(UnitStatus::Waiting(reason.clone())),
            Readiness::Blocked(reason) => Some(UnitStatus::Blocked(reason.clone())),
        }
    }

    /// The status message
    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active(m)
            | UnitStatus::Maintenance(m)
            | UnitStatus::Waiting(m)
            | UnitStatus::Blocked(m) => m,
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            UnitStatus::Active(_) => "active",
            UnitStatus::Maintenance(_) => "maintenance",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Blocked(_) => "blocked",
        };
        write!(f, "{}: {}", kind, self.message())
    }
}

/// Outcome of an operator action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionOutcome {
    /// Results keyed by name
    Results(ActionResults),
    /// The action could not run
    Failed(String),
}

/// Everything reported during one invocation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusReport {
    /// Unit status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<UnitStatus>,
    /// Application status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<UnitStatus>,
    /// Deployed workload version, empty while deploying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_version: Option<String>,
    /// Result of the action handled, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionOutcome>,
}

/// Destination for status updates
#[cfg_attr(test, automock)]
pub trait StatusSink: Send + Sync {
    /// Set the unit status
    fn unit_status(&self, status: UnitStatus) -> Result<(), Error>;

    /// Set the application status
    fn app_status(&self, status: UnitStatus) -> Result<(), Error>;

    /// Set the workload version
    fn workload_version(&self, version: &str) -> Result<(), Error>;

    /// Report the outcome of an action
    fn action(&self, outcome: ActionOutcome) -> Result<(), Error>;
}

/// Status kept in memory, readable after the invocation
#[derive(Default)]
pub struct MemoryStatusSink {
    report: Mutex<StatusReport>,
}

impl MemoryStatusSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far
    pub fn report(&self) -> StatusReport {
        self.report.lock().clone()
    }

    /// Current unit status
    pub fn unit(&self) -> Option<UnitStatus> {
        self.report.lock().unit.clone()
    }

    /// Forget the last action outcome
    pub fn take_action(&self) -> Option<ActionOutcome> {
        self.report.lock().action.take()
    }
}

impl StatusSink for MemoryStatusSink {
    fn unit_status(&self, status: UnitStatus) -> Result<(), Error> {
        info!(status = %status, "unit status");
        self.report.lock().unit = Some(status);
        Ok(())
    }

    fn app_status(&self, status: UnitStatus) -> Result<(), Error> {
        debug!(status = %status, "application status");
        self.report.lock().app = Some(status);
        Ok(())
    }

    fn workload_version(&self, version: &str) -> Result<(), Error> {
        self.report.lock().workload_version = Some(version.to_string());
        Ok(())
    }

    fn action(&self, outcome: ActionOutcome) -> Result<(), Error> {
        self.report.lock().action = Some(outcome);
        Ok(())
    }
}

/// Status written to a JSON file the harness reads after each invocation.
///
/// Updates accumulate in memory and the file is rewritten on every change,
/// so the file always holds the latest complete report.
pub struct FileStatusSink {
    path: PathBuf,
    inner: MemoryStatusSink,
}

impl FileStatusSink {
    /// Write status to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: MemoryStatusSink::new(),
        }
    }

    fn flush(&self) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(&self.inner.report())?;
        pdcsi_common::fs::write_atomic(&self.path, &data, None)
    }
}

impl StatusSink for FileStatusSink {
    fn unit_status(&self, status: UnitStatus) -> Result<(), Error> {
        self.inner.unit_status(status)?;
        self.flush()
    }

    fn app_status(&self, status: UnitStatus) -> Result<(), Error> {
        self.inner.app_status(status)?;
        self.flush()
    }

    fn workload_version(&self, version: &str) -> Result<(), Error> {
        self.inner.workload_version(version)?;
        self.flush()
    }

    fn action(&self, outcome: ActionOutcome) -> Result<(), Error> {
        self.inner.action(outcome)?;
        self.flush()
    }
}
