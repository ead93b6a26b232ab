//! Triggers and the table routing them to reconciliation entry points
//!
//! A trigger is the name of the hook or action the harness dispatched, plus
//! action parameters. Routing is a static table lookup keyed by that name;
//! names absent from the table are ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use pdcsi_relations::{certificates, integrator, kube_control};

/// One external event delivered to the operator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// Hook or action name, e.g. `config-changed` or `list-versions`
    pub name: String,
    /// Action parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Trigger {
    /// Trigger with no parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add an action parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Trigger named by a dispatch path such as `hooks/install` or
    /// `actions/list-versions`
    pub fn from_dispatch_path(path: &str) -> Self {
        let name = path.rsplit('/').next().unwrap_or(path);
        Self::new(name)
    }

    /// Parameter value, empty when unset
    pub fn param(&self, key: &str) -> &str {
        self.params.get(key).map(String::as_str).unwrap_or_default()
    }

    /// Entry point this trigger routes to
    pub fn entry_point(&self) -> Option<EntryPoint> {
        route(&self.name)
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Operator actions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Mirrored releases per manifest set
    ListVersions,
    /// Correct, extra and missing resources
    ListResources,
    /// Delete resources that are no longer desired
    ScrubResources,
    /// Apply desired resources missing from the cluster
    SyncResources,
}

/// Reconciliation entry points
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryPoint {
    /// Run the gated merge-and-apply cycle. `broken` names a relation being
    /// removed, which must be treated as absent.
    Merge {
        /// Endpoint of the relation being broken
        broken: Option<&'static str>,
    },
    /// Ask the control plane for unit credentials, then merge
    RequestClusterAuth,
    /// Introduce the unit to the broker and request capabilities, then merge
    RequestCapabilities,
    /// First deployment
    Install,
    /// New operator revision: forget the last fingerprint, then merge
    Upgrade,
    /// Remove everything that was applied
    Cleanup,
    /// Refresh readiness of a deployed manifest set
    StatusCheck,
    /// Operator action
    Action(ActionKind),
}

const MERGE: EntryPoint = EntryPoint::Merge { broken: None };

/// Trigger name to entry point
pub static DISPATCH: &[(&str, EntryPoint)] = &[
    ("install", EntryPoint::Install),
    ("upgrade-charm", EntryPoint::Upgrade),
    ("config-changed", MERGE),
    ("update-status", EntryPoint::StatusCheck),
    ("stop", EntryPoint::Cleanup),
    ("kube-control-relation-created", EntryPoint::RequestClusterAuth),
    ("kube-control-relation-joined", EntryPoint::RequestClusterAuth),
    ("kube-control-relation-changed", MERGE),
    (
        "kube-control-relation-broken",
        EntryPoint::Merge {
            broken: Some(kube_control::ENDPOINT),
        },
    ),
    ("certificates-relation-created", MERGE),
    ("certificates-relation-changed", MERGE),
    (
        "certificates-relation-broken",
        EntryPoint::Merge {
            broken: Some(certificates::ENDPOINT),
        },
    ),
    ("gcp-integration-relation-joined", EntryPoint::RequestCapabilities),
    ("gcp-integration-relation-changed", MERGE),
    (
        "gcp-integration-relation-broken",
        EntryPoint::Merge {
            broken: Some(integrator::ENDPOINT),
        },
    ),
    ("list-versions", EntryPoint::Action(ActionKind::ListVersions)),
    ("list-resources", EntryPoint::Action(ActionKind::ListResources)),
    ("scrub-resources", EntryPoint::Action(ActionKind::ScrubResources)),
    ("sync-resources", EntryPoint::Action(ActionKind::SyncResources)),
];

/// Look up the entry point for a trigger name
pub fn route(name: &str) -> Option<EntryPoint> {
    DISPATCH
        .iter()
        .find(|(trigger, _)| *trigger == name)
        .map(|(_, entry)| *entry)
}
