//! Key/value channel shared with relation peers
//!
//! Each relation endpoint carries one databag published by this unit and one
//! per remote unit. Clients read remote databags and publish into the local
//! one; the transport that moves databags between peers is outside this
//! crate.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use pdcsi_common::Error;

/// String key/value data published by one side of a relation
pub type Databag = BTreeMap<String, String>;

/// Current contents of one relation endpoint
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Data published by this unit
    #[serde(default)]
    pub local: Databag,
    /// Data published by each remote unit, keyed by unit name
    #[serde(default)]
    pub units: BTreeMap<String, Databag>,
}

impl Relation {
    /// Databag of the first remote unit (by name), if any unit has joined
    pub fn first_unit(&self) -> Option<&Databag> {
        self.units.values().next()
    }
}

/// Access to relation databags
pub trait RelationChannel: Send + Sync {
    /// Snapshot of an endpoint, `None` when no relation is established
    fn relation(&self, endpoint: &str) -> Result<Option<Relation>, Error>;

    /// Merge `keyvals` into this unit's databag on `endpoint`
    fn publish(&self, endpoint: &str, keyvals: Databag) -> Result<(), Error>;
}

fn no_relation(endpoint: &str) -> Error {
    Error::internal_with_context("relation", format!("no {} relation to publish to", endpoint))
}

/// Relation data kept in a JSON file shared with the event harness.
///
/// The file maps endpoint name to [`Relation`]. The harness owns remote
/// databags; this unit only rewrites its local ones.
pub struct FileRelationChannel {
    path: PathBuf,
}

impl FileRelationChannel {
    /// Use the relation file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<BTreeMap<String, Relation>, Error> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| Error::io(&self.path, e))?;
        serde_json::from_str(&data).map_err(|e| {
            Error::serialization(format!("failed to parse {}: {}", self.path.display(), e))
        })
    }
}

impl RelationChannel for FileRelationChannel {
    fn relation(&self, endpoint: &str) -> Result<Option<Relation>, Error> {
        Ok(self.load()?.remove(endpoint))
    }

    fn publish(&self, endpoint: &str, keyvals: Databag) -> Result<(), Error> {
        let mut relations = self.load()?;
        let relation = relations
            .get_mut(endpoint)
            .ok_or_else(|| no_relation(endpoint))?;
        debug!(endpoint, keys = ?keyvals.keys().collect::<Vec<_>>(), "publishing relation data");
        relation.local.extend(keyvals);

        let data = serde_json::to_vec_pretty(&relations)?;
        pdcsi_common::fs::write_atomic(&self.path, &data, None)
    }
}

/// In-process relation data, for embedding and tests
#[derive(Default)]
pub struct MemoryRelationChannel {
    relations: RwLock<BTreeMap<String, Relation>>,
}

impl MemoryRelationChannel {
    /// Create a channel with no relations
    pub fn new() -> Self {
        Self::default()
    }

    /// Establish an empty relation on `endpoint` if none exists
    pub fn join(&self, endpoint: &str) {
        self.relations
            .write()
            .entry(endpoint.to_string())
            .or_default();
    }

    /// Replace the databag a remote unit published, establishing the relation
    pub fn set_remote(&self, endpoint: &str, unit: &str, data: Databag) {
        self.relations
            .write()
            .entry(endpoint.to_string())
            .or_default()
            .units
            .insert(unit.to_string(), data);
    }

    /// Remove the relation entirely
    pub fn depart(&self, endpoint: &str) {
        self.relations.write().remove(endpoint);
    }

    /// What this unit has published on `endpoint`
    pub fn local(&self, endpoint: &str) -> Databag {
        self.relations
            .read()
            .get(endpoint)
            .map(|r| r.local.clone())
            .unwrap_or_default()
    }
}

impl RelationChannel for MemoryRelationChannel {
    fn relation(&self, endpoint: &str) -> Result<Option<Relation>, Error> {
        Ok(self.relations.read().get(endpoint).cloned())
    }

    fn publish(&self, endpoint: &str, keyvals: Databag) -> Result<(), Error> {
        let mut relations = self.relations.write();
        let relation = relations
            .get_mut(endpoint)
            .ok_or_else(|| no_relation(endpoint))?;
        relation.local.extend(keyvals);
        Ok(())
    }
}

/// Build a databag from string pairs
pub fn databag<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Databag {
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
