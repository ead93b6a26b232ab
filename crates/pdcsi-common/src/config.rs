//! Operator configuration options and credential acquisition
//!
//! Options are string valued; unset and empty options are omitted rather
//! than treated as overrides. Credentials are obtained from the operator
//! trust channel first and the `cloud-sa` option second.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Credential, Error};

/// Option holding the base64 encoded service-account JSON
pub const CLOUD_SA_OPTION: &str = "cloud-sa";

const MISSING_CREDENTIALS: &str = "missing credentials; set via config";
const MISSING_TRUST: &str = "missing credentials access; grant with: juju trust";
const INVALID_TRUST: &str = "trust credentials invalid.";

/// Failure modes of the operator trust channel
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    /// The trust channel does not exist in this environment
    #[error("trust channel not available")]
    NotAvailable,
    /// The channel exists but the operator has not been granted access
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Anything else; fatal for the current trigger
    #[error("trust channel failed: {0}")]
    Failed(String),
}

/// Source of credentials granted to the operator out of band
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TrustChannel: Send + Sync {
    /// Return the raw service-account JSON granted to the operator
    async fn credential(&self) -> Result<String, TrustError>;
}

/// Trust channel backed by the `credential-get` hook tool
pub struct CredentialGetTool {
    command: String,
}

impl CredentialGetTool {
    /// Use the given executable (normally `credential-get`)
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl Default for CredentialGetTool {
    fn default() -> Self {
        Self::new("credential-get")
    }
}

#[async_trait]
impl TrustChannel for CredentialGetTool {
    async fn credential(&self) -> Result<String, TrustError> {
        use std::process::Stdio;
        use tokio::process::Command;

        let output = Command::new(&self.command)
            .arg("--format=json")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TrustError::NotAvailable,
                _ => TrustError::Failed(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.contains("permission denied") {
                return Err(TrustError::PermissionDenied(stderr));
            }
            return Err(TrustError::Failed(stderr));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| TrustError::Failed(format!("unparseable credential output: {}", e)))?;
        parsed
            .pointer("/credential/attributes/file")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| TrustError::Failed("credential output has no attributes.file".into()))
    }
}

/// The operator's configuration options
pub struct CharmConfig {
    options: BTreeMap<String, String>,
    trust: Box<dyn TrustChannel>,
}

impl CharmConfig {
    /// Create a configuration from raw options and a trust channel
    pub fn new(options: BTreeMap<String, String>, trust: Box<dyn TrustChannel>) -> Self {
        Self { options, trust }
    }

    /// Load options from a JSON or YAML file, returning empty options if missing
    pub fn load_options(path: &Path) -> Result<BTreeMap<String, String>, Error> {
        if !path.exists() {
            debug!(path = %path.display(), "no options file, using defaults");
            return Ok(BTreeMap::new());
        }
        let data = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let value = crate::yaml::parse_yaml(&data)
            .map_err(|e| Error::validation(format!("failed to parse {}: {}", path.display(), e)))?;

        let mut options = BTreeMap::new();
        if let serde_json::Value::Object(map) = value {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::Null => continue,
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                options.insert(key, value);
            }
        }
        Ok(options)
    }

    /// Option value, if set to something non-empty
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Options usable as manifest configuration.
    ///
    /// Drops the credential option and every unset or empty value.
    pub fn available_data(&self) -> BTreeMap<String, String> {
        self.options
            .iter()
            .filter(|(k, v)| k.as_str() != CLOUD_SA_OPTION && !v.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Acquire credentials.
    ///
    /// The trust channel wins when it yields anything; invalid trust
    /// credentials are reported as such. Otherwise the `cloud-sa` option is
    /// used, and the failure message explains why the trust channel could not
    /// supply credentials. Trust channel failures other than
    /// "not available" and "permission denied" are fatal.
    pub async fn credentials(&self) -> Result<Credential, Error> {
        self.credentials_or(None).await
    }

    /// Acquire credentials, using `fallback` when the operator supplied none.
    ///
    /// Credentials the operator did supply are never replaced by the
    /// fallback, even when they are invalid.
    pub async fn credentials_or(&self, fallback: Option<&Credential>) -> Result<Credential, Error> {
        match self.acquire().await? {
            Acquired::Credential(credential) => Ok(credential),
            Acquired::Absent(msg) => match fallback {
                Some(credential) => {
                    debug!("no operator credentials, using fallback");
                    Ok(credential.clone())
                }
                None => Err(Error::credentials(msg)),
            },
        }
    }

    /// Determine if configuration is valid.
    ///
    /// Returns the user-facing reason when no credentials can be acquired.
    pub async fn evaluate(&self, fallback: Option<&Credential>) -> Result<Option<String>, Error> {
        match self.credentials_or(fallback).await {
            Ok(_) => Ok(None),
            Err(Error::Credentials { message }) => Ok(Some(message)),
            Err(e) => Err(e),
        }
    }

    /// Capture the options and operator-supplied credential for one cycle.
    ///
    /// An absent credential is `None`; an invalid one is an error.
    pub async fn snapshot(&self) -> Result<ConfigSnapshot, Error> {
        let credential = match self.acquire().await? {
            Acquired::Credential(credential) => Some(credential),
            Acquired::Absent(_) => None,
        };
        Ok(ConfigSnapshot {
            data: self.available_data(),
            credential,
        })
    }

    async fn acquire(&self) -> Result<Acquired, Error> {
        let no_creds_msg = match self.trust.credential().await {
            Ok(raw) => {
                return Credential::from_json(&raw)
                    .map(Acquired::Credential)
                    .map_err(|e| {
                        warn!(error = %e, "trust credentials failed validation");
                        Error::credentials(INVALID_TRUST)
                    });
            }
            Err(TrustError::NotAvailable) => MISSING_CREDENTIALS,
            Err(TrustError::PermissionDenied(detail)) => {
                info!(detail = %detail.trim(), "trust channel denied access");
                MISSING_TRUST
            }
            Err(TrustError::Failed(detail)) => {
                return Err(Error::internal_with_context("trust", detail));
            }
        };

        let Some(configured) = self.get(CLOUD_SA_OPTION) else {
            return Ok(Acquired::Absent(no_creds_msg));
        };
        Credential::from_base64(configured)
            .map(Acquired::Credential)
            .map_err(|e| {
                debug!(error = %e, "cloud-sa option unusable");
                Error::credentials(no_creds_msg)
            })
    }
}

enum Acquired {
    Credential(Credential),
    Absent(&'static str),
}

/// Options and operator credential as seen by one reconciliation cycle
#[derive(Clone, Debug, Default)]
pub struct ConfigSnapshot {
    /// Non-empty options other than the credential option
    pub data: BTreeMap<String, String>,
    /// Credential supplied by the operator, if any
    pub credential: Option<Credential>,
}
