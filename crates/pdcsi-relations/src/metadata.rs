//! Instance identity from the GCE metadata server

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use pdcsi_common::Error;

/// Base URL of the GCE metadata server
pub const METADATA_URL: &str = "http://metadata.google.internal/computeMetadata/v1/";

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Name and zone of the instance this unit runs on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceIdentity {
    /// Instance name
    pub instance: String,
    /// Zone name, e.g. `us-east1-b`
    pub zone: String,
}

/// Source of instance identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Name and zone of this instance
    async fn identity(&self) -> Result<InstanceIdentity, Error>;
}

/// Metadata server client
pub struct GceMetadataClient {
    http: reqwest::Client,
    base_url: String,
}

impl GceMetadataClient {
    /// Client for the metadata server at `base_url`
    pub fn new(base_url: impl Into<String>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| Error::internal_with_context("metadata", e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    async fn fetch(&self, path: &str) -> Result<String, Error> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "querying metadata server");
        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::internal_with_context("metadata", format!("{}: {}", url, e)))?;
        let body = response
            .text()
            .await
            .map_err(|e| Error::internal_with_context("metadata", format!("{}: {}", url, e)))?;
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl MetadataClient for GceMetadataClient {
    async fn identity(&self) -> Result<InstanceIdentity, Error> {
        let instance = self.fetch("instance/name").await?;
        let zone = zone_name(&self.fetch("instance/zone").await?);
        Ok(InstanceIdentity { instance, zone })
    }
}

/// The metadata server reports `projects/<number>/zones/<zone>`
pub fn zone_name(raw: &str) -> String {
    raw.trim().rsplit('/').next().unwrap_or_default().to_string()
}
