//! Client for the remote manifest service.
//!
//! A manifest enumerates the files belonging to one transfer batch;
//! all the partitioner needs from the service is the flat list of file
//! URLs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::PartitionError;

/// Default manifest service endpoint.
pub const DEFAULT_API_BASE: &str = "https://concierge.flowbatch.dev/api";

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Remote manifest operations the partitioner depends on.
#[async_trait]
pub trait ManifestService: Send + Sync {
    /// List the file URLs recorded in a manifest.
    async fn list_files(&self, manifest_id: &str) -> Result<Vec<String>, PartitionError>;
}

/// HTTP implementation of [`ManifestService`].
pub struct HttpManifestClient {
    /// HTTP client for API requests.
    http_client: Client,
    /// Base URL of the manifest service.
    api_base: String,
}

/// Manifest listing response.
#[derive(Debug, Deserialize)]
struct ManifestResponse {
    #[serde(default)]
    remote_file_manifest: Vec<ManifestFile>,
}

/// One file record within a manifest.
#[derive(Debug, Deserialize)]
struct ManifestFile {
    url: String,
}

impl HttpManifestClient {
    /// Create a client against the given service endpoint.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
            api_base: api_base.into(),
        }
    }

    /// Create a client against the default endpoint.
    pub fn default_endpoint() -> Self {
        Self::new(DEFAULT_API_BASE)
    }

    /// Get the base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

#[async_trait]
impl ManifestService for HttpManifestClient {
    async fn list_files(&self, manifest_id: &str) -> Result<Vec<String>, PartitionError> {
        let url = format!(
            "{}/manifest/{}/remote_file_manifest/",
            self.api_base,
            urlencoding::encode(manifest_id)
        );

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PartitionError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(PartitionError::Http(format!("status {status}: {body}")));
        }

        let manifest: ManifestResponse = response.json().await.map_err(|e| {
            PartitionError::InvalidResponse(format!("failed to parse manifest listing: {e}"))
        })?;

        Ok(manifest
            .remote_file_manifest
            .into_iter()
            .map(|f| f.url)
            .collect())
    }
}
