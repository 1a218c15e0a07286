//! Clients for the remote flow automation service.
//!
//! `FlowService` is the seam between the registry and the remote
//! service; `HttpFlowClient` is the production implementation over
//! HTTP, and tests substitute in-process fakes. `FlowRegistry` layers
//! the run cache and pagination on top of whichever service it is
//! given.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::RegistryError;
use crate::registry::cache::RunCache;
use crate::registry::types::{FlowRun, LogEntry, RunPage, SubmittedRun};

/// Default flow service endpoint.
pub const DEFAULT_API_BASE: &str = "https://flows.flowbatch.dev/v1";

/// Request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default cache time-to-live in seconds.
const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Configuration for the run registry.
///
/// An explicit value passed into constructors; there are no
/// process-wide cache-path or TTL globals.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Base URL of the flow service.
    pub api_base: String,
    /// Path of the persisted run cache file.
    pub cache_path: PathBuf,
    /// Maximum cache age before a listing is refetched.
    pub cache_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            cache_path: std::env::temp_dir().join("flowbatch-runs.json"),
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
        }
    }
}

impl RegistryConfig {
    /// Create a configuration against a specific service endpoint.
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            ..Default::default()
        }
    }

    /// Key the cache file to a flow, so listings of different flows do
    /// not overwrite each other.
    pub fn keyed_to_flow(mut self, flow_id: &str) -> Self {
        let safe: String = flow_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect();
        self.cache_path = std::env::temp_dir().join(format!("flowbatch-{safe}-runs.json"));
        self
    }

    /// Set the cache file path.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = path.into();
        self
    }

    /// Set the cache time-to-live.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Remote flow service operations the registry depends on.
#[async_trait]
pub trait FlowService: Send + Sync {
    /// Fetch one page of the run listing for a flow.
    async fn list_runs(
        &self,
        flow_id: &str,
        marker: Option<&str>,
    ) -> Result<RunPage, RegistryError>;

    /// Resolve the authorization scope of a flow.
    async fn flow_scope(&self, flow_id: &str) -> Result<String, RegistryError>;

    /// Fetch the action/execution log of a run.
    async fn run_log(
        &self,
        flow_id: &str,
        scope: &str,
        run_id: &str,
    ) -> Result<Vec<LogEntry>, RegistryError>;

    /// Submit a new run of a flow with the given input and label.
    async fn submit_run(
        &self,
        flow_id: &str,
        input: &serde_json::Value,
        label: &str,
    ) -> Result<SubmittedRun, RegistryError>;
}

/// HTTP implementation of [`FlowService`].
pub struct HttpFlowClient {
    /// HTTP client for API requests.
    http_client: Client,
    /// Base URL of the flow service.
    api_base: String,
    /// Optional bearer token for authenticated deployments.
    token: Option<String>,
}

/// Flow description returned by the service; only the scope matters here.
#[derive(Debug, Deserialize)]
struct FlowDescription {
    scope: String,
}

/// Log response wrapper.
#[derive(Debug, Deserialize)]
struct RunLogResponse {
    #[serde(default)]
    entries: Vec<LogEntry>,
}

impl HttpFlowClient {
    /// Create a client against the given service endpoint.
    pub fn new(api_base: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .expect("Failed to build HTTP client"),
            api_base: api_base.into(),
            token,
        }
    }

    /// Get the base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {token}")),
            None => builder,
        }
    }

    /// Map non-success statuses to distinguishable error kinds so
    /// callers can decide whether a fetch is worth retrying.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, RegistryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());

        Err(match status.as_u16() {
            401 | 403 => RegistryError::Auth(format!("{status}: {body}")),
            404 => RegistryError::NotFound(body),
            _ => RegistryError::InvalidResponse(format!("status {status}: {body}")),
        })
    }
}

#[async_trait]
impl FlowService for HttpFlowClient {
    async fn list_runs(
        &self,
        flow_id: &str,
        marker: Option<&str>,
    ) -> Result<RunPage, RegistryError> {
        let mut url = format!(
            "{}/flows/{}/runs",
            self.api_base,
            urlencoding::encode(flow_id)
        );
        if let Some(marker) = marker {
            url.push_str(&format!("?marker={}", urlencoding::encode(marker)));
        }

        let response = self
            .request(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(format!("failed to parse run listing: {e}")))
    }

    async fn flow_scope(&self, flow_id: &str) -> Result<String, RegistryError> {
        let url = format!("{}/flows/{}", self.api_base, urlencoding::encode(flow_id));

        let response = self
            .request(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        let description: FlowDescription = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| {
                RegistryError::InvalidResponse(format!("failed to parse flow description: {e}"))
            })?;

        Ok(description.scope)
    }

    async fn run_log(
        &self,
        flow_id: &str,
        scope: &str,
        run_id: &str,
    ) -> Result<Vec<LogEntry>, RegistryError> {
        let url = format!(
            "{}/flows/{}/runs/{}/log?scope={}",
            self.api_base,
            urlencoding::encode(flow_id),
            urlencoding::encode(run_id),
            urlencoding::encode(scope)
        );

        let response = self
            .request(self.http_client.get(&url))
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        let log: RunLogResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| RegistryError::InvalidResponse(format!("failed to parse run log: {e}")))?;

        Ok(log.entries)
    }

    async fn submit_run(
        &self,
        flow_id: &str,
        input: &serde_json::Value,
        label: &str,
    ) -> Result<SubmittedRun, RegistryError> {
        let url = format!("{}/flows/{}/run", self.api_base, urlencoding::encode(flow_id));
        let body = serde_json::json!({ "input": input, "label": label });

        let response = self
            .request(self.http_client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| RegistryError::Network(e.to_string()))?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| {
                RegistryError::InvalidResponse(format!("failed to parse submission response: {e}"))
            })
    }
}

/// Cache-backed view of a flow's complete run listing.
pub struct FlowRegistry {
    service: Arc<dyn FlowService>,
    cache: RunCache,
    config: RegistryConfig,
}

impl FlowRegistry {
    /// Create a registry over the given service and configuration.
    pub fn new(service: Arc<dyn FlowService>, config: RegistryConfig) -> Self {
        let cache = RunCache::new(config.cache_path.clone());
        Self {
            service,
            cache,
            config,
        }
    }

    /// The underlying service, shared with the retry dispatcher.
    pub fn service(&self) -> &Arc<dyn FlowService> {
        &self.service
    }

    /// The backing run cache.
    pub fn cache(&self) -> &RunCache {
        &self.cache
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Fetch the complete run listing of a flow.
    ///
    /// With `use_cache`, a fresh cached listing is returned without
    /// contacting the service. Otherwise every page is fetched in
    /// server order, following continuation markers until the listing
    /// is exhausted, and the cache is overwritten with the full
    /// result. Pages already fetched are discarded on error; the cache
    /// is never partially written.
    pub async fn list_runs(
        &self,
        flow_id: &str,
        use_cache: bool,
    ) -> Result<Vec<FlowRun>, RegistryError> {
        if use_cache && self.cache.is_fresh(self.config.cache_ttl) {
            let entry = self.cache.load();
            debug!(runs = entry.runs.len(), "serving run listing from cache");
            return Ok(entry.runs);
        }

        let first = self.service.list_runs(flow_id, None).await?;
        let mut runs = first.runs;
        let mut has_more = first.has_more;
        let mut marker = first.next_marker;

        while has_more {
            let m = marker.ok_or_else(|| {
                RegistryError::InvalidResponse(
                    "listing reports more pages but no continuation marker".to_string(),
                )
            })?;
            let page = self.service.list_runs(flow_id, Some(&m)).await?;
            runs.extend(page.runs);
            has_more = page.has_more;
            marker = page.next_marker;
        }

        self.cache.save(&runs)?;
        info!(flow_id, runs = runs.len(), "fetched full run listing");

        Ok(runs)
    }

    /// Fetch the input document a run was originally submitted with.
    ///
    /// Resolves the flow's scope when none is supplied, then reads the
    /// run's action log; the first entry's recorded input is the
    /// original submission. A run with no log entries cannot be
    /// replayed and fails with [`RegistryError::RunNotFound`].
    pub async fn run_input(
        &self,
        flow_id: &str,
        run_id: &str,
        scope: Option<&str>,
    ) -> Result<serde_json::Value, RegistryError> {
        let scope = match scope {
            Some(scope) => scope.to_string(),
            None => self.service.flow_scope(flow_id).await?,
        };

        let entries = self.service.run_log(flow_id, &scope, run_id).await?;
        let first = entries
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::RunNotFound(run_id.to_string()))?;

        first
            .details
            .get("input")
            .cloned()
            .ok_or_else(|| {
                RegistryError::InvalidResponse(format!(
                    "first log entry for run '{run_id}' has no recorded input"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::types::RunStatus;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn sample_run(run_id: &str) -> FlowRun {
        FlowRun {
            run_id: run_id.to_string(),
            label: format!("label-{run_id}"),
            status: RunStatus::Failed,
            start_time: "2024-03-01T10:00:00Z".to_string(),
            details: serde_json::Value::Null,
        }
    }

    /// Service fake that replays a scripted sequence of listing pages.
    struct ScriptedService {
        pages: Mutex<VecDeque<Result<RunPage, RegistryError>>>,
        list_calls: AtomicUsize,
    }

    impl ScriptedService {
        fn new(pages: Vec<Result<RunPage, RegistryError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into_iter().collect()),
                list_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl FlowService for ScriptedService {
        async fn list_runs(
            &self,
            _flow_id: &str,
            _marker: Option<&str>,
        ) -> Result<RunPage, RegistryError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.pages
                .lock()
                .expect("pages lock")
                .pop_front()
                .expect("scripted service ran out of pages")
        }

        async fn flow_scope(&self, _flow_id: &str) -> Result<String, RegistryError> {
            Ok("scope-test".to_string())
        }

        async fn run_log(
            &self,
            _flow_id: &str,
            _scope: &str,
            run_id: &str,
        ) -> Result<Vec<LogEntry>, RegistryError> {
            if run_id == "empty-log" {
                return Ok(Vec::new());
            }
            Ok(vec![LogEntry {
                details: serde_json::json!({ "input": { "input": { "hdf_file": "/data/a.hdf" } } }),
            }])
        }

        async fn submit_run(
            &self,
            _flow_id: &str,
            _input: &serde_json::Value,
            label: &str,
        ) -> Result<SubmittedRun, RegistryError> {
            Ok(SubmittedRun {
                run_id: "new-run".to_string(),
                label: label.to_string(),
            })
        }
    }

    fn registry_in(dir: &TempDir, service: Arc<dyn FlowService>) -> FlowRegistry {
        let config = RegistryConfig::new("https://flows.test")
            .with_cache_path(dir.path().join("runs.json"));
        FlowRegistry::new(service, config)
    }

    #[tokio::test]
    async fn test_pagination_concatenates_all_pages_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(vec![
            Ok(RunPage {
                runs: vec![sample_run("r-1"), sample_run("r-2")],
                has_more: true,
                next_marker: Some("m-1".to_string()),
            }),
            Ok(RunPage {
                runs: vec![sample_run("r-3")],
                has_more: true,
                next_marker: Some("m-2".to_string()),
            }),
            Ok(RunPage::last_page(vec![sample_run("r-4")])),
        ]));

        let registry = registry_in(&dir, service.clone());
        let runs = registry.list_runs("flow-1", false).await.expect("list");

        let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, ["r-1", "r-2", "r-3", "r-4"]);
        assert_eq!(service.list_calls.load(Ordering::SeqCst), 3);

        // Full listing was cached.
        assert_eq!(registry.cache().load().runs.len(), 4);
    }

    #[tokio::test]
    async fn test_fetch_error_discards_partial_pages() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(vec![
            Ok(RunPage {
                runs: vec![sample_run("r-1")],
                has_more: true,
                next_marker: Some("m-1".to_string()),
            }),
            Err(RegistryError::Network("connection reset".to_string())),
        ]));

        let registry = registry_in(&dir, service);
        let result = registry.list_runs("flow-1", false).await;

        assert!(matches!(result, Err(RegistryError::Network(_))));
        // No partial cache write.
        assert!(!registry.cache().path().exists());
    }

    #[tokio::test]
    async fn test_missing_marker_is_invalid_response() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(vec![Ok(RunPage {
            runs: vec![sample_run("r-1")],
            has_more: true,
            next_marker: None,
        })]));

        let registry = registry_in(&dir, service);
        let result = registry.list_runs("flow-1", false).await;

        assert!(matches!(result, Err(RegistryError::InvalidResponse(_))));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_service() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(Vec::new()));

        let registry = registry_in(&dir, service.clone());
        registry.cache().save(&[sample_run("r-1")]).expect("seed");

        let runs = registry.list_runs("flow-1", true).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert_eq!(service.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_disabled_refetches() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(vec![Ok(RunPage::last_page(vec![
            sample_run("r-2"),
        ]))]));

        let registry = registry_in(&dir, service.clone());
        registry.cache().save(&[sample_run("r-1")]).expect("seed");

        let runs = registry.list_runs("flow-1", false).await.expect("list");
        assert_eq!(runs[0].run_id, "r-2");
        assert_eq!(service.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_input_reads_first_log_entry() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(Vec::new()));

        let registry = registry_in(&dir, service);
        let input = registry
            .run_input("flow-1", "r-1", None)
            .await
            .expect("input");

        assert_eq!(
            input.pointer("/input/hdf_file").and_then(|v| v.as_str()),
            Some("/data/a.hdf")
        );
    }

    #[tokio::test]
    async fn test_run_input_empty_log_is_run_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(ScriptedService::new(Vec::new()));

        let registry = registry_in(&dir, service);
        let result = registry.run_input("flow-1", "empty-log", None).await;

        assert!(matches!(result, Err(RegistryError::RunNotFound(id)) if id == "empty-log"));
    }

    #[test]
    fn test_config_keyed_to_flow_sanitizes() {
        let config = RegistryConfig::default().keyed_to_flow("flow/1:prod");
        let name = config
            .cache_path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("file name");
        assert_eq!(name, "flowbatch-flow-1-prod-runs.json");
    }
}
