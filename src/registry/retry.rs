//! Batch retry dispatch with per-run fault isolation.
//!
//! A batch narrows the listing (status filter, start-time sort,
//! optional since-label bound), optionally previews it for
//! confirmation, then re-submits each run from its recorded input.
//! One run failing to retry never aborts the rest; every run gets an
//! outcome in the report, in input order.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{RegistryError, RetryError};
use crate::registry::client::FlowRegistry;
use crate::registry::query::{filter_by_status, runs_since_label, sort_runs};
use crate::registry::types::{FlowRun, RunStatus, SortField, SubmittedRun};

/// Label length ceiling enforced by the flow service.
pub const LABEL_MAX_BYTES: usize = 62;

/// What happened to one run in a batch.
#[derive(Debug)]
pub enum RetryOutcome {
    /// A new run was submitted; its id and label.
    Retried { run_id: String, label: String },
    /// The retry failed; siblings were still attempted.
    Failed(RetryError),
}

impl RetryOutcome {
    pub fn is_retried(&self) -> bool {
        matches!(self, RetryOutcome::Retried { .. })
    }
}

/// Outcome of one run, keyed by the original run's id and label.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub label: String,
    pub outcome: RetryOutcome,
}

/// Report of a whole batch, outcomes in input order.
#[derive(Debug, Default)]
pub struct BatchRetryReport {
    pub outcomes: Vec<RunOutcome>,
    /// True when the preview confirmation was declined; nothing was
    /// submitted and no other side effect occurred.
    pub declined: bool,
}

impl BatchRetryReport {
    /// Number of runs successfully re-submitted.
    pub fn retried(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_retried()).count()
    }

    /// Number of runs whose retry failed.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.retried()
    }
}

/// Narrow a listing down to the runs a batch will retry.
///
/// Filters by status, sorts ascending by start time, then bounds to
/// the since-label window when given. A label miss is a user-input
/// error and aborts the whole batch before any side effect.
pub fn plan_batch(
    runs: &[FlowRun],
    status: RunStatus,
    since: Option<&str>,
) -> Result<Vec<FlowRun>, RegistryError> {
    let filtered = filter_by_status(runs, status);
    let sorted = sort_runs(&filtered, SortField::StartTime);

    match since {
        Some(label) => Ok(runs_since_label(&sorted, label)?.to_vec()),
        None => Ok(sorted),
    }
}

/// Derive the new run's label from the recorded input's hdf file name,
/// truncated to the service's label ceiling.
fn derive_label(run_id: &str, input: &serde_json::Value) -> Result<String, RetryError> {
    let hdf = input
        .pointer("/input/hdf_file")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RetryError::UnlabeledInput(run_id.to_string()))?;

    let name = Path::new(hdf)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(hdf);

    Ok(truncate_label(name))
}

/// Truncate to [`LABEL_MAX_BYTES`], backing up to a char boundary.
pub fn truncate_label(name: &str) -> String {
    if name.len() <= LABEL_MAX_BYTES {
        return name.to_string();
    }

    let mut end = LABEL_MAX_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Re-submits recorded runs, singly or in bulk.
pub struct RetryDispatcher {
    registry: FlowRegistry,
}

impl RetryDispatcher {
    /// Create a dispatcher over a registry.
    pub fn new(registry: FlowRegistry) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher submits through.
    pub fn registry(&self) -> &FlowRegistry {
        &self.registry
    }

    /// Retry a single run: fetch its recorded input, derive a label,
    /// and submit a new run with both.
    pub async fn retry_one(
        &self,
        flow_id: &str,
        run_id: &str,
        scope: Option<&str>,
    ) -> Result<SubmittedRun, RetryError> {
        let input = self.registry.run_input(flow_id, run_id, scope).await?;
        let label = derive_label(run_id, &input)?;

        let submitted = self
            .registry
            .service()
            .submit_run(flow_id, &input, &label)
            .await?;

        info!(
            run_id,
            new_run_id = %submitted.run_id,
            label = %submitted.label,
            "retried run"
        );

        Ok(submitted)
    }

    /// Retry every matching run in a listing.
    ///
    /// The narrowed set is passed to `confirm` when `preview` is on;
    /// declining aborts cleanly with zero remote calls. Otherwise the
    /// flow's scope is resolved once and each run is retried in order.
    /// Per-run failures are recorded and never stop the remaining
    /// runs. An empty narrowed set is success, not an error.
    pub async fn retry_batch<F>(
        &self,
        flow_id: &str,
        runs: &[FlowRun],
        status: RunStatus,
        since: Option<&str>,
        preview: bool,
        confirm: F,
    ) -> Result<BatchRetryReport, RetryError>
    where
        F: FnOnce(&[FlowRun]) -> bool,
    {
        let planned = plan_batch(runs, status, since)?;
        if planned.is_empty() {
            info!(flow_id, status = %status, "no matching runs to retry");
            return Ok(BatchRetryReport::default());
        }

        if preview && !confirm(&planned) {
            info!(flow_id, count = planned.len(), "batch retry declined at preview");
            return Ok(BatchRetryReport {
                outcomes: Vec::new(),
                declined: true,
            });
        }

        let scope = self
            .registry
            .service()
            .flow_scope(flow_id)
            .await
            .map_err(RetryError::from)?;

        let mut outcomes = Vec::with_capacity(planned.len());
        for run in &planned {
            let outcome = match self.retry_one(flow_id, &run.run_id, Some(&scope)).await {
                Ok(submitted) => RetryOutcome::Retried {
                    run_id: submitted.run_id,
                    label: submitted.label,
                },
                Err(err) => {
                    warn!(
                        run_id = %run.run_id,
                        label = %run.label,
                        error = %err,
                        "retry failed, continuing with remaining runs"
                    );
                    RetryOutcome::Failed(err)
                }
            };

            outcomes.push(RunOutcome {
                run_id: run.run_id.clone(),
                label: run.label.clone(),
                outcome,
            });
        }

        Ok(BatchRetryReport {
            outcomes,
            declined: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::client::{FlowService, RegistryConfig};
    use crate::registry::types::{LogEntry, RunPage};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn run(run_id: &str, label: &str, status: RunStatus, start_time: &str) -> FlowRun {
        FlowRun {
            run_id: run_id.to_string(),
            label: label.to_string(),
            status,
            start_time: start_time.to_string(),
            details: serde_json::Value::Null,
        }
    }

    /// Service fake whose log lookups fail for a chosen set of runs.
    struct FlakyService {
        failing_runs: HashSet<String>,
        scope_calls: AtomicUsize,
        submit_calls: AtomicUsize,
        submitted_labels: Mutex<Vec<String>>,
    }

    impl FlakyService {
        fn new(failing_runs: &[&str]) -> Self {
            Self {
                failing_runs: failing_runs.iter().map(|s| s.to_string()).collect(),
                scope_calls: AtomicUsize::new(0),
                submit_calls: AtomicUsize::new(0),
                submitted_labels: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FlowService for FlakyService {
        async fn list_runs(
            &self,
            _flow_id: &str,
            _marker: Option<&str>,
        ) -> Result<RunPage, RegistryError> {
            Ok(RunPage::last_page(Vec::new()))
        }

        async fn flow_scope(&self, _flow_id: &str) -> Result<String, RegistryError> {
            self.scope_calls.fetch_add(1, Ordering::SeqCst);
            Ok("scope-test".to_string())
        }

        async fn run_log(
            &self,
            _flow_id: &str,
            _scope: &str,
            run_id: &str,
        ) -> Result<Vec<LogEntry>, RegistryError> {
            if self.failing_runs.contains(run_id) {
                return Err(RegistryError::NotFound(format!("run {run_id}")));
            }
            Ok(vec![LogEntry {
                details: serde_json::json!({
                    "input": { "input": { "hdf_file": format!("/data/{run_id}/scan.hdf") } }
                }),
            }])
        }

        async fn submit_run(
            &self,
            _flow_id: &str,
            _input: &serde_json::Value,
            label: &str,
        ) -> Result<SubmittedRun, RegistryError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            self.submitted_labels
                .lock()
                .expect("labels lock")
                .push(label.to_string());
            Ok(SubmittedRun {
                run_id: format!("new-{}", self.submit_calls.load(Ordering::SeqCst)),
                label: label.to_string(),
            })
        }
    }

    fn dispatcher_in(dir: &TempDir, service: Arc<dyn FlowService>) -> RetryDispatcher {
        let config = RegistryConfig::new("https://flows.test")
            .with_cache_path(dir.path().join("runs.json"));
        RetryDispatcher::new(FlowRegistry::new(service, config))
    }

    fn failed_runs() -> Vec<FlowRun> {
        vec![
            run("r-1", "scan_1", RunStatus::Failed, "2024-03-01T00:00:00Z"),
            run("r-2", "scan_2", RunStatus::Failed, "2024-03-02T00:00:00Z"),
            run("r-3", "scan_3", RunStatus::Failed, "2024-03-03T00:00:00Z"),
        ]
    }

    #[test]
    fn test_plan_batch_filters_and_sorts() {
        let runs = vec![
            run("r-2", "B", RunStatus::Failed, "2024-03-02T00:00:00Z"),
            run("r-1", "A", RunStatus::Failed, "2024-03-01T00:00:00Z"),
            run("r-3", "C", RunStatus::Succeeded, "2024-03-03T00:00:00Z"),
        ];

        let planned = plan_batch(&runs, RunStatus::Failed, None).expect("plan");
        let ids: Vec<&str> = planned.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, ["r-1", "r-2"]);
    }

    #[test]
    fn test_plan_batch_since_miss_aborts() {
        let runs = failed_runs();
        let result = plan_batch(&runs, RunStatus::Failed, Some("nope"));
        assert!(matches!(result, Err(RegistryError::LabelNotFound { .. })));
    }

    #[test]
    fn test_truncate_label_at_ceiling() {
        let long = "x".repeat(100);
        assert_eq!(truncate_label(&long).len(), LABEL_MAX_BYTES);

        let short = "scan_42.hdf";
        assert_eq!(truncate_label(short), short);
    }

    #[test]
    fn test_truncate_label_respects_char_boundary() {
        // 31 two-byte chars: 62 bytes exactly, then one more pushes past.
        let label = "é".repeat(32);
        let truncated = truncate_label(&label);
        assert!(truncated.len() <= LABEL_MAX_BYTES);
        assert_eq!(truncated.chars().count(), 31);
    }

    #[tokio::test]
    async fn test_retry_one_derives_label_from_input() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(FlakyService::new(&[]));
        let dispatcher = dispatcher_in(&dir, service.clone());

        let submitted = dispatcher
            .retry_one("flow-1", "r-1", Some("scope-test"))
            .await
            .expect("retry");

        assert_eq!(submitted.label, "scan.hdf");
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_isolates_per_run_failures() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(FlakyService::new(&["r-2"]));
        let dispatcher = dispatcher_in(&dir, service.clone());

        let report = dispatcher
            .retry_batch(
                "flow-1",
                &failed_runs(),
                RunStatus::Failed,
                None,
                false,
                |_| true,
            )
            .await
            .expect("batch");

        // All three runs have an outcome, in input order.
        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.run_id.as_str()).collect();
        assert_eq!(ids, ["r-1", "r-2", "r-3"]);

        assert!(report.outcomes[0].outcome.is_retried());
        assert!(matches!(
            report.outcomes[1].outcome,
            RetryOutcome::Failed(RetryError::Registry(RegistryError::NotFound(_)))
        ));
        assert!(report.outcomes[2].outcome.is_retried());

        // The 2nd run's failure did not prevent the 3rd submission.
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.retried(), 2);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn test_batch_resolves_scope_once() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(FlakyService::new(&[]));
        let dispatcher = dispatcher_in(&dir, service.clone());

        dispatcher
            .retry_batch(
                "flow-1",
                &failed_runs(),
                RunStatus::Failed,
                None,
                false,
                |_| true,
            )
            .await
            .expect("batch");

        assert_eq!(service.scope_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_preview_decline_has_no_side_effects() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(FlakyService::new(&[]));
        let dispatcher = dispatcher_in(&dir, service.clone());

        let report = dispatcher
            .retry_batch(
                "flow-1",
                &failed_runs(),
                RunStatus::Failed,
                None,
                true,
                |_| false,
            )
            .await
            .expect("batch");

        assert!(report.declined);
        assert!(report.outcomes.is_empty());
        assert_eq!(service.scope_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 0);
        // No cache write either.
        assert!(!dispatcher.registry().cache().path().exists());
    }

    #[tokio::test]
    async fn test_preview_confirm_sees_planned_runs() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(FlakyService::new(&[]));
        let dispatcher = dispatcher_in(&dir, service);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        dispatcher
            .retry_batch(
                "flow-1",
                &failed_runs(),
                RunStatus::Failed,
                Some("scan_2"),
                true,
                move |planned| {
                    let mut seen = seen_clone.lock().expect("seen lock");
                    seen.extend(planned.iter().map(|r| r.run_id.clone()));
                    true
                },
            )
            .await
            .expect("batch");

        assert_eq!(*seen.lock().expect("seen lock"), ["r-2", "r-3"]);
    }

    #[tokio::test]
    async fn test_empty_batch_is_success() {
        let dir = TempDir::new().expect("tempdir");
        let service = Arc::new(FlakyService::new(&[]));
        let dispatcher = dispatcher_in(&dir, service.clone());

        let report = dispatcher
            .retry_batch("flow-1", &[], RunStatus::Failed, None, false, |_| true)
            .await
            .expect("batch");

        assert!(report.outcomes.is_empty());
        assert!(!report.declined);
        assert_eq!(service.scope_calls.load(Ordering::SeqCst), 0);
    }
}
