//! Pure filtering, sorting, and rendering over run listings.
//!
//! Nothing here performs I/O; every function takes a slice of runs and
//! returns a new value, so the batch commands can be tested without a
//! service or cache.

use std::collections::BTreeMap;

use crate::error::RegistryError;
use crate::registry::types::{FlowRun, RunStatus, SortField};

/// Csv column order for run summaries.
pub const CSV_FIELDS: [SortField; 4] = [
    SortField::Status,
    SortField::RunId,
    SortField::Label,
    SortField::StartTime,
];

/// Keep only runs with the given status, preserving input order.
pub fn filter_by_status(runs: &[FlowRun], status: RunStatus) -> Vec<FlowRun> {
    runs.iter()
        .filter(|run| run.status == status)
        .cloned()
        .collect()
}

/// Sort runs ascending by a field's natural (lexicographic) order.
///
/// The sort is stable: runs comparing equal keep their input order.
pub fn sort_runs(runs: &[FlowRun], field: SortField) -> Vec<FlowRun> {
    let mut sorted = runs.to_vec();
    sorted.sort_by(|a, b| field.key(a).cmp(field.key(b)));
    sorted
}

/// All runs from the LAST occurrence of `label` to the end, inclusive.
///
/// When a dataset has been retried repeatedly under one label, the
/// caller wants everything from the most recent occurrence forward, so
/// a later failure is not excluded from a subsequent re-retry batch.
pub fn runs_since_label<'a>(
    runs: &'a [FlowRun],
    label: &str,
) -> Result<&'a [FlowRun], RegistryError> {
    let mut bounding = None;
    for (idx, run) in runs.iter().enumerate() {
        if run.label == label {
            bounding = Some(idx);
        }
    }

    match bounding {
        Some(idx) => Ok(&runs[idx..]),
        None => Err(RegistryError::LabelNotFound {
            label: label.to_string(),
            total: runs.len(),
        }),
    }
}

/// Render runs as csv, one row per run in the given order.
pub fn runs_csv(runs: &[FlowRun]) -> String {
    let header = CSV_FIELDS
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let mut lines = vec![header];
    lines.extend(runs.iter().map(|run| {
        CSV_FIELDS
            .iter()
            .map(|f| f.key(run))
            .collect::<Vec<_>>()
            .join(",")
    }));

    lines.join("\n")
}

/// Render a status histogram, e.g. `ACTIVE: 2, FAILED: 3, Total Runs: 5`.
pub fn status_summary(runs: &[FlowRun]) -> String {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for run in runs {
        *counts.entry(run.status.as_str()).or_default() += 1;
    }

    let mut parts: Vec<String> = counts
        .into_iter()
        .map(|(status, count)| format!("{status}: {count}"))
        .collect();
    parts.push(format!("Total Runs: {}", runs.len()));

    parts.join(", ")
}
