//! Error types for flowbatch operations.
//!
//! Defines error types for the major subsystems:
//! - Run registry: listing, caching, and querying remote workflow runs
//! - Retry dispatch: re-submitting recorded runs in bulk
//! - Manifest partitioning: rebuilding per-dataset task payloads
//!
//! Per-item failures (one run in a retry batch, one dataset in a
//! partition call) are carried inside report entries rather than
//! propagated; the enums here cover everything that aborts an
//! operation outright.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while listing, caching, or querying runs.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Could not reach the flow service (connect failure, timeout).
    #[error("network error contacting the flow service: {0}")]
    Network(String),

    /// The flow service rejected our credentials or scope.
    #[error("authorization rejected by the flow service: {0}")]
    Auth(String),

    /// The flow or run does not exist on the service.
    #[error("not found on the flow service: {0}")]
    NotFound(String),

    /// The service answered with something we could not interpret.
    #[error("unexpected flow service response: {0}")]
    InvalidResponse(String),

    /// The run exists but has no recorded log entries to replay.
    #[error("run '{0}' has no recorded log entries")]
    RunNotFound(String),

    /// No run in the listing carries the requested label.
    #[error("failed to find '{label}' in {total} total runs")]
    LabelNotFound { label: String, total: usize },

    /// The requested sort field is not one of the recognized run fields.
    #[error("'{0}' is not a sortable run field (expected status, run_id, label, or start_time)")]
    UnknownSortField(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while retrying a single run.
///
/// Inside a batch these are recorded per run and never abort the
/// remaining runs; only batch setup (label lookup, scope resolution)
/// propagates out of `retry_batch`.
#[derive(Debug, Error)]
pub enum RetryError {
    /// Fetching the recorded input or submitting the new run failed.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The recorded input carries no file name to derive a label from.
    #[error("recorded input for run '{0}' has no hdf file to derive a label from")]
    UnlabeledInput(String),
}

/// Errors that can occur during manifest partitioning.
///
/// `Http`/`InvalidResponse` abort the whole call before any dataset is
/// touched. The remaining variants describe a single dataset and are
/// recorded to that dataset's error log instead of propagating.
#[derive(Debug, Error)]
pub enum PartitionError {
    /// Manifest listing request failed.
    #[error("manifest request failed: {0}")]
    Http(String),

    /// The manifest service answered with something we could not interpret.
    #[error("unexpected manifest response: {0}")]
    InvalidResponse(String),

    /// The metadata file vanished between selection and validation.
    #[error("no hdf file: {}", .0.display())]
    MissingMetadata(PathBuf),

    /// The raw data file vanished between selection and validation.
    #[error("no raw data file: {}", .0.display())]
    MissingRawData(PathBuf),

    /// Repairing the metadata file name failed on the filesystem.
    #[error("failed to rename '{}' to '{}': {}", .from.display(), .to.display(), .source)]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
