//! Common types for the run registry.
//!
//! Defines the run record as the flow service reports it, the page
//! shape of the paginated listing, and the enumerated fields runs can
//! be sorted by.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Status of a remote workflow run.
///
/// The service may grow new statuses; anything unrecognized
/// deserializes to `Other` rather than failing the whole listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Active,
    Inactive,
    #[serde(other)]
    Other,
}

impl RunStatus {
    /// Wire-format name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
            RunStatus::Active => "ACTIVE",
            RunStatus::Inactive => "INACTIVE",
            RunStatus::Other => "OTHER",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            "ACTIVE" => Ok(RunStatus::Active),
            "INACTIVE" => Ok(RunStatus::Inactive),
            other => Err(format!(
                "unrecognized run status '{other}' (expected SUCCEEDED, FAILED, ACTIVE, or INACTIVE)"
            )),
        }
    }
}

/// One historical or in-flight execution of a flow.
///
/// `run_id` is unique within a flow; `label` is a short human string
/// and may repeat across runs (repeated retries of the same dataset
/// share a label). Extra server fields are kept opaquely in `details`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    /// Opaque identifier, unique per execution.
    pub run_id: String,

    /// Human-assigned short name, not unique.
    #[serde(default)]
    pub label: String,

    /// Current status as reported by the service.
    pub status: RunStatus,

    /// Submission timestamp as the service renders it. Server
    /// timestamps are ISO 8601, so lexicographic order is time order.
    #[serde(default)]
    pub start_time: String,

    /// Remainder of the server record, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// One page of the remote run listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunPage {
    /// Runs in this page, in server-returned order.
    #[serde(default)]
    pub runs: Vec<FlowRun>,

    /// Whether further pages exist.
    #[serde(default)]
    pub has_more: bool,

    /// Continuation marker for the next page, when `has_more`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

impl RunPage {
    /// A page carrying everything, with no continuation.
    pub fn last_page(runs: Vec<FlowRun>) -> Self {
        Self {
            runs,
            has_more: false,
            next_marker: None,
        }
    }
}

/// One entry of a run's action/execution log.
///
/// The first entry's `details.input` is the original submission input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub details: serde_json::Value,
}

/// Acknowledgement of a newly submitted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedRun {
    pub run_id: String,
    pub label: String,
}

/// Run fields recognized for sorting and csv output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Status,
    RunId,
    Label,
    StartTime,
}

impl SortField {
    /// Field name as it appears in csv headers and CLI flags.
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::Status => "status",
            SortField::RunId => "run_id",
            SortField::Label => "label",
            SortField::StartTime => "start_time",
        }
    }

    /// The sort key this field extracts from a run.
    pub fn key<'a>(&self, run: &'a FlowRun) -> &'a str {
        match self {
            SortField::Status => run.status.as_str(),
            SortField::RunId => &run.run_id,
            SortField::Label => &run.label,
            SortField::StartTime => &run.start_time,
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SortField {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(SortField::Status),
            "run_id" => Ok(SortField::RunId),
            "label" => Ok(SortField::Label),
            "start_time" => Ok(SortField::StartTime),
            other => Err(RegistryError::UnknownSortField(other.to_string())),
        }
    }
}
