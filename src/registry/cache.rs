//! Persisted snapshot of a remote run listing.
//!
//! The cache is a single JSON file holding the last full listing plus
//! the epoch second it was fetched. It survives across invocations so
//! repeated batch commands do not re-page through the remote listing.
//! There is no locking: the file is a single-writer artifact scoped to
//! one invocation, and racing writers resolve to last-write-wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::RegistryError;
use crate::registry::types::FlowRun;

/// A point-in-time snapshot of the run listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCacheEntry {
    /// Runs in fetch order (server order, not necessarily sorted).
    #[serde(default)]
    pub runs: Vec<FlowRun>,

    /// Epoch second the listing was fetched; 0 means "never".
    #[serde(default)]
    pub timestamp: i64,
}

impl RunCacheEntry {
    /// Whether this entry has ever been populated.
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0 && self.runs.is_empty()
    }
}

/// File-backed run cache.
///
/// Staleness does not invalidate data: a stale entry is simply not
/// eligible for reuse, and callers decide whether to force a refetch.
#[derive(Debug, Clone)]
pub struct RunCache {
    path: PathBuf,
}

impl RunCache {
    /// Create a cache handle for the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the persisted entry.
    ///
    /// A missing, unreadable, or corrupt file yields an empty entry
    /// rather than an error; the caller falls through to a fresh fetch.
    pub fn load(&self) -> RunCacheEntry {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(_) => return RunCacheEntry::default(),
        };

        match serde_json::from_str(&contents) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "run cache is corrupt, treating as empty"
                );
                RunCacheEntry::default()
            }
        }
    }

    /// Overwrite the persisted entry wholesale with `{runs, now}`.
    ///
    /// Writes to a temp file in the same directory and renames it over
    /// the target, so readers never observe a half-written entry.
    pub fn save(&self, runs: &[FlowRun]) -> Result<(), RegistryError> {
        let entry = RunCacheEntry {
            runs: runs.to_vec(),
            timestamp: Utc::now().timestamp(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_string(&entry)?)?;
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    /// Age of the persisted entry, or `None` if never populated.
    pub fn age(&self) -> Option<Duration> {
        let entry = self.load();
        if entry.timestamp <= 0 {
            return None;
        }

        let elapsed = Utc::now().timestamp().saturating_sub(entry.timestamp);
        Some(Duration::from_secs(elapsed.max(0) as u64))
    }

    /// Whether the persisted entry is younger than `ttl`.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age().map(|age| age < ttl).unwrap_or(false)
    }
}
