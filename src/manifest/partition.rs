//! Dataset partitioning over flat manifest listings.
//!
//! A transfer manifest is a flat list of file URLs. Datasets are
//! reconstructed by grouping files under their immediate parent
//! directory name, pairing the metadata (.hdf) file with its raw-data
//! (.imm/.bin) companion, and repairing the convention that the
//! metadata file's base name matches the dataset directory's name.
//!
//! Fault containment mirrors the retry dispatcher: one dataset failing
//! repair or validation is recorded to that dataset's error log and
//! skipped, and the remaining datasets are still emitted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::PartitionError;

/// File suffixes a manifest listing is narrowed to.
pub const DEFAULT_SUFFIXES: [&str; 3] = ["hdf", "imm", "bin"];

/// Suffix of the per-dataset metadata file.
const METADATA_SUFFIX: &str = "hdf";

/// Suffixes of the per-dataset raw data file.
const RAW_DATA_SUFFIXES: [&str; 2] = ["imm", "bin"];

/// Name of the parameter sidecar written into each dataset directory.
const PARAMETER_FILE_NAME: &str = "parameters.json";

/// Name of the per-dataset error log.
const ERROR_LOG_NAME: &str = "path_errors.log";

/// Options for one partition call.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Local directory the manifest was transferred into.
    pub local_root: PathBuf,
    /// Name of the q-map file within each dataset directory.
    pub qmap_file: String,
    /// Location of the correlation executable, passed through to tasks.
    pub corr_loc: String,
    /// Suffix appended to reprocessed outputs, passed through to tasks.
    pub reprocessing_suffix: String,
    /// Suffixes a listing is narrowed to.
    pub suffixes: Vec<String>,
    /// Plan repairs without touching the filesystem.
    pub dry_run: bool,
}

impl PartitionOptions {
    /// Create options rooted at the transfer destination.
    pub fn new(local_root: impl Into<PathBuf>) -> Self {
        Self {
            local_root: local_root.into(),
            qmap_file: "qmap.h5".to_string(),
            corr_loc: "corr".to_string(),
            reprocessing_suffix: "reprocessed".to_string(),
            suffixes: DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect(),
            dry_run: false,
        }
    }

    /// Set the q-map file name.
    pub fn with_qmap_file(mut self, name: impl Into<String>) -> Self {
        self.qmap_file = name.into();
        self
    }

    /// Set the correlation executable location.
    pub fn with_corr_loc(mut self, loc: impl Into<String>) -> Self {
        self.corr_loc = loc.into();
        self
    }

    /// Set the reprocessing suffix.
    pub fn with_reprocessing_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.reprocessing_suffix = suffix.into();
        self
    }

    /// Replace the suffix filter.
    pub fn with_suffixes(mut self, suffixes: Vec<String>) -> Self {
        self.suffixes = suffixes;
        self
    }

    /// Enable or disable dry-run mode.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// The reconstructed unit of work for one dataset.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetGroup {
    /// Dataset key: the immediate parent directory name.
    pub dataset_dir: String,
    /// Absolute processing directory under the local root.
    pub proc_dir: PathBuf,
    /// Metadata file, after repair.
    pub hdf_file: PathBuf,
    /// Raw data companion file.
    pub data_file: PathBuf,
    /// Q-map file within the processing directory.
    pub qmap_file: PathBuf,
    /// Parameter sidecar describing this group.
    pub parameter_file: PathBuf,
}

/// A dataset that failed repair or validation, with its cause.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetError {
    pub dataset: String,
    pub reason: String,
}

/// A planned metadata-file rename.
#[derive(Debug, Clone, Serialize)]
pub struct RenamePlan {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// Result of one partition call.
///
/// `groups` is materialized as a sequence but carries no ordering
/// contract: emission follows the grouping structure's iteration
/// order, which callers must treat as an unordered set.
#[derive(Debug, Default)]
pub struct PartitionOutcome {
    pub groups: Vec<DatasetGroup>,
    pub errors: Vec<DatasetError>,
    pub planned_renames: Vec<RenamePlan>,
}

/// The parameter sidecar serialized into each dataset directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetParameters {
    pub proc_dir: PathBuf,
    pub corr_loc: String,
    pub reprocessing_suffix: String,
    pub hdf_file: PathBuf,
    pub data_file: PathBuf,
    pub qmap_file: PathBuf,
    pub parameter_file: PathBuf,
}

impl DatasetParameters {
    fn from_group(group: &DatasetGroup, opts: &PartitionOptions) -> Self {
        Self {
            proc_dir: group.proc_dir.clone(),
            corr_loc: opts.corr_loc.clone(),
            reprocessing_suffix: opts.reprocessing_suffix.clone(),
            hdf_file: group.hdf_file.clone(),
            data_file: group.data_file.clone(),
            qmap_file: group.qmap_file.clone(),
            parameter_file: group.parameter_file.clone(),
        }
    }
}

/// Extract the local path of a transfer destination URL.
///
/// Plain filesystem paths pass through unchanged.
pub fn destination_root(destination: &str) -> PathBuf {
    match reqwest::Url::parse(destination) {
        Ok(url) if !url.cannot_be_a_base() => PathBuf::from(url.path()),
        _ => PathBuf::from(destination),
    }
}

/// Walk an already-transferred destination tree, producing the same
/// flat listing a manifest would, so partitioning can run without a
/// manifest service round-trip.
pub fn scan_local_tree(root: &Path, suffixes: &[String]) -> Vec<String> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().to_str().map(str::to_string))
        .filter(|path| suffixes.iter().any(|s| path.ends_with(s.as_str())))
        .collect()
}

/// Strip a URL to its `<parent_dir>/<file_name>` tail.
///
/// The manifest convention groups files by their immediate parent
/// directory; the rest of the path is discarded.
fn relative_key(url: &str) -> Option<(String, String)> {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) if !parsed.cannot_be_a_base() => parsed.path().to_string(),
        _ => url.to_string(),
    };

    let path = Path::new(&path);
    let file = path.file_name()?.to_str()?.to_string();
    let dataset = path.parent()?.file_name()?.to_str()?.to_string();
    Some((dataset, file))
}

/// Group a flat listing by dataset key, keeping only allowed suffixes.
pub fn group_datasets(file_urls: &[String], suffixes: &[String]) -> HashMap<String, Vec<String>> {
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();

    for url in file_urls {
        if !suffixes.iter().any(|s| url.ends_with(s.as_str())) {
            continue;
        }
        if let Some((dataset, file)) = relative_key(url) {
            groups.entry(dataset).or_default().push(file);
        }
    }

    groups
}

/// First listed file with one of the suffixes that exists on disk.
fn select_existing(proc_dir: &Path, files: &[String], suffixes: &[&str]) -> Option<PathBuf> {
    files
        .iter()
        .filter(|f| suffixes.iter().any(|s| f.ends_with(&format!(".{s}"))))
        .map(|f| proc_dir.join(f))
        .find(|p| p.exists())
}

/// Plan the repair of a metadata file whose base name does not match
/// its dataset directory's name. Returns `None` when no repair is
/// needed.
pub fn plan_rename(hdf: &Path, proc_dir: &Path) -> Option<RenamePlan> {
    let stem = hdf.file_stem()?.to_str()?;
    let dir_name = proc_dir.file_name()?.to_str()?;
    if stem == dir_name {
        return None;
    }

    let target = match hdf.extension().and_then(|e| e.to_str()) {
        Some(ext) => proc_dir.join(format!("{dir_name}.{ext}")),
        None => proc_dir.join(dir_name),
    };

    Some(RenamePlan {
        from: hdf.to_path_buf(),
        to: target,
    })
}

/// Apply a planned rename, overwriting any stale prior rename target.
pub fn apply_rename(plan: &RenamePlan) -> Result<(), PartitionError> {
    if plan.to.exists() {
        fs::remove_file(&plan.to).map_err(|source| PartitionError::Rename {
            from: plan.from.clone(),
            to: plan.to.clone(),
            source,
        })?;
    }

    fs::rename(&plan.from, &plan.to).map_err(|source| PartitionError::Rename {
        from: plan.from.clone(),
        to: plan.to.clone(),
        source,
    })
}

fn dataset_group(
    dataset: &str,
    proc_dir: &Path,
    hdf_file: PathBuf,
    data_file: PathBuf,
    opts: &PartitionOptions,
) -> DatasetGroup {
    DatasetGroup {
        dataset_dir: dataset.to_string(),
        proc_dir: proc_dir.to_path_buf(),
        hdf_file,
        data_file,
        qmap_file: proc_dir.join(&opts.qmap_file),
        parameter_file: proc_dir.join(PARAMETER_FILE_NAME),
    }
}

/// Repair, re-validate, and materialize one dataset.
fn finalize_dataset(
    dataset: &str,
    proc_dir: &Path,
    hdf: PathBuf,
    data_file: PathBuf,
    plan: Option<&RenamePlan>,
    opts: &PartitionOptions,
) -> Result<DatasetGroup, PartitionError> {
    let hdf = match plan {
        Some(plan) => {
            apply_rename(plan)?;
            plan.to.clone()
        }
        None => hdf,
    };

    if !hdf.exists() {
        return Err(PartitionError::MissingMetadata(hdf));
    }
    if !data_file.exists() {
        return Err(PartitionError::MissingRawData(data_file));
    }

    let group = dataset_group(dataset, proc_dir, hdf, data_file, opts);
    let params = DatasetParameters::from_group(&group, opts);
    fs::write(
        &group.parameter_file,
        serde_json::to_string_pretty(&params)?,
    )?;

    Ok(group)
}

fn write_error_log(proc_dir: &Path, reason: &str) -> std::io::Result<()> {
    fs::write(proc_dir.join(ERROR_LOG_NAME), reason)
}

/// Partition a flat file listing into per-dataset task payloads.
///
/// Datasets missing a local metadata or raw-data file at selection
/// time are dropped without an error artifact: absence is expected for
/// in-flight transfers. Failures after selection (repair, validation,
/// sidecar write) are recorded to the dataset's `path_errors.log` and
/// skip only that dataset.
pub fn partition(file_urls: &[String], opts: &PartitionOptions) -> PartitionOutcome {
    let grouped = group_datasets(file_urls, &opts.suffixes);
    let mut outcome = PartitionOutcome::default();

    for (dataset, files) in grouped {
        let proc_dir = opts.local_root.join(&dataset);

        let Some(hdf) = select_existing(&proc_dir, &files, &[METADATA_SUFFIX]) else {
            debug!(dataset = %dataset, "no metadata file on disk, dropping dataset");
            continue;
        };
        let Some(data_file) = select_existing(&proc_dir, &files, &RAW_DATA_SUFFIXES) else {
            debug!(dataset = %dataset, "no raw data file on disk, dropping dataset");
            continue;
        };

        let plan = plan_rename(&hdf, &proc_dir);

        if opts.dry_run {
            let hdf_final = plan.as_ref().map(|p| p.to.clone()).unwrap_or(hdf);
            if let Some(plan) = plan {
                outcome.planned_renames.push(plan);
            }
            outcome
                .groups
                .push(dataset_group(&dataset, &proc_dir, hdf_final, data_file, opts));
            continue;
        }

        match finalize_dataset(&dataset, &proc_dir, hdf, data_file, plan.as_ref(), opts) {
            Ok(group) => {
                if let Some(plan) = plan {
                    outcome.planned_renames.push(plan);
                }
                outcome.groups.push(group);
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(dataset = %dataset, error = %reason, "skipping dataset");
                if let Err(log_err) = write_error_log(&proc_dir, &reason) {
                    warn!(
                        dataset = %dataset,
                        error = %log_err,
                        "failed to write dataset error log"
                    );
                }
                outcome.errors.push(DatasetError { dataset, reason });
            }
        }
    }

    outcome
}
