//! Manifest module for rebuilding per-dataset task payloads.
//!
//! This module provides functionality for:
//! - Listing the file URLs of a transfer manifest
//! - Grouping a flat file listing into per-dataset payloads, repairing
//!   the metadata-file/directory naming mismatch, and isolating
//!   per-dataset failures to a sidecar log

pub mod client;
pub mod partition;

pub use client::{HttpManifestClient, ManifestService};
pub use partition::{
    destination_root, partition, scan_local_tree, DatasetError, DatasetGroup, DatasetParameters,
    PartitionOptions, PartitionOutcome, RenamePlan, DEFAULT_SUFFIXES,
};
