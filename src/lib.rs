//! flowbatch: batch run management and manifest reprocessing for
//! remote workflow pipelines.
//!
//! This library provides a cache-backed registry of remote workflow
//! runs with filtering, sorting, and "retry since a labeled failure"
//! semantics, plus a partitioner that rebuilds per-dataset task
//! payloads from flat transfer manifests.

// Core modules
pub mod cli;
pub mod error;
pub mod manifest;
pub mod registry;

// Re-export commonly used error types
pub use error::{PartitionError, RegistryError, RetryError};
