//! Command-line interface for flowbatch.
//!
//! Provides commands for run-listing summaries, single and batch
//! retries, and manifest-to-task partitioning.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
