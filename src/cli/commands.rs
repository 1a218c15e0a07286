//! CLI command definitions for flowbatch.
//!
//! Four batch-status commands (`csv`, `summary`, `retry-run`,
//! `retry-runs`) operate on a flow's run listing; `partition` converts
//! a transfer manifest (or an already-transferred tree) into
//! per-dataset task parameter files.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use tracing::info;

use crate::manifest::client::DEFAULT_API_BASE as DEFAULT_MANIFEST_BASE;
use crate::manifest::{
    destination_root, partition, scan_local_tree, HttpManifestClient, ManifestService,
    PartitionOptions, DEFAULT_SUFFIXES,
};
use crate::registry::client::DEFAULT_API_BASE as DEFAULT_FLOWS_BASE;
use crate::registry::{
    runs_csv, sort_runs, status_summary, FlowRegistry, HttpFlowClient, RegistryConfig,
    RetryDispatcher, RetryOutcome, RunStatus, SortField,
};

/// Default base URL for human-facing run links.
const DEFAULT_RUN_URL_BASE: &str = "https://app.flowbatch.dev/runs";

/// Batch run management and manifest reprocessing for remote workflow pipelines.
#[derive(Parser)]
#[command(name = "flowbatch")]
#[command(about = "Batch run management and manifest reprocessing for remote workflow pipelines")]
#[command(version)]
#[command(
    long_about = "flowbatch operates batches of remote workflow runs: dump and summarize a flow's run history, re-dispatch failed runs in bulk, and rebuild per-dataset reprocessing payloads from transfer manifests.\n\nExample usage:\n  flowbatch retry-runs --flow my-flow --status FAILED --since scan_0042.hdf --preview"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Re-use the run listing fetched by the last invocation when it is still fresh.
    #[arg(long, global = true)]
    pub cached: bool,

    /// Maximum run-cache age in seconds before a fresh listing is fetched.
    #[arg(long, default_value = "3600", global = true)]
    pub cache_ttl: u64,

    /// Base URL of the flow service.
    #[arg(long, env = "FLOWBATCH_API_BASE", default_value = DEFAULT_FLOWS_BASE, global = true)]
    pub api_base: String,

    /// Bearer token for the flow service.
    #[arg(long, env = "FLOWBATCH_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Dump a sorted csv summary of every run of a flow.
    Csv(CsvArgs),

    /// Print a histogram of run statuses for a flow.
    Summary(SummaryArgs),

    /// Retry a single run by id.
    RetryRun(RetryRunArgs),

    /// Retry every matching run, optionally from a labeled run onward.
    ///
    /// Individual retry failures are reported and do not stop the
    /// remaining runs; a --since label that matches no run aborts the
    /// whole batch before anything is submitted.
    RetryRuns(RetryRunsArgs),

    /// Convert a transfer manifest into per-dataset task parameter files.
    Partition(PartitionArgs),
}

/// Arguments for the csv command.
#[derive(Parser, Debug)]
pub struct CsvArgs {
    /// Flow id to use.
    #[arg(long)]
    pub flow: String,

    /// Run field to sort by (status, run_id, label, start_time).
    #[arg(long, default_value = "start_time")]
    pub sort_field: String,
}

/// Arguments for the summary command.
#[derive(Parser, Debug)]
pub struct SummaryArgs {
    /// Flow id to use.
    #[arg(long)]
    pub flow: String,
}

/// Arguments for the retry-run command.
#[derive(Parser, Debug)]
pub struct RetryRunArgs {
    /// Run to retry.
    #[arg(long)]
    pub run: String,

    /// Flow id to use.
    #[arg(long)]
    pub flow: String,

    /// Base URL for printed run links.
    #[arg(long, default_value = DEFAULT_RUN_URL_BASE)]
    pub run_url_base: String,
}

/// Arguments for the retry-runs command.
#[derive(Parser, Debug)]
pub struct RetryRunsArgs {
    /// Flow id to use.
    #[arg(long)]
    pub flow: String,

    /// Status of the runs to retry.
    #[arg(long, default_value = "FAILED")]
    pub status: String,

    /// Re-run all matching runs since the labeled run.
    #[arg(long)]
    pub since: Option<String>,

    /// Show the matching runs and ask for confirmation before submitting.
    #[arg(long)]
    pub preview: bool,

    /// Assume yes at the preview confirmation (for scripting).
    #[arg(long)]
    pub yes: bool,

    /// Base URL for printed run links.
    #[arg(long, default_value = DEFAULT_RUN_URL_BASE)]
    pub run_url_base: String,
}

/// Arguments for the partition command.
#[derive(Parser, Debug)]
pub struct PartitionArgs {
    /// Manifest id to convert.
    #[arg(long, conflicts_with = "from_dir")]
    pub manifest: Option<String>,

    /// Walk an already-transferred tree instead of fetching a manifest.
    #[arg(long)]
    pub from_dir: Option<PathBuf>,

    /// Transfer destination URL or local path the manifest landed in.
    #[arg(long)]
    pub destination: Option<String>,

    /// Base URL of the manifest service.
    #[arg(long, env = "FLOWBATCH_MANIFEST_BASE", default_value = DEFAULT_MANIFEST_BASE)]
    pub manifest_base: String,

    /// Q-map file name within each dataset directory.
    #[arg(long, default_value = "qmap.h5")]
    pub qmap: String,

    /// Correlation executable location, passed through to tasks.
    #[arg(long, default_value = "corr")]
    pub corr_loc: String,

    /// Suffix appended to reprocessed outputs, passed through to tasks.
    #[arg(long, default_value = "reprocessed")]
    pub reprocessing_suffix: String,

    /// File suffix to keep (repeatable; defaults to hdf, imm, bin).
    #[arg(long = "suffix")]
    pub suffixes: Vec<String>,

    /// Plan metadata-file repairs without touching the filesystem.
    #[arg(long)]
    pub dry_run: bool,
}

/// Parse CLI arguments from the process environment.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse and run in one step.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Execute the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Csv(args) => cmd_csv(&cli, args).await,
        Commands::Summary(args) => cmd_summary(&cli, args).await,
        Commands::RetryRun(args) => cmd_retry_run(&cli, args).await,
        Commands::RetryRuns(args) => cmd_retry_runs(&cli, args).await,
        Commands::Partition(args) => cmd_partition(args).await,
    }
}

fn build_registry(cli: &Cli, flow_id: &str) -> FlowRegistry {
    let service = Arc::new(HttpFlowClient::new(cli.api_base.clone(), cli.token.clone()));
    let config = RegistryConfig::new(cli.api_base.clone())
        .keyed_to_flow(flow_id)
        .with_cache_ttl(Duration::from_secs(cli.cache_ttl));
    FlowRegistry::new(service, config)
}

fn report_cache_age(registry: &FlowRegistry) {
    let ttl = registry.config().cache_ttl;
    match registry.cache().age() {
        Some(age) => info!(
            age_secs = age.as_secs(),
            ttl_secs = ttl.as_secs(),
            fresh = registry.cache().is_fresh(ttl),
            path = %registry.cache().path().display(),
            "re-using run cache when fresh"
        ),
        None => info!("no run cache from a previous invocation"),
    }
}

fn confirm_on_stdin(prompt: &str) -> bool {
    print!("{prompt} [y/N] ");
    let _ = io::stdout().flush();

    let mut line = String::new();
    if io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

async fn cmd_csv(cli: &Cli, args: &CsvArgs) -> anyhow::Result<()> {
    let field: SortField = args.sort_field.parse()?;
    let registry = build_registry(cli, &args.flow);
    if cli.cached {
        report_cache_age(&registry);
    }

    let runs = registry.list_runs(&args.flow, cli.cached).await?;
    println!("{}", runs_csv(&sort_runs(&runs, field)));
    Ok(())
}

async fn cmd_summary(cli: &Cli, args: &SummaryArgs) -> anyhow::Result<()> {
    let registry = build_registry(cli, &args.flow);
    if cli.cached {
        report_cache_age(&registry);
    }

    let runs = registry.list_runs(&args.flow, cli.cached).await?;
    println!("{}", status_summary(&runs));
    Ok(())
}

async fn cmd_retry_run(cli: &Cli, args: &RetryRunArgs) -> anyhow::Result<()> {
    let registry = build_registry(cli, &args.flow);
    let dispatcher = RetryDispatcher::new(registry);

    let submitted = dispatcher.retry_one(&args.flow, &args.run, None).await?;
    println!(
        "Retried {} ({}/{})",
        submitted.label, args.run_url_base, submitted.run_id
    );
    Ok(())
}

async fn cmd_retry_runs(cli: &Cli, args: &RetryRunsArgs) -> anyhow::Result<()> {
    let status: RunStatus = args.status.parse().map_err(|e: String| anyhow!(e))?;
    let registry = build_registry(cli, &args.flow);
    if cli.cached {
        report_cache_age(&registry);
    }

    let runs = registry.list_runs(&args.flow, cli.cached).await?;
    let dispatcher = RetryDispatcher::new(registry);

    let assume_yes = args.yes;
    let report = dispatcher
        .retry_batch(
            &args.flow,
            &runs,
            status,
            args.since.as_deref(),
            args.preview,
            |planned| {
                println!("{}", runs_csv(planned));
                println!("{} runs above will be restarted.", planned.len());
                assume_yes || confirm_on_stdin("Re-run the runs listed above?")
            },
        )
        .await?;

    if report.declined {
        println!("Aborted; no runs were restarted.");
        return Ok(());
    }

    for outcome in &report.outcomes {
        match &outcome.outcome {
            RetryOutcome::Retried { run_id, label } => {
                println!("Retried {label} ({}/{run_id})", args.run_url_base);
            }
            RetryOutcome::Failed(err) => {
                println!("Failed retry: {} ({}): {err}", outcome.label, outcome.run_id);
            }
        }
    }
    if report.failed() > 0 {
        println!(
            "{} of {} retries failed.",
            report.failed(),
            report.outcomes.len()
        );
    }
    Ok(())
}

async fn cmd_partition(args: &PartitionArgs) -> anyhow::Result<()> {
    let suffixes: Vec<String> = if args.suffixes.is_empty() {
        DEFAULT_SUFFIXES.iter().map(|s| s.to_string()).collect()
    } else {
        args.suffixes.clone()
    };

    let (listing, local_root) = if let Some(dir) = &args.from_dir {
        let root = args
            .destination
            .as_deref()
            .map(destination_root)
            .unwrap_or_else(|| dir.clone());
        (scan_local_tree(dir, &suffixes), root)
    } else if let Some(manifest) = &args.manifest {
        let destination = args
            .destination
            .as_deref()
            .context("--destination is required with --manifest")?;
        let client = HttpManifestClient::new(args.manifest_base.clone());
        (
            client.list_files(manifest).await?,
            destination_root(destination),
        )
    } else {
        bail!("either --manifest or --from-dir is required");
    };

    let opts = PartitionOptions::new(local_root)
        .with_qmap_file(args.qmap.clone())
        .with_corr_loc(args.corr_loc.clone())
        .with_reprocessing_suffix(args.reprocessing_suffix.clone())
        .with_suffixes(suffixes)
        .dry_run(args.dry_run);

    let outcome = partition(&listing, &opts);

    for plan in &outcome.planned_renames {
        if args.dry_run {
            println!(
                "Would rename {} -> {}",
                plan.from.display(),
                plan.to.display()
            );
        }
    }
    for group in &outcome.groups {
        println!("{}", group.parameter_file.display());
    }
    for err in &outcome.errors {
        println!("Skipped {}: {}", err.dataset, err.reason);
    }
    println!(
        "{} datasets emitted, {} skipped.",
        outcome.groups.len(),
        outcome.errors.len()
    );
    Ok(())
}
