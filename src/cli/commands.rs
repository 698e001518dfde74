//! CLI command definitions for demo-forge.
//!
//! This module provides the command-line interface for running the
//! simulated demo pipeline and inspecting what runs leave on disk:
//! snapshots, persisted job metadata and state templates.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tracing::{info, warn};

use crate::pipeline::stage::Stage;
use crate::pipeline::stages::{SimulatedStage, DEFAULT_STAGE_SEQUENCE};
use crate::pipeline::PipelineConfig;
use crate::scheduler::JobStatus;
use crate::service::{DemoService, JobStatusView, RunRequest};
use crate::storage::{FixtureLoader, JobMetadataStore, SnapshotStore};

/// Default directory for stage snapshots.
const DEFAULT_SNAPSHOT_DIR: &str = "./snapshots";

/// Default directory for persisted job metadata.
const DEFAULT_METADATA_DIR: &str = "./jobs";

/// Number of log lines shown per status poll.
const STATUS_LOG_TAIL: usize = 20;

/// Orchestration core of the demo generator.
#[derive(Parser)]
#[command(name = "demo-forge")]
#[command(about = "Run and inspect multi-stage demo-generation pipelines")]
#[command(version)]
#[command(
    long_about = "demo-forge runs the demo-generation stage sequence as background jobs, tracks their progress and captures a snapshot of the pipeline state after every stage.\n\nExample usage:\n  demo-forge simulate --url https://example.com --snapshot-dir ./snapshots\n  demo-forge snapshots list --dir ./snapshots"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the pipeline with simulated stages and follow the job to the end.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),

    /// Replay one simulated stage on a captured snapshot.
    Replay(ReplayArgs),

    /// Inspect captured snapshots.
    Snapshots(SnapshotsArgs),

    /// Inspect persisted job metadata.
    Jobs(JobsArgs),

    /// Inspect state templates.
    Templates(TemplatesArgs),
}

/// Arguments for `demo-forge simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Customer website to generate the demo for.
    #[arg(short, long)]
    pub url: String,

    /// Comma-separated stage names (default: the full demo sequence).
    #[arg(long)]
    pub stages: Option<String>,

    /// Make this stage fail.
    #[arg(long)]
    pub fail_at: Option<String>,

    /// Simulated duration of each stage, in milliseconds.
    #[arg(long, default_value = "200")]
    pub delay_ms: u64,

    /// Extra context entries as key=value (repeatable).
    #[arg(short, long = "context", value_name = "KEY=VALUE")]
    pub context: Vec<String>,

    /// Directory for stage snapshots.
    #[arg(long, env = "DEMO_FORGE_SNAPSHOT_DIR")]
    pub snapshot_dir: Option<PathBuf>,

    /// Directory for persisted job metadata.
    #[arg(long, env = "DEMO_FORGE_METADATA_DIR")]
    pub metadata_dir: Option<PathBuf>,

    /// Interval between status polls, in milliseconds.
    #[arg(long, default_value = "100")]
    pub poll_ms: u64,

    /// Output the final job status as JSON instead of progress lines.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `demo-forge replay`.
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// Stage to run.
    #[arg(long)]
    pub stage: String,

    /// Run label the predecessor snapshot belongs to.
    #[arg(long)]
    pub run: String,

    /// Stage whose snapshot seeds the replay.
    #[arg(long = "from")]
    pub predecessor: String,

    /// Snapshot root directory (default: DEMO_FORGE_SNAPSHOT_DIR or ./snapshots).
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// Arguments for `demo-forge snapshots`.
#[derive(Parser, Debug)]
pub struct SnapshotsArgs {
    #[command(subcommand)]
    pub command: SnapshotsSubcommand,
}

/// Snapshot subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum SnapshotsSubcommand {
    /// List runs, or the stages captured for one run.
    List {
        /// Only list the stages of this run.
        #[arg(long)]
        run: Option<String>,

        /// Snapshot root directory.
        #[arg(long, default_value = DEFAULT_SNAPSHOT_DIR)]
        dir: PathBuf,
    },

    /// Print one snapshot.
    Show {
        run: String,
        stage: String,

        /// Snapshot root directory.
        #[arg(long, default_value = DEFAULT_SNAPSHOT_DIR)]
        dir: PathBuf,
    },
}

/// Arguments for `demo-forge jobs`.
#[derive(Parser, Debug)]
pub struct JobsArgs {
    #[command(subcommand)]
    pub command: JobsSubcommand,
}

/// Job metadata subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum JobsSubcommand {
    /// List persisted jobs.
    List {
        /// Job metadata directory.
        #[arg(long, default_value = DEFAULT_METADATA_DIR)]
        dir: PathBuf,
    },

    /// Print the persisted metadata of one job.
    Show {
        job_id: String,

        /// Job metadata directory.
        #[arg(long, default_value = DEFAULT_METADATA_DIR)]
        dir: PathBuf,
    },
}

/// Arguments for `demo-forge templates`.
#[derive(Parser, Debug)]
pub struct TemplatesArgs {
    #[command(subcommand)]
    pub command: TemplatesSubcommand,
}

/// Template subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum TemplatesSubcommand {
    /// List available templates.
    List {
        /// Template directory (default: DEMO_FORGE_TEMPLATE_DIR or ./templates).
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Print one template as a pipeline state.
    Show {
        name: String,

        /// Template directory (default: DEMO_FORGE_TEMPLATE_DIR or ./templates).
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate(args) => run_simulate_command(args).await,
        Commands::Replay(args) => run_replay_command(args).await,
        Commands::Snapshots(args) => run_snapshots_command(args).await,
        Commands::Jobs(args) => run_jobs_command(args).await,
        Commands::Templates(args) => run_templates_command(args).await,
    }
}

// ============================================================================
// Simulate
// ============================================================================

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = &args.snapshot_dir {
        config = config.with_snapshot_dir(dir);
    }
    if let Some(dir) = &args.metadata_dir {
        config = config.with_metadata_dir(dir);
    }
    config.validate()?;

    let stage_names = parse_stage_list(args.stages.as_deref())?;
    if let Some(fail_at) = &args.fail_at {
        if !stage_names.iter().any(|s| s == fail_at) {
            anyhow::bail!(
                "--fail-at '{}' is not one of the stages: {}",
                fail_at,
                stage_names.join(", ")
            );
        }
    }

    let delay = Duration::from_millis(args.delay_ms);
    let stages: Vec<Arc<dyn Stage>> = stage_names
        .iter()
        .map(|name| {
            let mut stage = SimulatedStage::named(name).with_delay(delay);
            if args.fail_at.as_deref() == Some(name.as_str()) {
                stage = stage.failing_with(format!("simulated failure in '{}'", name));
            }
            Arc::new(stage) as Arc<dyn Stage>
        })
        .collect();

    let mut request = RunRequest::new(&args.url);
    for entry in &args.context {
        let (key, value) = parse_context_entry(entry)?;
        request = request.with_context(key, value);
    }

    let shutdown_timeout = config.shutdown_timeout;
    let service = DemoService::bootstrap(config, stages).await;
    let job_id = service.create_run(request).await?;
    info!(job_id = %job_id, "Simulated run scheduled");

    if !args.json {
        println!("Job {} scheduled ({} stages)", job_id, stage_names.len());
    }

    let poll = Duration::from_millis(args.poll_ms.max(1));
    let mut last_progress = None;
    let view = loop {
        let view = service.status(&job_id, STATUS_LOG_TAIL).await?;
        if !args.json {
            let marker = (view.progress, view.current_stage.clone());
            if last_progress.as_ref() != Some(&marker) {
                print_progress(&view);
                last_progress = Some(marker);
            }
        }
        if view.is_terminal() {
            break view;
        }
        tokio::time::sleep(poll).await;
    };

    let report = service.shutdown(shutdown_timeout).await;
    if !report.aborted.is_empty() {
        warn!(aborted = report.aborted.len(), "Jobs aborted at shutdown");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_final(&view);
    }

    if view.status != JobStatus::Completed {
        anyhow::bail!(
            "Job {} failed: {}",
            job_id,
            view.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn parse_stage_list(raw: Option<&str>) -> anyhow::Result<Vec<String>> {
    let names: Vec<String> = match raw {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => DEFAULT_STAGE_SEQUENCE.iter().map(|s| s.to_string()).collect(),
    };

    if names.is_empty() {
        anyhow::bail!("--stages must name at least one stage");
    }

    let mut seen = HashSet::new();
    for name in &names {
        if !seen.insert(name.as_str()) {
            anyhow::bail!("stage '{}' is listed more than once", name);
        }
    }
    Ok(names)
}

fn parse_context_entry(entry: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = entry
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("context entry must be KEY=VALUE, got '{}'", entry))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("context entry has an empty key: '{}'", entry);
    }
    // JSON values pass through as-is; anything else is a plain string.
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

fn print_progress(view: &JobStatusView) {
    let stage = view.current_stage.as_deref().unwrap_or("-");
    println!(
        "[{:>3}%] {:<10} stage: {}",
        view.progress,
        view.status.to_string(),
        stage
    );
}

fn print_final(view: &JobStatusView) {
    println!();
    println!("Job {}: {}", view.job_id, view.status);
    for stage in &view.stages {
        let duration = stage
            .duration_ms()
            .map(|ms| format!("{} ms", ms))
            .unwrap_or_default();
        match &stage.error {
            Some(error) => println!("  {:<16} {:<12} {}", stage.name, stage.state.to_string(), error),
            None => println!(
                "  {:<16} {:<12} {}",
                stage.name,
                stage.state.to_string(),
                duration
            ),
        }
    }
    if !view.result.is_empty() {
        println!("Result:");
        for (key, value) in &view.result {
            println!("  {} = {}", key, value);
        }
    }
    if let Some(error) = &view.error {
        println!("Error: {}", error);
    }
}

// ============================================================================
// Replay
// ============================================================================

async fn run_replay_command(args: ReplayArgs) -> anyhow::Result<()> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = &args.dir {
        config = config.with_snapshot_dir(dir);
    }
    let loader = FixtureLoader::from_config(&config);
    let stage = SimulatedStage::named(&args.stage);

    let state = loader.replay(&stage, &args.run, &args.predecessor).await?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

async fn run_snapshots_command(args: SnapshotsArgs) -> anyhow::Result<()> {
    match args.command {
        SnapshotsSubcommand::List { run, dir } => {
            let store = SnapshotStore::new(dir);
            match run {
                Some(run) => {
                    for stage in store.list_stages(&run).await? {
                        println!("{}", stage);
                    }
                }
                None => {
                    for run in store.list_runs().await? {
                        let stages = store.list_stages(&run).await?;
                        println!("{}  ({} stages)", run, stages.len());
                    }
                }
            }
        }
        SnapshotsSubcommand::Show { run, stage, dir } => {
            let snapshot = SnapshotStore::new(dir).load_snapshot(&run, &stage).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }
    Ok(())
}

async fn run_jobs_command(args: JobsArgs) -> anyhow::Result<()> {
    match args.command {
        JobsSubcommand::List { dir } => {
            let store = JobMetadataStore::new(dir);
            for record in store.load_records().await? {
                println!(
                    "{}  {:<10} {:>3}%  {}",
                    record.id,
                    record.status.to_string(),
                    record.progress,
                    record.error.as_deref().unwrap_or("")
                );
            }
        }
        JobsSubcommand::Show { job_id, dir } => {
            let persisted = JobMetadataStore::new(dir).load(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&persisted)?);
        }
    }
    Ok(())
}

async fn run_templates_command(args: TemplatesArgs) -> anyhow::Result<()> {
    match args.command {
        TemplatesSubcommand::List { dir } => {
            for name in template_loader(dir)?.list_templates().await? {
                println!("{}", name);
            }
        }
        TemplatesSubcommand::Show { name, dir } => {
            let state = template_loader(dir)?.load_template(&name).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
    }
    Ok(())
}

fn template_loader(dir: Option<PathBuf>) -> anyhow::Result<FixtureLoader> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(dir) = dir {
        config = config.with_template_dir(dir);
    }
    Ok(FixtureLoader::from_config(&config))
}
