//! CLI command definitions for filter-fleet.
//!
//! Every subcommand talks to the same store. Read-only commands print JSON to
//! stdout; long-running ones (`worker`, `monitor`) log through `tracing` and
//! stop on Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::config::{FleetConfig, ScalingConfig};
use crate::filters::{self, FilterRegistry};
use crate::metrics::{self, MetricsCollector, MetricsSnapshot, SysinfoSampler};
use crate::registry::{RegistryStats, WorkerRegistry, WorkerView};
use crate::scaling::{Autoscaler, AutoscalerStatus, SwarmExecutor, DEFAULT_WORKER_ROLE};
use crate::scheduler::{
    CompletedResult, QueueStats, TaskPayload, TaskQueue, Worker, WorkerConfig,
};
use crate::store;

/// Default seconds between autoscaler cycles.
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;

/// Default milliseconds between metrics samples.
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1000;

/// Default milliseconds `results` waits for the first entry.
const DEFAULT_RESULT_WAIT_MS: u64 = 1000;

/// Wait for each result after the first.
const NEXT_RESULT_WAIT: Duration = Duration::from_millis(10);

/// Distributed image-filter worker fleet.
#[derive(Parser)]
#[command(name = "filter-fleet")]
#[command(about = "Run and operate a Redis-backed fleet of image-filter workers")]
#[command(version)]
#[command(
    long_about = "filter-fleet distributes image-filter tasks over a Redis queue to a fleet of workers,\ntracks worker liveness through heartbeats, and recommends or applies fleet resizes.\n\nExample usage:\n  filter-fleet submit --filters blur,sharpen photo.jpg\n  filter-fleet worker --capabilities blur,sharpen\n  filter-fleet monitor --interval 10"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Store URL (redis://host:port, or memory:// for an in-process store).
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// Name of the pending-task list.
    #[arg(long, env = "QUEUE_NAME", global = true)]
    pub queue_name: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker process that drains the queue.
    Worker(WorkerArgs),

    /// Run the autoscaler loop.
    Monitor(MonitorArgs),

    /// Submit a filter task.
    Submit(SubmitArgs),

    /// Show the record of one task.
    Status(StatusArgs),

    /// Show queue and registry statistics.
    Stats,

    /// List registered workers with their liveness.
    Workers(WorkersArgs),

    /// Show a metrics snapshot and the current scaling recommendation.
    Metrics(MetricsArgs),

    /// Resize the worker fleet by hand.
    Scale(ScaleArgs),

    /// Take completed results from the results list.
    Results(ResultsArgs),

    /// Delete finished tasks older than the retention period.
    Sweep(SweepArgs),

    /// Purge workers whose heartbeat is older than the cleanup age.
    Cleanup(CleanupArgs),
}

/// Arguments for `filter-fleet worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker identifier (default: worker-{unix timestamp}).
    #[arg(long, env = "WORKER_ID")]
    pub id: Option<String>,

    /// Comma-separated filters this worker handles, or "all".
    #[arg(short, long, env = "WORKER_CAPABILITIES")]
    pub capabilities: Option<String>,

    /// Port advertised in the registry.
    #[arg(long)]
    pub port: Option<u16>,

    /// Inputs used when a task names none (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub default_images: Vec<String>,

    /// Directory receiving filtered images.
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,
}

/// Arguments for `filter-fleet monitor`.
#[derive(Parser, Debug)]
pub struct MonitorArgs {
    /// Seconds between cycles.
    #[arg(short, long, default_value_t = DEFAULT_MONITOR_INTERVAL_SECS)]
    pub interval: u64,

    /// Apply decisions to the Docker swarm service instead of only reporting them.
    #[arg(long)]
    pub acting: bool,

    /// Swarm stack name prefixing the worker service.
    #[arg(long)]
    pub stack: Option<String>,

    /// Worker service role.
    #[arg(long, default_value = DEFAULT_WORKER_ROLE)]
    pub role: String,

    /// Run a single cycle, print the decision as JSON and exit.
    #[arg(long)]
    pub once: bool,
}

/// Arguments for `filter-fleet submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Filters to apply, in order (comma-separated).
    #[arg(short, long, value_delimiter = ',', required = true)]
    pub filters: Vec<String>,

    /// Per-filter parameters as a JSON object keyed by filter name.
    #[arg(short, long)]
    pub params: Option<String>,

    /// Image references to process.
    pub images: Vec<String>,
}

/// Arguments for `filter-fleet status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Task identifier returned by `submit`.
    pub task_id: Uuid,
}

/// Arguments for `filter-fleet workers`.
#[derive(Parser, Debug)]
pub struct WorkersArgs {
    /// Only list workers with a fresh heartbeat.
    #[arg(long)]
    pub active: bool,

    /// Only list workers able to run this filter.
    #[arg(long)]
    pub capability: Option<String>,
}

/// Arguments for `filter-fleet metrics`.
#[derive(Parser, Debug)]
pub struct MetricsArgs {
    /// Print Prometheus text exposition instead of JSON.
    #[arg(long)]
    pub prometheus: bool,

    /// Snapshots to take before reporting; all of them land in the history.
    #[arg(long, default_value_t = 1)]
    pub samples: usize,

    /// Milliseconds between samples.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_INTERVAL_MS)]
    pub sample_interval_ms: u64,

    /// Also write the snapshot history to this JSON file.
    #[arg(long)]
    pub export: Option<PathBuf>,
}

/// Arguments for `filter-fleet results`.
#[derive(Parser, Debug)]
pub struct ResultsArgs {
    /// Most results to take.
    #[arg(short = 'n', long, default_value_t = 10)]
    pub limit: usize,

    /// Milliseconds to wait for the first result.
    #[arg(long, default_value_t = DEFAULT_RESULT_WAIT_MS)]
    pub wait_ms: u64,
}

/// Arguments for `filter-fleet scale`.
#[derive(Parser, Debug)]
pub struct ScaleArgs {
    /// Desired number of workers.
    pub replicas: usize,

    /// Swarm stack name prefixing the worker service.
    #[arg(long)]
    pub stack: Option<String>,

    /// Worker service role.
    #[arg(long, default_value = DEFAULT_WORKER_ROLE)]
    pub role: String,
}

/// Arguments for `filter-fleet sweep`.
#[derive(Parser, Debug)]
pub struct SweepArgs {
    /// Delete finished tasks older than this many seconds (default: TASK_RETENTION_SECS).
    #[arg(long)]
    pub older_than: Option<u64>,
}

/// Arguments for `filter-fleet cleanup`.
#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Purge workers silent for this many seconds (default: WORKER_CLEANUP_SECS).
    #[arg(long)]
    pub max_age: Option<u64>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the filter-fleet CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let fleet = fleet_config(&cli)?;

    match cli.command {
        Commands::Worker(args) => run_worker_command(&fleet, args).await,
        Commands::Monitor(args) => run_monitor_command(&fleet, args).await,
        Commands::Submit(args) => run_submit_command(&fleet, args).await,
        Commands::Status(args) => run_status_command(&fleet, args).await,
        Commands::Stats => run_stats_command(&fleet).await,
        Commands::Workers(args) => run_workers_command(&fleet, args).await,
        Commands::Metrics(args) => run_metrics_command(&fleet, args).await,
        Commands::Scale(args) => run_scale_command(&fleet, args).await,
        Commands::Results(args) => run_results_command(&fleet, args).await,
        Commands::Sweep(args) => run_sweep_command(&fleet, args).await,
        Commands::Cleanup(args) => run_cleanup_command(&fleet, args).await,
    }
}

/// Environment configuration overridden by global flags.
fn fleet_config(cli: &Cli) -> anyhow::Result<FleetConfig> {
    let mut fleet = FleetConfig::from_env().context("Invalid fleet configuration")?;
    if let Some(url) = &cli.redis_url {
        fleet = fleet.with_redis_url(url.clone());
    }
    if let Some(name) = &cli.queue_name {
        fleet = fleet.with_queue_name(name.clone());
    }
    Ok(fleet)
}

struct Handles {
    queue: TaskQueue,
    registry: WorkerRegistry,
}

async fn connect(fleet: &FleetConfig) -> anyhow::Result<Handles> {
    let store = store::connect(&fleet.redis_url)
        .await
        .with_context(|| format!("Failed to connect to store at {}", fleet.redis_url))?;

    Ok(Handles {
        queue: TaskQueue::with_name(store.clone(), &fleet.queue_name),
        registry: WorkerRegistry::new(store).with_worker_timeout(fleet.worker_timeout),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}

/// Flips to `true` on Ctrl-C or SIGTERM.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = tx.send(true);
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn build_autoscaler(fleet: &FleetConfig, handles: Handles) -> anyhow::Result<Autoscaler> {
    let scaling = ScalingConfig::from_env().context("Invalid scaling configuration")?;
    let collector = MetricsCollector::new(
        handles.queue,
        handles.registry,
        Arc::new(SysinfoSampler::new()),
    );
    let autoscaler = Autoscaler::new(collector, scaling)?;
    tracing::debug!(queue = %fleet.queue_name, "Autoscaler ready");
    Ok(autoscaler)
}

fn swarm_executor(stack: Option<String>) -> anyhow::Result<Arc<SwarmExecutor>> {
    let mut executor = SwarmExecutor::new()?;
    if let Some(stack) = stack {
        executor = executor.with_stack(stack);
    }
    Ok(Arc::new(executor))
}

// ============================================================================
// Long-running commands
// ============================================================================

async fn run_worker_command(fleet: &FleetConfig, args: WorkerArgs) -> anyhow::Result<()> {
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let mut config = WorkerConfig::from_env(fleet).context("Invalid worker configuration")?;
    if let Some(id) = args.id {
        config.worker_id = id;
    }
    if let Some(raw) = args.capabilities {
        config = config.with_capabilities(filters::parse_capabilities(&raw));
    }
    if args.port.is_some() {
        config.port = args.port;
    }
    if !args.default_images.is_empty() {
        config = config.with_default_images(args.default_images);
    }
    if let Some(dir) = args.output_dir {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        config = config.with_output_dir(dir);
    }

    let handles = connect(fleet).await?;
    let worker = Worker::new(
        config,
        handles.queue,
        handles.registry,
        FilterRegistry::with_builtin(),
    );

    let stats = worker.run(shutdown_signal()).await?;
    info!(
        tasks_completed = stats.tasks_completed,
        tasks_failed = stats.tasks_failed,
        "Worker exited"
    );
    Ok(())
}

async fn run_monitor_command(fleet: &FleetConfig, args: MonitorArgs) -> anyhow::Result<()> {
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let handles = connect(fleet).await?;
    let mut autoscaler = build_autoscaler(fleet, handles)?.with_worker_role(args.role);
    if args.acting {
        autoscaler = autoscaler.with_executor(swarm_executor(args.stack)?);
    }

    if args.once {
        let decision = autoscaler.tick().await;
        return print_json(&decision);
    }

    autoscaler
        .run(Duration::from_secs(args.interval.max(1)), shutdown_signal())
        .await;
    Ok(())
}

// ============================================================================
// Task commands
// ============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    task_id: Uuid,
    queue: String,
    queue_length: usize,
}

async fn run_submit_command(fleet: &FleetConfig, args: SubmitArgs) -> anyhow::Result<()> {
    let mut payload = TaskPayload::new(args.filters, args.images);
    if let Some(raw) = args.params {
        let params: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(&raw).context("--params must be a JSON object")?;
        for (filter, value) in params {
            payload = payload.with_filter_params(filter, value);
        }
    }

    let handles = connect(fleet).await?;
    let task_id = handles.queue.enqueue(payload).await?;
    let queue_length = handles.queue.length().await?;

    print_json(&SubmitOutput {
        task_id,
        queue: handles.queue.name().to_string(),
        queue_length,
    })
}

async fn run_status_command(fleet: &FleetConfig, args: StatusArgs) -> anyhow::Result<()> {
    let handles = connect(fleet).await?;
    match handles.queue.status(args.task_id).await? {
        Some(task) => print_json(&task),
        None => anyhow::bail!("Task {} not found", args.task_id),
    }
}

#[derive(Serialize)]
struct StatsOutput {
    queue: QueueStats,
    workers: RegistryStats,
}

async fn run_stats_command(fleet: &FleetConfig) -> anyhow::Result<()> {
    let handles = connect(fleet).await?;
    let queue = handles.queue.stats().await?;
    let workers = handles.registry.registry_stats().await?;
    print_json(&StatsOutput { queue, workers })
}

async fn run_results_command(fleet: &FleetConfig, args: ResultsArgs) -> anyhow::Result<()> {
    let handles = connect(fleet).await?;
    let mut results: Vec<CompletedResult> = Vec::new();
    let mut wait = Duration::from_millis(args.wait_ms);

    while results.len() < args.limit {
        match handles.queue.next_result(wait).await? {
            Some(result) => results.push(result),
            None => break,
        }
        wait = NEXT_RESULT_WAIT;
    }

    print_json(&results)
}

async fn run_sweep_command(fleet: &FleetConfig, args: SweepArgs) -> anyhow::Result<()> {
    let max_age = args
        .older_than
        .map(Duration::from_secs)
        .unwrap_or(fleet.task_retention);

    let handles = connect(fleet).await?;
    let removed = handles.queue.sweep(max_age).await?;
    print_json(&serde_json::json!({
        "removed": removed,
        "max_age_secs": max_age.as_secs_f64(),
    }))
}

// ============================================================================
// Registry commands
// ============================================================================

async fn run_workers_command(fleet: &FleetConfig, args: WorkersArgs) -> anyhow::Result<()> {
    let handles = connect(fleet).await?;
    let workers: Vec<WorkerView> = match (&args.capability, args.active) {
        (Some(capability), _) => handles.registry.workers_with_capability(capability).await?,
        (None, true) => handles.registry.active_workers().await?,
        (None, false) => handles.registry.all_workers().await?,
    };
    print_json(&workers)
}

async fn run_cleanup_command(fleet: &FleetConfig, args: CleanupArgs) -> anyhow::Result<()> {
    let max_age = args
        .max_age
        .map(Duration::from_secs)
        .unwrap_or(fleet.cleanup_age);

    let handles = connect(fleet).await?;
    let removed = handles.registry.cleanup(max_age).await?;
    print_json(&serde_json::json!({
        "removed": removed,
        "max_age_secs": max_age.as_secs_f64(),
    }))
}

// ============================================================================
// Scaling commands
// ============================================================================

#[derive(Serialize)]
struct MetricsOutput {
    #[serde(flatten)]
    status: AutoscalerStatus,
    metrics_history: Vec<MetricsSnapshot>,
}

async fn run_metrics_command(fleet: &FleetConfig, args: MetricsArgs) -> anyhow::Result<()> {
    metrics::init_metrics().context("Failed to initialize metrics")?;

    let handles = connect(fleet).await?;
    let autoscaler = build_autoscaler(fleet, handles)?;
    let collector = autoscaler.collector();

    // The status call below takes the last sample.
    for _ in 1..args.samples {
        collector.collect().await;
        tokio::time::sleep(Duration::from_millis(args.sample_interval_ms)).await;
    }
    let status = autoscaler.status().await;

    if let Some(path) = &args.export {
        collector
            .export_json(path)
            .await
            .with_context(|| format!("Failed to export metrics to {}", path.display()))?;
    }

    if args.prometheus {
        print!("{}", metrics::export_metrics());
        return Ok(());
    }
    print_json(&MetricsOutput {
        status,
        metrics_history: collector.history(metrics::DEFAULT_HISTORY_LIMIT),
    })
}

async fn run_scale_command(fleet: &FleetConfig, args: ScaleArgs) -> anyhow::Result<()> {
    let handles = connect(fleet).await?;
    let autoscaler = build_autoscaler(fleet, handles)?
        .with_worker_role(args.role)
        .with_executor(swarm_executor(args.stack)?);

    let event = autoscaler.manual_scale(args.replicas).await?;
    print_json(&event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "filter-fleet",
            "submit",
            "--filters",
            "blur,sharpen",
            "a.jpg",
            "b.jpg",
        ])
        .expect("parse");

        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.filters, vec!["blur", "sharpen"]);
        assert_eq!(args.images, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_submit_requires_filters() {
        assert!(Cli::try_parse_from(["filter-fleet", "submit", "a.jpg"]).is_err());
    }

    #[test]
    fn test_parse_monitor_with_global_flags() {
        let cli = Cli::try_parse_from([
            "filter-fleet",
            "monitor",
            "--acting",
            "--interval",
            "5",
            "--redis-url",
            "memory://",
            "-l",
            "debug",
        ])
        .expect("parse");

        assert_eq!(cli.redis_url.as_deref(), Some("memory://"));
        assert_eq!(cli.log_level, "debug");
        let Commands::Monitor(args) = cli.command else {
            panic!("expected monitor");
        };
        assert!(args.acting);
        assert_eq!(args.interval, 5);
        assert_eq!(args.role, DEFAULT_WORKER_ROLE);
    }

    #[test]
    fn test_parse_metrics_sampling() {
        let cli = Cli::try_parse_from([
            "filter-fleet",
            "metrics",
            "--samples",
            "3",
            "--export",
            "metrics_export.json",
        ])
        .expect("parse");

        let Commands::Metrics(args) = cli.command else {
            panic!("expected metrics");
        };
        assert_eq!(args.samples, 3);
        assert_eq!(args.sample_interval_ms, DEFAULT_SAMPLE_INTERVAL_MS);
        assert_eq!(args.export, Some(PathBuf::from("metrics_export.json")));
    }

    #[test]
    fn test_parse_results() {
        let cli = Cli::try_parse_from(["filter-fleet", "results", "-n", "3"]).expect("parse");
        let Commands::Results(args) = cli.command else {
            panic!("expected results");
        };
        assert_eq!(args.limit, 3);
        assert_eq!(args.wait_ms, DEFAULT_RESULT_WAIT_MS);
    }

    #[tokio::test]
    async fn test_metrics_and_results_commands_on_memory_store() {
        let fleet = FleetConfig::default().with_redis_url("memory://");
        let args = MetricsArgs {
            prometheus: false,
            samples: 2,
            sample_interval_ms: 1,
            export: None,
        };
        run_metrics_command(&fleet, args).await.expect("metrics");

        let args = ResultsArgs {
            limit: 5,
            wait_ms: 10,
        };
        run_results_command(&fleet, args).await.expect("results");
    }

    #[test]
    fn test_status_rejects_bad_uuid() {
        assert!(Cli::try_parse_from(["filter-fleet", "status", "not-a-uuid"]).is_err());
    }
}
