//! CLI command definitions for farm-scheduler.
//!
//! Every command builds the service from `FARM_*` environment settings,
//! with `--redis-url` taking precedence over `FARM_REDIS_URL`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};

use crate::blob::FsBlobStore;
use crate::clock::SystemClock;
use crate::compute::{ClusterRegistry, ComputeService, StaticClusterRegistry, TaskStatus};
use crate::config::ServiceConfig;
use crate::metrics::{export_metrics, init_metrics};
use crate::store::RedisQueueStore;

/// Default long-poll duration for `updates`.
const DEFAULT_WAIT_SECS: u64 = 30;

/// Distributed compute task scheduler.
#[derive(Parser)]
#[command(name = "farm-scheduler")]
#[command(about = "Schedule compute tasks onto agents over a shared Redis store")]
#[command(version)]
#[command(
    long_about = "farm-scheduler queues compute tasks by cluster and requirements, hands them to matching agents as leases, and reports task status to clients.\n\nExample usage:\n  farm-scheduler serve\n  farm-scheduler add-tasks --cluster default --channel build-42 --requirements <hash> task-a task-b\n  farm-scheduler updates --cluster default --channel build-42 --wait-secs 10"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL. Overrides FARM_REDIS_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the scheduler loops and the expiry sweep until interrupted.
    Serve,

    /// Queue tasks for a cluster.
    AddTasks(AddTasksArgs),

    /// Wait for task status updates on a channel.
    Updates(UpdatesArgs),

    /// List queues that nobody has drained within the staleness window.
    Inactive(InactiveArgs),

    /// Run a single expiry pass over inactive queues.
    Sweep,
}

/// Arguments for `farm-scheduler add-tasks`.
#[derive(Parser, Debug)]
pub struct AddTasksArgs {
    /// Cluster the tasks run on.
    #[arg(short, long, default_value = "default")]
    pub cluster: String,

    /// Channel receiving the task statuses.
    #[arg(long)]
    pub channel: String,

    /// Hash of the requirements blob shared by the tasks.
    #[arg(short, long)]
    pub requirements: String,

    /// Task reference ids.
    #[arg(required = true)]
    pub task_ref_ids: Vec<String>,
}

/// Arguments for `farm-scheduler updates`.
#[derive(Parser, Debug)]
pub struct UpdatesArgs {
    /// Cluster the tasks run on.
    #[arg(short, long, default_value = "default")]
    pub cluster: String,

    /// Channel to read.
    #[arg(long)]
    pub channel: String,

    /// Seconds to wait for updates before returning empty.
    #[arg(short, long, default_value_t = DEFAULT_WAIT_SECS)]
    pub wait_secs: u64,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `farm-scheduler inactive`.
#[derive(Parser, Debug)]
pub struct InactiveArgs {
    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct InactiveQueue {
    cluster_id: String,
    requirements_hash: String,
    length: usize,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run a parsed CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = ServiceConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.redis_url {
        config = config.with_redis_url(url);
    }
    init_metrics().context("Failed to register metrics")?;

    match cli.command {
        Commands::Serve => run_serve_command(&config).await?,
        Commands::AddTasks(args) => run_add_tasks_command(&config, args).await?,
        Commands::Updates(args) => run_updates_command(&config, args).await?,
        Commands::Inactive(args) => run_inactive_command(&config, args).await?,
        Commands::Sweep => run_sweep_command(&config).await?,
    }
    Ok(())
}

async fn build_service(config: &ServiceConfig) -> anyhow::Result<ComputeService> {
    let store = RedisQueueStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to {}", config.redis_url))?;

    let registry: Arc<dyn ClusterRegistry> = match &config.clusters_file {
        Some(path) => Arc::new(
            StaticClusterRegistry::from_yaml_file(path)
                .with_context(|| format!("Failed to load clusters from {}", path.display()))?,
        ),
        None => Arc::new(StaticClusterRegistry::default()),
    };

    Ok(ComputeService::new(
        Arc::new(store),
        Arc::new(FsBlobStore::new(config.blob_root.clone())),
        registry,
        config,
        Arc::new(SystemClock),
    ))
}

async fn run_serve_command(config: &ServiceConfig) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    service.start().await?;

    info!(
        redis_url = %config.redis_url,
        key_prefix = %config.key_prefix,
        "Serving; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    service.shutdown().await;
    debug!(metrics = %export_metrics(), "Final metrics");
    Ok(())
}

async fn run_add_tasks_command(config: &ServiceConfig, args: AddTasksArgs) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    service
        .add_tasks(
            &args.cluster,
            &args.channel,
            &args.task_ref_ids,
            &args.requirements,
        )
        .await?;

    println!(
        "Queued {} task(s) on {}:{}",
        args.task_ref_ids.len(),
        args.cluster,
        args.requirements
    );
    Ok(())
}

async fn run_updates_command(config: &ServiceConfig, args: UpdatesArgs) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    // Wake-ups for other processes' posts arrive through the message loop.
    service.messages().start().await?;

    let updates = service
        .wait_for_task_updates_for(
            &args.cluster,
            &args.channel,
            Duration::from_secs(args.wait_secs),
        )
        .await;
    service.messages().shutdown().await;
    let updates = updates?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&updates)?);
    } else if updates.is_empty() {
        println!("No updates");
    } else {
        for status in &updates {
            println!("{}", format_status(status));
        }
    }
    Ok(())
}

async fn run_inactive_command(config: &ServiceConfig, args: InactiveArgs) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    let scheduler = service.scheduler();

    let mut queues = Vec::new();
    for key in scheduler.inactive_queues().await? {
        let length = scheduler.queue_length(&key).await?;
        queues.push(InactiveQueue {
            cluster_id: key.cluster_id,
            requirements_hash: key.requirements_hash,
            length,
        });
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&queues)?);
    } else if queues.is_empty() {
        println!("No inactive queues");
    } else {
        for queue in &queues {
            println!(
                "{}:{}  {} task(s)",
                queue.cluster_id, queue.requirements_hash, queue.length
            );
        }
    }
    Ok(())
}

async fn run_sweep_command(config: &ServiceConfig) -> anyhow::Result<()> {
    let service = build_service(config).await?;
    let expired = service.expire_inactive_queues().await?;
    println!("Expired {} task(s)", expired);
    Ok(())
}

fn format_status(status: &TaskStatus) -> String {
    let mut line = format!(
        "{}  {}  {}",
        status.time.to_rfc3339(),
        status.task_ref_id,
        status.state
    );
    if let Some(outcome) = status.outcome {
        line.push_str(&format!("  {}", outcome));
    }
    if let Some(agent_id) = &status.agent_id {
        line.push_str(&format!("  agent={}", agent_id));
    }
    if let Some(result_ref_id) = &status.result_ref_id {
        line.push_str(&format!("  result={}", result_ref_id));
    }
    if let Some(detail) = &status.detail {
        line.push_str(&format!("  ({})", detail));
    }
    line
}
