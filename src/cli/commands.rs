//! CLI command definitions for queuectl.
//!
//! Every command opens the store at `--db`, applying the schema if needed,
//! performs one operation and exits. `worker run` is the exception: it stays
//! in the foreground until stopped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::{info, warn};

use crate::scheduler::job::{Job, JobState, NewJob};
use crate::scheduler::liveness::{WorkerRecord, LIVENESS_WINDOW};
use crate::scheduler::shutdown::{clear_stop, request_stop, DEFAULT_STOP_FILE};
use crate::scheduler::{JobQueue, QueueError, ShutdownSignal, Worker, WorkerConfig};
use crate::storage::{JobStore, DEFAULT_RECENT_JOBS};

/// Default database file, relative to the working directory.
pub const DEFAULT_DB_PATH: &str = "job-queue.db";

/// Persistent shell-command job queue.
#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Enqueue shell commands and run them on background workers")]
#[command(version)]
#[command(
    long_about = "queuectl stores jobs in a local SQLite file and runs them on worker processes.\n\nFailed jobs are retried with exponential backoff and moved to a dead letter queue once their retries are exhausted.\n\nExample usage:\n  queuectl enqueue '{\"id\":\"job1\",\"command\":\"echo hello\"}'\n  queuectl worker start --count 2\n  queuectl status"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the SQLite database file.
    #[arg(long, env = "QUEUECTL_DB", default_value = DEFAULT_DB_PATH, global = true)]
    pub db: PathBuf,

    /// File whose presence tells workers to stop.
    #[arg(long, env = "QUEUECTL_STOP_FILE", default_value = DEFAULT_STOP_FILE, global = true)]
    pub stop_file: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Create the database and seed default configuration.
    Init(InitArgs),

    /// Add a job from a JSON object: {"id": ..., "command": ..., "max_attempts": ...}.
    Enqueue(EnqueueArgs),

    /// List jobs, oldest first.
    List(ListArgs),

    /// Show job counts by state and the number of active workers.
    Status(StatusArgs),

    /// Inspect and retry dead-lettered jobs.
    Dlq(DlqArgs),

    /// Read and write configuration.
    Config(ConfigArgs),

    /// Run, start, stop and list workers.
    Worker(WorkerArgs),

    /// Print a dashboard snapshot as JSON.
    Dashboard(DashboardArgs),
}

/// Arguments for `queuectl init`.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Suppress non-error output.
    #[arg(long)]
    pub silent: bool,
}

/// Arguments for `queuectl enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Job definition as JSON.
    pub job: String,
}

/// Arguments for `queuectl list`.
#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only list jobs in this state (pending, processing, completed, dead).
    #[arg(short, long)]
    pub state: Option<JobState>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `queuectl status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `queuectl dlq`.
#[derive(Parser, Debug)]
pub struct DlqArgs {
    #[command(subcommand)]
    pub command: DlqSubcommand,
}

/// Dead letter queue subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DlqSubcommand {
    /// List dead jobs with their last error.
    List {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Move a dead job back to pending with a fresh retry budget.
    Retry {
        /// Job id.
        id: String,
    },
}

/// Arguments for `queuectl config`.
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

/// Configuration subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ConfigSubcommand {
    /// Set a configuration value.
    Set { key: String, value: String },
    /// Print a configuration value.
    Get { key: String },
    /// Print every configuration value.
    List,
}

/// Arguments for `queuectl worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    #[command(subcommand)]
    pub command: WorkerSubcommand,
}

/// Worker subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum WorkerSubcommand {
    /// Run one worker in the foreground until stopped.
    Run,
    /// Start detached worker processes.
    Start {
        /// Number of workers to start.
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
    },
    /// Ask all workers to stop after their current job.
    Stop,
    /// List active workers.
    List {
        /// Also list registered workers whose heartbeat is stale.
        #[arg(long)]
        all: bool,
    },
}

/// Arguments for `queuectl dashboard`.
#[derive(Parser, Debug)]
pub struct DashboardArgs {
    /// Number of recently updated jobs to include.
    #[arg(long, default_value_t = DEFAULT_RECENT_JOBS)]
    pub limit: u32,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let store = open_store(&cli.db).await?;

    match cli.command {
        Commands::Init(args) => run_init_command(&store, args).await,
        Commands::Enqueue(args) => run_enqueue_command(&store, args).await,
        Commands::List(args) => run_list_command(&store, args).await,
        Commands::Status(args) => run_status_command(&store, args).await,
        Commands::Dlq(args) => run_dlq_command(&store, args).await,
        Commands::Config(args) => run_config_command(&store, args).await,
        Commands::Worker(args) => {
            run_worker_command(store, args, &cli.db, &cli.stop_file, &cli.log_level).await
        }
        Commands::Dashboard(args) => run_dashboard_command(&store, args).await,
    }
}

async fn open_store(path: &Path) -> anyhow::Result<JobStore> {
    JobStore::open(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))
}

// ============================================================================
// Jobs
// ============================================================================

async fn run_init_command(store: &JobStore, args: InitArgs) -> anyhow::Result<()> {
    let seeded = store.seed_default_config().await?;
    let migrations = store.applied_migrations().await?;
    info!(
        seeded = seeded,
        migrations = migrations.len(),
        "Database initialized"
    );
    if !args.silent {
        println!(
            "[+] Database initialization complete ({} schema migrations, {} config defaults added).",
            migrations.len(),
            seeded
        );
    }
    Ok(())
}

async fn run_enqueue_command(store: &JobStore, args: EnqueueArgs) -> anyhow::Result<()> {
    let new_job = NewJob::from_json(&args.job).context("Invalid job definition")?;
    let queue = JobQueue::new(store.clone());

    match queue.enqueue(new_job).await {
        Ok(job) => {
            println!(
                "[+] Job '{}' enqueued (max_attempts: {})",
                job.id, job.max_attempts
            );
            Ok(())
        }
        Err(QueueError::DuplicateJob(id)) => {
            anyhow::bail!("Job with id '{}' already exists", id)
        }
        Err(e) => Err(e.into()),
    }
}

async fn run_list_command(store: &JobStore, args: ListArgs) -> anyhow::Result<()> {
    let jobs = store.list_jobs(args.state).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        match args.state {
            Some(state) => println!("No jobs in state '{}'", state),
            None => println!("No jobs found"),
        }
        return Ok(());
    }
    print_jobs(&jobs);
    Ok(())
}

async fn run_status_command(store: &JobStore, args: StatusArgs) -> anyhow::Result<()> {
    let status = store.status().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("=== Job Status ===");
    for state in JobState::ALL {
        println!("  {:<12}{}", state.as_str(), status.jobs.get(state));
    }
    println!("  {:<12}{}", "total", status.jobs.total());
    println!();
    println!("Active workers: {}", status.active_workers);
    Ok(())
}

async fn run_dlq_command(store: &JobStore, args: DlqArgs) -> anyhow::Result<()> {
    let queue = JobQueue::new(store.clone());

    match args.command {
        DlqSubcommand::List { json } => {
            let dead = queue.dead_letters().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dead)?);
            } else if dead.is_empty() {
                println!("Dead letter queue is empty");
            } else {
                for job in &dead {
                    println!(
                        "{}  attempts={}  command={}",
                        job.id, job.attempts, job.command
                    );
                    println!("    error: {}", job.last_error.as_deref().unwrap_or("-"));
                }
            }
        }
        DlqSubcommand::Retry { id } => {
            if queue.retry_dead_letter(&id).await? {
                println!("[+] Job '{}' moved from DLQ to pending", id);
            } else {
                anyhow::bail!("Job '{}' not found in DLQ", id);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

async fn run_config_command(store: &JobStore, args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigSubcommand::Set { key, value } => {
            store.set_config(&key, &value).await?;
            println!("{} = {}", key, value);
        }
        ConfigSubcommand::Get { key } => match store.get_config(&key).await? {
            Some(value) => println!("{} = {}", key, value),
            None => anyhow::bail!("Config key '{}' is not set", key),
        },
        ConfigSubcommand::List => {
            let entries = store.list_config().await?;
            if entries.is_empty() {
                println!("No configuration set");
            }
            for entry in entries {
                println!("{} = {}", entry.key, entry.value);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Workers
// ============================================================================

async fn run_worker_command(
    store: JobStore,
    args: WorkerArgs,
    db: &Path,
    stop_file: &Path,
    log_level: &str,
) -> anyhow::Result<()> {
    match args.command {
        WorkerSubcommand::Run => run_worker_foreground(store, stop_file).await,
        WorkerSubcommand::Start { count } => start_workers(count, db, stop_file, log_level),
        WorkerSubcommand::Stop => {
            request_stop(stop_file)
                .with_context(|| format!("Failed to write {}", stop_file.display()))?;
            println!(
                "[+] Stop requested. Workers exit after their current job ({}).",
                stop_file.display()
            );
            Ok(())
        }
        WorkerSubcommand::List { all } => list_workers(&store, all).await,
    }
}

async fn run_worker_foreground(store: JobStore, stop_file: &Path) -> anyhow::Result<()> {
    let heartbeat_interval = worker_heartbeat_interval(&store).await;
    let queue = JobQueue::new(store);
    let config = WorkerConfig::new()
        .with_heartbeat_interval(heartbeat_interval)
        .with_stop_file(stop_file);
    let shutdown = ShutdownSignal::new(stop_file);
    shutdown
        .install_signal_handlers()
        .context("Failed to install signal handlers")?;

    let stats = Worker::new(queue, config, shutdown).run().await;
    println!(
        "Worker [{}] stopped: {} completed, {} retried, {} dead-lettered",
        std::process::id(),
        stats.completed,
        stats.retried,
        stats.dead_lettered
    );
    Ok(())
}

/// Configured heartbeat interval, capped so that a live worker always
/// heartbeats at least three times per liveness window.
async fn worker_heartbeat_interval(store: &JobStore) -> Duration {
    let configured = store.config().heartbeat_interval().await;
    let cap = LIVENESS_WINDOW / 3;
    if configured > cap {
        warn!(
            configured_secs = configured.as_secs(),
            cap_secs = cap.as_secs(),
            "Heartbeat interval exceeds a third of the liveness window, capping"
        );
        return cap;
    }
    configured
}

fn start_workers(count: u32, db: &Path, stop_file: &Path, log_level: &str) -> anyhow::Result<()> {
    if clear_stop(stop_file)? {
        info!(stop_file = %stop_file.display(), "Removed stale stop file");
    }

    let exe = std::env::current_exe().context("Failed to locate queuectl executable")?;
    for _ in 0..count {
        let child = std::process::Command::new(&exe)
            .arg("--db")
            .arg(db)
            .arg("--stop-file")
            .arg(stop_file)
            .arg("--log-level")
            .arg(log_level)
            .arg("worker")
            .arg("run")
            .stdin(Stdio::null())
            .spawn()
            .context("Failed to spawn worker process")?;
        println!("[+] Started worker [{}]", child.id());
    }
    Ok(())
}

async fn list_workers(store: &JobStore, all: bool) -> anyhow::Result<()> {
    let now = Utc::now();
    let workers = if all {
        store.all_workers().await?
    } else {
        store.active_workers(now).await?
    };
    if workers.is_empty() {
        if all {
            println!("No workers registered");
        } else {
            println!("No active workers found");
        }
        return Ok(());
    }

    let interval = store.config().heartbeat_interval().await;
    let title = if all { "Workers" } else { "Active Workers" };
    println!("{} (heartbeat every {}s):", title, interval.as_secs());
    for worker in &workers {
        println!("{}", format_worker(worker, now));
    }
    Ok(())
}

async fn run_dashboard_command(store: &JobStore, args: DashboardArgs) -> anyhow::Result<()> {
    let snapshot = store.dashboard(args.limit).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

// ============================================================================
// Output helpers
// ============================================================================

fn print_jobs(jobs: &[Job]) {
    println!(
        "{:<20} {:<11} {:>8}  {:<20} COMMAND",
        "ID", "STATE", "ATTEMPTS", "UPDATED"
    );
    for job in jobs {
        println!(
            "{:<20} {:<11} {:>8}  {:<20} {}",
            job.id,
            job.state.as_str(),
            format!("{}/{}", job.attempts, job.max_attempts),
            job.updated_at.format("%Y-%m-%d %H:%M:%S"),
            job.command
        );
        if let Some(error) = &job.last_error {
            println!("{:<20} last error: {}", "", error);
        }
    }
}

fn format_worker(worker: &WorkerRecord, now: DateTime<Utc>) -> String {
    format!(
        "  PID {:<8} {:<6} host={}  started={}  last_heartbeat={}",
        worker.pid,
        if worker.is_active(now) { "active" } else { "stale" },
        worker.hostname,
        worker.started_at.format("%Y-%m-%d %H:%M:%S"),
        worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
    )
}
