//! The per-process worker loop.
//!
//! One worker runs per OS process and handles one job at a time. Each cycle:
//!
//! 1. stop if shutdown was requested
//! 2. register or heartbeat when the heartbeat interval has elapsed
//! 3. claim the oldest due job, or sleep for the poll interval if none
//! 4. run the job's command and record completion or failure
//!
//! Horizontal scale comes from running more processes against the same
//! database file; see `queuectl worker start --count N`.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::executor::{CommandExecutor, ExecutionOutcome};
use super::job::Job;
use super::liveness::{local_hostname, WorkerRecord};
use super::queue::{ClaimOutcome, FailureOutcome, JobQueue};
use super::shutdown::{ShutdownSignal, DEFAULT_STOP_FILE};

/// Configuration for a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when no job is due.
    pub poll_interval: Duration,
    /// Minimum time between heartbeats.
    pub heartbeat_interval: Duration,
    /// File whose presence stops the worker.
    pub stop_file: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            stop_file: PathBuf::from(DEFAULT_STOP_FILE),
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the idle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the stop file path.
    pub fn with_stop_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stop_file = path.into();
        self
    }
}

/// Who a worker claims to be in the `workers` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub pid: u32,
    pub hostname: String,
}

impl WorkerIdentity {
    pub fn new(pid: u32, hostname: impl Into<String>) -> Self {
        Self {
            pid,
            hostname: hostname.into(),
        }
    }

    /// Identity of the current process.
    pub fn current() -> Self {
        Self::new(std::process::id(), local_hostname())
    }
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// No row in `workers` yet, or the last registration failed.
    Unregistered,
    /// Registered and heartbeating.
    Registered,
    /// Shutdown observed; deregistering.
    ShuttingDown,
    /// Deregistered. The loop has exited.
    Terminated,
}

/// Counters for jobs handled by one worker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Jobs that exited successfully.
    pub completed: u64,
    /// Failed executions sent back to `pending`.
    pub retried: u64,
    /// Failed executions that exhausted their retries.
    pub dead_lettered: u64,
    /// Store operations that failed.
    pub store_errors: u64,
    /// Wall-clock time spent running job commands.
    pub busy_time: Duration,
}

impl WorkerStats {
    /// Returns the number of executions whose outcome was recorded.
    pub fn total_processed(&self) -> u64 {
        self.completed + self.retried + self.dead_lettered
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.completed as f64 / total as f64) * 100.0
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Shutdown was requested; no job was claimed.
    Stopped,
    /// No job was claimed: queue empty, lost the lock, or store error.
    Idle,
    /// A job was executed and its outcome recorded. `exit_code` is `None`
    /// when the command timed out, could not be spawned or was killed by a
    /// signal.
    Executed {
        job_id: String,
        succeeded: bool,
        exit_code: Option<i32>,
    },
}

/// A single worker that processes jobs from the queue.
pub struct Worker {
    queue: JobQueue,
    config: WorkerConfig,
    shutdown: ShutdownSignal,
    identity: WorkerIdentity,
    executor: CommandExecutor,
    state: WorkerState,
    last_heartbeat: Option<Instant>,
    stats: WorkerStats,
}

impl Worker {
    /// Creates a worker for the current process.
    pub fn new(queue: JobQueue, config: WorkerConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            queue,
            config,
            shutdown,
            identity: WorkerIdentity::current(),
            executor: CommandExecutor::new(),
            state: WorkerState::Unregistered,
            last_heartbeat: None,
            stats: WorkerStats::default(),
        }
    }

    /// Overrides the identity recorded in the `workers` table.
    pub fn with_identity(mut self, identity: WorkerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Main worker loop.
    ///
    /// Processes jobs until shutdown is requested, then deregisters and
    /// returns the final counters.
    pub async fn run(mut self) -> WorkerStats {
        info!(
            worker_pid = self.identity.pid,
            hostname = %self.identity.hostname,
            stop_file = %self.config.stop_file.display(),
            "Worker starting"
        );

        loop {
            match self.run_cycle().await {
                CycleOutcome::Stopped => break,
                CycleOutcome::Idle => self.idle().await,
                CycleOutcome::Executed { .. } => {}
            }
        }

        self.shutdown().await;

        info!(
            worker_pid = self.identity.pid,
            completed = self.stats.completed,
            retried = self.stats.retried,
            dead_lettered = self.stats.dead_lettered,
            store_errors = self.stats.store_errors,
            busy_ms = self.stats.busy_time.as_millis() as u64,
            success_rate = self.stats.success_rate(),
            "Worker shutdown complete"
        );
        self.stats
    }

    /// Runs one iteration of the loop without sleeping.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.shutdown.is_triggered() {
            if self.state != WorkerState::Terminated {
                self.state = WorkerState::ShuttingDown;
            }
            return CycleOutcome::Stopped;
        }

        self.maybe_heartbeat().await;

        let job = match self.queue.claim().await {
            Ok(ClaimOutcome::Claimed(job)) => job,
            Ok(ClaimOutcome::Empty) => return CycleOutcome::Idle,
            Ok(ClaimOutcome::Contended) => {
                debug!(worker_pid = self.identity.pid, "Queue locked by another worker");
                return CycleOutcome::Idle;
            }
            Err(e) => {
                self.stats.store_errors += 1;
                error!(worker_pid = self.identity.pid, error = %e, "Failed to claim job");
                return CycleOutcome::Idle;
            }
        };

        let job_id = job.id.clone();
        let (succeeded, exit_code) = self.process_job(job).await;
        CycleOutcome::Executed {
            job_id,
            succeeded,
            exit_code,
        }
    }

    /// Sleeps for the poll interval, waking early on shutdown.
    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn maybe_heartbeat(&mut self) {
        let due = match self.last_heartbeat {
            None => true,
            Some(at) => at.elapsed() >= self.config.heartbeat_interval,
        };
        if !due {
            return;
        }

        let now = Utc::now();
        let store = self.queue.store();
        let pid = self.identity.pid;

        match self.state {
            WorkerState::Unregistered => {
                let record = WorkerRecord::new(pid, self.identity.hostname.clone(), now);
                match store.register_worker(&record).await {
                    Ok(()) => {
                        self.state = WorkerState::Registered;
                        self.last_heartbeat = Some(Instant::now());
                        info!(worker_pid = pid, "Worker registered");
                    }
                    Err(e) => {
                        self.stats.store_errors += 1;
                        error!(worker_pid = pid, error = %e, "Worker registration failed");
                    }
                }
            }
            WorkerState::Registered => {
                match store.heartbeat(pid, now).await {
                    Ok(true) => debug!(worker_pid = pid, "Heartbeat sent"),
                    Ok(false) => {
                        warn!(worker_pid = pid, "Worker row missing, registering again");
                        self.state = WorkerState::Unregistered;
                    }
                    Err(e) => {
                        self.stats.store_errors += 1;
                        error!(worker_pid = pid, error = %e, "Heartbeat failed");
                    }
                }
                self.last_heartbeat = Some(Instant::now());
            }
            WorkerState::ShuttingDown | WorkerState::Terminated => {}
        }
    }

    /// Executes a claimed job and records its outcome. Returns whether the
    /// command succeeded, and its exit code.
    async fn process_job(&mut self, job: Job) -> (bool, Option<i32>) {
        let pid = self.identity.pid;
        let timeout = self.queue.config().job_timeout().await;

        info!(
            worker_pid = pid,
            job_id = %job.id,
            attempt = job.attempts + 1,
            remaining_attempts = job.remaining_attempts(),
            timeout_ms = timeout.as_millis() as u64,
            command = %job.command,
            "Executing job"
        );

        let outcome = self.executor.run(&job.command, timeout).await;
        let exit_code = match &outcome {
            ExecutionOutcome::Succeeded { stdout, duration } => {
                self.stats.busy_time += *duration;
                debug!(
                    worker_pid = pid,
                    job_id = %job.id,
                    duration_ms = duration.as_millis() as u64,
                    output = %stdout.trim(),
                    "Command succeeded"
                );
                Some(0)
            }
            ExecutionOutcome::Failed {
                exit_code,
                duration,
                ..
            } => {
                self.stats.busy_time += *duration;
                debug!(
                    worker_pid = pid,
                    job_id = %job.id,
                    exit_code = ?exit_code,
                    duration_ms = duration.as_millis() as u64,
                    "Command failed"
                );
                *exit_code
            }
            ExecutionOutcome::TimedOut { timeout } => {
                self.stats.busy_time += *timeout;
                None
            }
        };

        let succeeded = outcome.is_success();
        match outcome.error_message() {
            None => self.record_completion(&job.id).await,
            Some(error_message) => self.record_failure(&job.id, &error_message, exit_code).await,
        }
        (succeeded, exit_code)
    }

    async fn record_completion(&mut self, job_id: &str) {
        let pid = self.identity.pid;
        match self.queue.complete(job_id).await {
            Ok(true) => {
                self.stats.completed += 1;
                info!(worker_pid = pid, job_id = job_id, "Job completed");
            }
            Ok(false) => {
                warn!(worker_pid = pid, job_id = job_id, "Job was no longer processing");
            }
            Err(e) => {
                self.stats.store_errors += 1;
                error!(worker_pid = pid, job_id = job_id, error = %e, "Failed to mark job complete");
            }
        }
    }

    async fn record_failure(&mut self, job_id: &str, error_message: &str, exit_code: Option<i32>) {
        let pid = self.identity.pid;
        match self.queue.fail(job_id, error_message).await {
            Ok(FailureOutcome::Retrying {
                attempts,
                delay_secs,
                ..
            }) => {
                self.stats.retried += 1;
                warn!(
                    worker_pid = pid,
                    job_id = job_id,
                    attempt = attempts,
                    exit_code = ?exit_code,
                    delay_secs = delay_secs,
                    error = %error_message,
                    "Job failed, retrying"
                );
            }
            Ok(FailureOutcome::DeadLettered { attempts }) => {
                self.stats.dead_lettered += 1;
                error!(
                    worker_pid = pid,
                    job_id = job_id,
                    attempt = attempts,
                    exit_code = ?exit_code,
                    error = %error_message,
                    "Job failed max retries, moved to dead letter queue"
                );
            }
            Ok(FailureOutcome::NotProcessing) => {
                warn!(worker_pid = pid, job_id = job_id, "Job was no longer processing");
            }
            Err(e) => {
                self.stats.store_errors += 1;
                error!(worker_pid = pid, job_id = job_id, error = %e, "Failed to record job failure");
            }
        }
    }

    /// Deregisters the worker. Idempotent.
    pub async fn shutdown(&mut self) {
        if self.state == WorkerState::Terminated {
            return;
        }
        self.state = WorkerState::ShuttingDown;

        let pid = self.identity.pid;
        match self.queue.store().deregister_worker(pid).await {
            Ok(true) => info!(worker_pid = pid, "Worker deregistered"),
            Ok(false) => debug!(worker_pid = pid, "Worker was not registered"),
            Err(e) => {
                self.stats.store_errors += 1;
                error!(worker_pid = pid, error = %e, "Failed to deregister worker");
            }
        }
        self.state = WorkerState::Terminated;
    }
}
