//! Job lifecycle engine and worker loop.
//!
//! - **JobQueue**: enqueue, atomic claim, completion, failure and dead letter
//!   transitions over the SQLite store
//! - **RetryPolicy**: exponential backoff and the dead-letter threshold
//! - **Worker**: the per-process loop that claims jobs and runs their
//!   commands
//! - **ShutdownSignal**: stop file, OS signals and programmatic stop
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   queuectl   │
//!                      │ enqueue/dlq  │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │    SQLite    │
//!                      │ job-queue.db │
//!                      └──────┬───────┘
//!                             │  BEGIN IMMEDIATE claim
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    │ (pid A) │         │ (pid B) │         │ (pid N) │
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use queuectl::scheduler::{JobQueue, NewJob, ShutdownSignal, Worker, WorkerConfig};
//! use queuectl::storage::JobStore;
//!
//! let store = JobStore::open("job-queue.db").await?;
//! let queue = JobQueue::new(store);
//! queue.enqueue(NewJob::new("job1", "echo hello")).await?;
//!
//! let config = WorkerConfig::default();
//! let shutdown = ShutdownSignal::new(&config.stop_file);
//! shutdown.install_signal_handlers()?;
//! let stats = Worker::new(queue, config, shutdown).run().await;
//! ```
//!
//! # Reliability
//!
//! - **Atomic claim**: a job moves to `processing` for exactly one worker
//! - **Backoff**: failed jobs wait `backoff_base ^ attempts` seconds
//! - **Dead letter queue**: jobs that exhaust `max_attempts` become `dead`
//!   and can be retried by an operator
//! - **Graceful shutdown**: workers finish the current job before stopping
//! - **No crash recovery**: a job whose worker dies stays `processing`

pub mod backoff;
pub mod executor;
pub mod job;
pub mod liveness;
pub mod queue;
pub mod shutdown;
pub mod worker;

// Re-export main types for convenience
pub use backoff::{RetryDecision, RetryPolicy};
pub use executor::{CommandExecutor, ExecutionOutcome};
pub use job::{Job, JobCounts, JobState, NewJob};
pub use liveness::{WorkerRecord, LIVENESS_WINDOW};
pub use queue::{ClaimOutcome, FailureOutcome, JobQueue, QueueError};
pub use shutdown::ShutdownSignal;
pub use worker::{CycleOutcome, Worker, WorkerConfig, WorkerIdentity, WorkerState, WorkerStats};
