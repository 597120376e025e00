//! queuectl: a persistent job queue for shell commands.
//!
//! Jobs are stored in a local SQLite file and executed by one or more worker
//! processes. Failures are retried with exponential backoff; jobs that run
//! out of attempts land in a dead letter queue.

pub mod cli;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use error::ValidationError;
pub use scheduler::{Job, JobQueue, JobState, NewJob, QueueError};
pub use storage::{DatabaseError, JobStore};
