//! SQLite persistent storage.
//!
//! The store holds three collections:
//! - **jobs**: every enqueued job and its lifecycle state
//! - **config**: string key/value tunables read by workers on every cycle
//! - **workers**: one row per live worker process, refreshed by heartbeats
//!
//! Several worker processes share one database file. SQLite's write lock is
//! the only coordination between them; see [`crate::scheduler::JobQueue`]
//! for the claim protocol built on it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuectl::storage::JobStore;
//!
//! let store = JobStore::open("job-queue.db").await?;
//! store.seed_default_config().await?;
//!
//! let status = store.status().await?;
//! println!("{} pending, {} active workers", status.jobs.pending, status.active_workers);
//! ```

pub mod database;
pub mod migrations;
pub mod schema;

pub use database::{
    is_contention, DashboardSnapshot, DatabaseError, JobStore, QueueStatus, DEFAULT_RECENT_JOBS,
};
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};
