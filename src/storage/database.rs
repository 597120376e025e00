//! SQLite database client for the job queue.
//!
//! `JobStore` owns the connection pool and provides the read and upsert
//! operations used by the CLI, the dashboard snapshot and worker liveness
//! tracking. State transitions that depend on the current state of a job
//! live in [`crate::scheduler::JobQueue`].

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::config::{self, ConfigEntry, ConfigResolver};
use crate::scheduler::job::{Job, JobCounts, JobState};
use crate::scheduler::liveness::{self, WorkerRecord};

use super::migrations::{AppliedMigration, MigrationError, MigrationRunner};
use super::schema::encode_timestamp;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum pooled connections per process.
const MAX_CONNECTIONS: u32 = 4;

/// Default number of jobs in the dashboard's recent list.
pub const DEFAULT_RECENT_JOBS: u32 = 20;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Opening the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Returns whether an error means another connection holds the write lock.
///
/// Covers `SQLITE_BUSY`, `SQLITE_LOCKED` and their extended codes.
pub fn is_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let code = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            matches!(code, Some(5) | Some(6)) || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Aggregate status: job counts and number of live workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub jobs: JobCounts,
    pub active_workers: usize,
}

/// Everything the dashboard shows, read in one call.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub jobs: JobCounts,
    pub active_worker_count: usize,
    pub recent_jobs: Vec<Job>,
    pub active_workers: Vec<WorkerRecord>,
}

/// SQLite-backed store for jobs, configuration and worker records.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Opens (creating if needed) the database at `path` and applies the
    /// schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(BUSY_TIMEOUT)
            .connect_with(opts)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(format!("{}: {}", path.display(), e)))?;

        let store = Self { pool };
        store.run_migrations().await?;

        tracing::debug!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns a configuration resolver sharing this store's pool.
    pub fn config(&self) -> ConfigResolver {
        ConfigResolver::new(self.pool.clone())
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        MigrationRunner::new(self.pool.clone())
            .run_migrations()
            .await?;
        Ok(())
    }

    /// Lists the schema migrations recorded in this database, oldest first.
    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>, DatabaseError> {
        Ok(MigrationRunner::new(self.pool.clone())
            .list_applied_migrations()
            .await?)
    }

    /// Inserts the default configuration rows that are not already set.
    ///
    /// Returns the number of rows inserted.
    pub async fn seed_default_config(&self) -> Result<u64, DatabaseError> {
        let mut inserted = 0;
        for entry in config::default_entries() {
            inserted += sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
                .bind(&entry.key)
                .bind(&entry.value)
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(inserted)
    }

    // =========================================================================
    // Job Queries
    // =========================================================================

    /// Retrieves a job by its ID.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Lists jobs, oldest first, optionally restricted to one state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>, DatabaseError> {
        let jobs = match state {
            Some(state) => {
                sqlx::query_as::<_, Job>(
                    "SELECT * FROM jobs WHERE state = ?1 ORDER BY created_at ASC, rowid ASC",
                )
                .bind(state)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at ASC, rowid ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(jobs)
    }

    /// Returns the most recently updated jobs.
    pub async fn recent_jobs(&self, limit: u32) -> Result<Vec<Job>, DatabaseError> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs ORDER BY updated_at DESC, rowid DESC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Counts jobs per state.
    pub async fn job_counts(&self) -> Result<JobCounts, DatabaseError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: JobState = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            counts.set(state, count.max(0).unsigned_abs());
        }
        Ok(counts)
    }

    /// Returns job counts and the number of active workers.
    pub async fn status(&self) -> Result<QueueStatus, DatabaseError> {
        let jobs = self.job_counts().await?;
        let active_workers = self.active_workers(Utc::now()).await?.len();
        Ok(QueueStatus {
            jobs,
            active_workers,
        })
    }

    /// Reads everything the dashboard displays.
    pub async fn dashboard(&self, recent_limit: u32) -> Result<DashboardSnapshot, DatabaseError> {
        let jobs = self.job_counts().await?;
        let recent_jobs = self.recent_jobs(recent_limit).await?;
        let active_workers = self.active_workers(Utc::now()).await?;
        Ok(DashboardSnapshot {
            jobs,
            active_worker_count: active_workers.len(),
            recent_jobs,
            active_workers,
        })
    }

    // =========================================================================
    // Config Operations
    // =========================================================================

    /// Upserts a configuration value.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Returns the raw configuration value, if set.
    pub async fn get_config(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.map(|(v,)| v))
    }

    /// Lists all configuration entries sorted by key.
    pub async fn list_config(&self) -> Result<Vec<ConfigEntry>, DatabaseError> {
        let entries = sqlx::query_as::<_, ConfigEntry>("SELECT key, value FROM config ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    // =========================================================================
    // Worker Operations
    // =========================================================================

    /// Registers a worker, replacing any stale row with the same pid.
    pub async fn register_worker(&self, record: &WorkerRecord) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT OR REPLACE INTO workers (pid, hostname, started_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(i64::from(record.pid))
        .bind(&record.hostname)
        .bind(encode_timestamp(record.started_at))
        .bind(encode_timestamp(record.last_heartbeat))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refreshes a worker's heartbeat. Returns false if the worker has no row.
    pub async fn heartbeat(&self, pid: u32, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat = ?2 WHERE pid = ?1")
            .bind(i64::from(pid))
            .bind(encode_timestamp(at))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Removes a worker's row. Returns false if there was none.
    pub async fn deregister_worker(&self, pid: u32) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM workers WHERE pid = ?1")
            .bind(i64::from(pid))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Lists workers whose heartbeat is within the liveness window at `now`.
    pub async fn active_workers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let workers = sqlx::query_as::<_, WorkerRecord>(
            "SELECT pid, hostname, started_at, last_heartbeat FROM workers
             WHERE last_heartbeat >= ?1
             ORDER BY pid ASC",
        )
        .bind(encode_timestamp(liveness::active_cutoff(now)))
        .fetch_all(&self.pool)
        .await?;
        Ok(workers)
    }

    /// Lists every worker row, including stale ones.
    pub async fn all_workers(&self) -> Result<Vec<WorkerRecord>, DatabaseError> {
        let workers = sqlx::query_as::<_, WorkerRecord>(
            "SELECT pid, hostname, started_at, last_heartbeat FROM workers ORDER BY pid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::NewJob;
    use crate::scheduler::JobQueue;

    async fn open_store(dir: &tempfile::TempDir) -> JobStore {
        JobStore::open(dir.path().join("store.db")).await.unwrap()
    }

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::ConnectionFailed("no such file".to_string());
        assert!(err.to_string().contains("no such file"));
    }

    #[test]
    fn test_non_database_errors_are_not_contention() {
        assert!(!is_contention(&sqlx::Error::RowNotFound));
        assert!(is_contention(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let first = JobStore::open(&path).await.unwrap();
        first.set_config("k", "v").await.unwrap();
        drop(first);

        let second = JobStore::open(&path).await.unwrap();
        assert_eq!(second.get_config("k").await.unwrap().as_deref(), Some("v"));

        let applied = second.applied_migrations().await.unwrap();
        assert_eq!(
            applied.len(),
            crate::storage::schema::all_schema_statements().len()
        );
    }

    #[tokio::test]
    async fn test_seed_default_config_keeps_existing_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .set_config(config::keys::BACKOFF_BASE, "5")
            .await
            .unwrap();

        let inserted = store.seed_default_config().await.unwrap();
        assert_eq!(inserted as usize, config::default_entries().len() - 1);
        assert_eq!(
            store
                .get_config(config::keys::BACKOFF_BASE)
                .await
                .unwrap()
                .as_deref(),
            Some("5")
        );
        assert_eq!(store.seed_default_config().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_config_upsert_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;

        assert!(store.get_config("job_timeout_ms").await.unwrap().is_none());
        store.set_config("job_timeout_ms", "12345").await.unwrap();
        store.set_config("job_timeout_ms", "500").await.unwrap();
        store.set_config("backoff_base", "3").await.unwrap();

        assert_eq!(
            store.get_config("job_timeout_ms").await.unwrap().as_deref(),
            Some("500")
        );
        let entries = store.list_config().await.unwrap();
        assert_eq!(
            entries,
            vec![
                ConfigEntry::new("backoff_base", "3"),
                ConfigEntry::new("job_timeout_ms", "500"),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_jobs_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = JobQueue::new(store.clone());

        for id in ["a", "b", "c"] {
            queue.enqueue(NewJob::new(id, "true")).await.unwrap();
        }
        let claimed = match queue.claim().await.unwrap() {
            crate::scheduler::ClaimOutcome::Claimed(job) => job,
            other => panic!("expected a claimed job, got {:?}", other),
        };
        assert_eq!(claimed.id, "a");
        queue.complete(&claimed.id).await.unwrap();

        let all = store.list_jobs(None).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let pending = store.list_jobs(Some(JobState::Pending)).await.unwrap();
        assert_eq!(pending.len(), 2);

        let counts = store.job_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.total(), 3);

        let recent = store.recent_jobs(1).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "a");
    }

    #[tokio::test]
    async fn test_worker_liveness_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        let fresh = WorkerRecord::new(100, "host", now - chrono::Duration::seconds(10));
        let stale = WorkerRecord::new(200, "host", now - chrono::Duration::seconds(16));
        store.register_worker(&fresh).await.unwrap();
        store.register_worker(&stale).await.unwrap();

        let active = store.active_workers(now).await.unwrap();
        let pids: Vec<u32> = active.iter().map(|w| w.pid).collect();
        assert_eq!(pids, vec![100]);
        assert_eq!(store.all_workers().await.unwrap().len(), 2);

        assert!(store.heartbeat(200, now).await.unwrap());
        assert_eq!(store.active_workers(now).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_register_replaces_and_deregister_removes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let now = Utc::now();

        store
            .register_worker(&WorkerRecord::new(7, "old-host", now))
            .await
            .unwrap();
        store
            .register_worker(&WorkerRecord::new(7, "new-host", now))
            .await
            .unwrap();
        let workers = store.all_workers().await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].hostname, "new-host");

        assert!(store.deregister_worker(7).await.unwrap());
        assert!(!store.deregister_worker(7).await.unwrap());
        assert!(!store.heartbeat(7, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_and_dashboard() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let queue = JobQueue::new(store.clone());

        queue.enqueue(NewJob::new("j1", "true")).await.unwrap();
        queue.enqueue(NewJob::new("j2", "true")).await.unwrap();
        store
            .register_worker(&WorkerRecord::new(1, "host", Utc::now()))
            .await
            .unwrap();

        let status = store.status().await.unwrap();
        assert_eq!(status.jobs.pending, 2);
        assert_eq!(status.active_workers, 1);

        let snapshot = store.dashboard(DEFAULT_RECENT_JOBS).await.unwrap();
        assert_eq!(snapshot.jobs.pending, 2);
        assert_eq!(snapshot.active_worker_count, 1);
        assert_eq!(snapshot.recent_jobs.len(), 2);
        assert_eq!(snapshot.active_workers[0].pid, 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["jobs"]["pending"], 2);
    }
}
