//! SQLite-backed job queue with atomic claim.
//!
//! This module owns every state transition of a job:
//!
//! - `enqueue`: validate and insert a new `pending` job
//! - `claim`: move the oldest due `pending` job to `processing`
//! - `complete`: `processing` → `completed`
//! - `fail`: `processing` → `pending` (with backoff) or `dead`
//! - `retry_dead_letter`: operator-driven `dead` → `pending`
//!
//! # Claim protocol
//!
//! Worker processes share one database file and hold no in-process locks.
//! A claim runs inside a `BEGIN IMMEDIATE` transaction, which takes SQLite's
//! write lock before reading, and flips the row with a compare-and-swap
//! `UPDATE ... WHERE state = 'pending'`. Two workers can therefore never both
//! move the same row to `processing`. A worker that cannot get the lock
//! within the busy timeout gets [`ClaimOutcome::Contended`] and simply polls
//! again.
//!
//! # Crash recovery
//!
//! `processing` carries no lease. A job whose worker dies mid-execution stays
//! `processing` until an operator intervenes; nothing here returns it to
//! `pending`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use thiserror::Error;
use tracing::debug;

use crate::config::ConfigResolver;
use crate::error::ValidationError;
use crate::storage::schema::encode_timestamp;
use crate::storage::{is_contention, DatabaseError, JobStore, QueueStatus};

use super::backoff::{RetryDecision, RetryPolicy};
use super::job::{Job, JobState, NewJob};

/// Attempts made to record a completion or failure when the database is
/// locked.
const TRANSITION_RETRIES: u32 = 3;

/// Pause between transition attempts on a locked database.
const TRANSITION_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The submission was rejected before touching the store.
    #[error("Invalid job: {0}")]
    Validation(#[from] ValidationError),

    /// A job with this id already exists.
    #[error("Job '{0}' already exists")]
    DuplicateJob(String),

    /// Job not found in the store.
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// Store operation failed.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Query failed.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The job now belongs to the caller and is `processing`.
    Claimed(Job),
    /// No `pending` job is due.
    Empty,
    /// Another worker holds the write lock; try again next poll.
    Contended,
}

/// Result of recording a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `pending`, not claimable before `next_run_at`.
    Retrying {
        attempts: u32,
        delay_secs: u64,
        next_run_at: DateTime<Utc>,
    },
    /// Moved to `dead`.
    DeadLettered { attempts: u32 },
    /// The job was not `processing`; nothing changed.
    NotProcessing,
}

/// The job lifecycle engine.
#[derive(Clone)]
pub struct JobQueue {
    store: JobStore,
    config: ConfigResolver,
}

impl JobQueue {
    /// Creates a queue over an opened store.
    pub fn new(store: JobStore) -> Self {
        let config = store.config();
        Self { store, config }
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Returns the configuration resolver.
    pub fn config(&self) -> &ConfigResolver {
        &self.config
    }

    /// Validates and inserts a new `pending` job, due immediately.
    ///
    /// When the submission carries no `max_attempts`, the configured default
    /// applies.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job, QueueError> {
        new_job.validate()?;

        let max_attempts = match new_job.max_attempts {
            Some(max) => max,
            None => self.config.default_max_attempts().await,
        };
        let now = encode_timestamp(Utc::now());

        let inserted = sqlx::query_as::<_, Job>(
            "INSERT INTO jobs (id, command, state, attempts, max_attempts,
                               created_at, updated_at, next_run_at, last_error)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4, NULL)
             RETURNING *",
        )
        .bind(&new_job.id)
        .bind(&new_job.command)
        .bind(i64::from(max_attempts))
        .bind(&now)
        .fetch_one(self.store.pool())
        .await;

        match inserted {
            Ok(job) => {
                debug!(job_id = %job.id, max_attempts = max_attempts, "Job enqueued");
                Ok(job)
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(QueueError::DuplicateJob(new_job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claims the oldest due `pending` job.
    pub async fn claim(&self) -> Result<ClaimOutcome, QueueError> {
        self.claim_at(Utc::now()).await
    }

    /// Claims the oldest `pending` job due at `now`.
    pub async fn claim_at(&self, now: DateTime<Utc>) -> Result<ClaimOutcome, QueueError> {
        let mut conn = match self.store.pool().acquire().await {
            Ok(conn) => conn,
            Err(e) if is_contention(&e) => return Ok(ClaimOutcome::Contended),
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = begin_immediate(&mut conn).await {
            return if is_contention(&e) {
                Ok(ClaimOutcome::Contended)
            } else {
                Err(e.into())
            };
        }

        let claimed = claim_in_transaction(&mut conn, now).await;
        match finish(&mut conn, claimed).await {
            Ok(Some(job)) => {
                debug!(job_id = %job.id, attempts = job.attempts, "Job claimed");
                Ok(ClaimOutcome::Claimed(job))
            }
            Ok(None) => Ok(ClaimOutcome::Empty),
            Err(e) if is_contention(&e) => Ok(ClaimOutcome::Contended),
            Err(e) => Err(e.into()),
        }
    }

    /// Marks a `processing` job as `completed`.
    ///
    /// Returns false if the job was not `processing`.
    pub async fn complete(&self, id: &str) -> Result<bool, QueueError> {
        self.complete_at(id, Utc::now()).await
    }

    /// Marks a `processing` job as `completed` at `now`.
    pub async fn complete_at(&self, id: &str, now: DateTime<Utc>) -> Result<bool, QueueError> {
        let mut attempt = 1;
        loop {
            let result = sqlx::query(
                "UPDATE jobs SET state = 'completed', last_error = NULL, updated_at = ?2
                 WHERE id = ?1 AND state = 'processing'",
            )
            .bind(id)
            .bind(encode_timestamp(now))
            .execute(self.store.pool())
            .await;

            match result {
                Ok(done) => return Ok(done.rows_affected() > 0),
                Err(e) if is_contention(&e) && attempt < TRANSITION_RETRIES => {
                    debug!(job_id = id, attempt = attempt, "Database locked, retrying completion");
                    attempt += 1;
                    tokio::time::sleep(TRANSITION_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Records a failed execution of a `processing` job.
    ///
    /// The retry policy is resolved from configuration on every call.
    pub async fn fail(&self, id: &str, error: &str) -> Result<FailureOutcome, QueueError> {
        self.fail_at(id, error, Utc::now()).await
    }

    /// Records a failed execution of a `processing` job at `now`.
    pub async fn fail_at(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        let policy = self.config.retry_policy().await;

        let mut attempt = 1;
        loop {
            match self.try_fail(id, error, now, &policy).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => return Err(QueueError::JobNotFound(id.to_string())),
                Err(e) if is_contention(&e) && attempt < TRANSITION_RETRIES => {
                    debug!(job_id = id, attempt = attempt, "Database locked, retrying failure");
                    attempt += 1;
                    tokio::time::sleep(TRANSITION_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn try_fail(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<Option<FailureOutcome>, sqlx::Error> {
        let mut conn = self.store.pool().acquire().await?;
        begin_immediate(&mut conn).await?;
        let outcome = fail_in_transaction(&mut conn, id, error, now, policy).await;
        finish(&mut conn, outcome).await
    }

    /// Lists dead-lettered jobs, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.list_jobs(Some(JobState::Dead)).await?)
    }

    /// Moves a `dead` job back to `pending` with a fresh retry budget.
    ///
    /// Returns false if the job does not exist or is not `dead`.
    pub async fn retry_dead_letter(&self, id: &str) -> Result<bool, QueueError> {
        self.retry_dead_letter_at(id, Utc::now()).await
    }

    /// Moves a `dead` job back to `pending`, due at `now`.
    pub async fn retry_dead_letter_at(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE jobs
             SET state = 'pending', attempts = 0, last_error = NULL,
                 next_run_at = ?2, updated_at = ?2
             WHERE id = ?1 AND state = 'dead'",
        )
        .bind(id)
        .bind(encode_timestamp(now))
        .execute(self.store.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns job counts and the number of active workers.
    pub async fn stats(&self) -> Result<QueueStatus, QueueError> {
        Ok(self.store.status().await?)
    }
}

async fn begin_immediate(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(())
}

/// Commits on success, rolls back otherwise. A failed commit is rolled back
/// too, so the connection always returns to the pool outside a transaction.
async fn finish<T>(
    conn: &mut SqliteConnection,
    result: Result<T, sqlx::Error>,
) -> Result<T, sqlx::Error> {
    let err = match result {
        Ok(value) => match sqlx::query("COMMIT").execute(&mut *conn).await {
            Ok(_) => return Ok(value),
            Err(e) => e,
        },
        Err(e) => e,
    };

    if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        debug!(error = %rollback_err, "Rollback failed");
    }
    Err(err)
}

async fn claim_in_transaction(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
) -> Result<Option<Job>, sqlx::Error> {
    let now = encode_timestamp(now);

    let candidate: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM jobs
         WHERE state = 'pending' AND next_run_at <= ?1
         ORDER BY created_at ASC, rowid ASC
         LIMIT 1",
    )
    .bind(&now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((id,)) = candidate else {
        return Ok(None);
    };

    sqlx::query_as::<_, Job>(
        "UPDATE jobs SET state = 'processing', updated_at = ?2
         WHERE id = ?1 AND state = 'pending'
         RETURNING *",
    )
    .bind(&id)
    .bind(&now)
    .fetch_optional(&mut *conn)
    .await
}

async fn fail_in_transaction(
    conn: &mut SqliteConnection,
    id: &str,
    error: &str,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> Result<Option<FailureOutcome>, sqlx::Error> {
    let current: Option<(JobState, u32, u32)> =
        sqlx::query_as("SELECT state, attempts, max_attempts FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    let Some((state, attempts, max_attempts)) = current else {
        return Ok(None);
    };
    if state != JobState::Processing {
        return Ok(Some(FailureOutcome::NotProcessing));
    }

    let updated_at = encode_timestamp(now);
    let outcome = match policy.decide(attempts, max_attempts) {
        RetryDecision::Retry { attempts, delay } => {
            let next_run_at = policy.next_run_at(now, attempts);
            sqlx::query(
                "UPDATE jobs
                 SET state = 'pending', attempts = ?2, last_error = ?3,
                     next_run_at = ?4, updated_at = ?5
                 WHERE id = ?1 AND state = 'processing'",
            )
            .bind(id)
            .bind(i64::from(attempts))
            .bind(error)
            .bind(encode_timestamp(next_run_at))
            .bind(&updated_at)
            .execute(&mut *conn)
            .await?;

            FailureOutcome::Retrying {
                attempts,
                delay_secs: delay.as_secs(),
                next_run_at,
            }
        }
        RetryDecision::DeadLetter { attempts } => {
            sqlx::query(
                "UPDATE jobs
                 SET state = 'dead', attempts = ?2, last_error = ?3, updated_at = ?4
                 WHERE id = ?1 AND state = 'processing'",
            )
            .bind(id)
            .bind(i64::from(attempts))
            .bind(error)
            .bind(&updated_at)
            .execute(&mut *conn)
            .await?;

            FailureOutcome::DeadLettered { attempts }
        }
    };

    Ok(Some(outcome))
}
