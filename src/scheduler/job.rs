//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the queue:
//!
//! - `Job`: A persisted unit of work (a shell command) and its retry bookkeeping
//! - `JobState`: Lifecycle state of a job
//! - `NewJob`: A job submission as received from a caller
//! - `JobCounts`: Number of jobs per state

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Lifecycle state of a job.
///
/// ```text
/// pending ──claim──► processing ──complete──► completed
///    ▲                   │
///    └──────fail─────────┤
///                        └──fail (budget exhausted)──► dead
/// ```
///
/// `completed` and `dead` are terminal; only an operator retry moves a job
/// out of `dead`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed once `next_run_at` has passed.
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Command exited successfully.
    Completed,
    /// Retry budget exhausted.
    Dead,
}

impl JobState {
    /// All states, in lifecycle order.
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    /// Returns the storage representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(ValidationError::InvalidField {
                field: "state",
                reason: format!(
                    "unknown state '{}' (expected pending, processing, completed or dead)",
                    other
                ),
            }),
        }
    }
}

/// A job as persisted in the `jobs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    /// Caller-supplied unique identifier.
    pub id: String,
    /// Shell command executed by the worker.
    pub command: String,
    /// Current lifecycle state.
    pub state: JobState,
    /// Number of failed execution attempts so far.
    pub attempts: u32,
    /// Attempts allowed before the job is dead-lettered.
    pub max_attempts: u32,
    /// When the job was enqueued.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every state transition.
    pub updated_at: DateTime<Utc>,
    /// The job cannot be claimed before this instant.
    pub next_run_at: DateTime<Utc>,
    /// Diagnostic of the most recent failure, cleared on success.
    pub last_error: Option<String>,
}

impl Job {
    /// Returns the number of attempts left before the job is dead-lettered.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

/// A job submission, usually parsed from the JSON given to `queuectl enqueue`.
///
/// Missing fields deserialize to empty values so that [`NewJob::validate`]
/// can report them by name instead of surfacing a serde error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    /// Unique identifier for the job.
    #[serde(default)]
    pub id: String,
    /// Shell command to execute.
    #[serde(default)]
    pub command: String,
    /// Overrides the configured default retry budget.
    #[serde(default, alias = "max_retries")]
    pub max_attempts: Option<u32>,
}

impl NewJob {
    /// Creates a submission with the configured default retry budget.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_attempts: None,
        }
    }

    /// Sets an explicit retry budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Parses a submission from its JSON form.
    pub fn from_json(payload: &str) -> Result<Self, ValidationError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Checks required fields and bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.command.trim().is_empty() {
            return Err(ValidationError::MissingField("command"));
        }
        if self.max_attempts == Some(0) {
            return Err(ValidationError::InvalidField {
                field: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl JobCounts {
    /// Returns the count for a single state.
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }

    pub(crate) fn set(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Pending => self.pending = count,
            JobState::Processing => self.processing = count,
            JobState::Completed => self.completed = count,
            JobState::Dead => self.dead = count,
        }
    }

    /// Returns the total number of jobs.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }
}
