//! Error types shared across queuectl subsystems.
//!
//! Store, migration and queue errors live next to the code that raises them;
//! this module holds the input validation errors that are reported before any
//! mutation reaches the store.

use thiserror::Error;

/// Errors raised while validating a job submission.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Malformed job payload: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        ValidationError::Malformed(err.to_string())
    }
}
