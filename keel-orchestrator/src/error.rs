//! Engine errors
//!
//! `Validation` and `Concurrency` are returned before anything is written.
//! Command failures are recorded on stage runs and rollback outcomes; they only
//! surface as errors where a caller needs a single verdict.

use keel_core::domain::rollback::RollbackRecord;
use keel_core::domain::run::FailureKind;
use thiserror::Error;

use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error(
        "Rollback failed on {} of {} server(s)",
        .record.failed_servers().len(),
        .record.server_outcomes.len()
    )]
    RollbackPartialFailure { record: Box<RollbackRecord> },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    /// Error matching a recorded command failure
    pub fn from_failure(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            FailureKind::ConnectionError => EngineError::Connection(message),
            FailureKind::Timeout => EngineError::Timeout(message),
            FailureKind::ExecutionError => EngineError::Execution(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
