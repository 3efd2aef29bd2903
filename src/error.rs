//! Error types for the job queue.

use std::fmt;

use crate::jobs::model::JobStatus;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    /// Another connection held the lock past the busy timeout.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Kind of record a [`QueueError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Job,
    Worker,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Job => write!(f, "job"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// Errors returned by the queue operations.
///
/// "No job available" is not an error: `claim_job` returns `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: i64 },

    #[error("Job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: i64,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("Claim for worker {worker_id} lost {attempts} races in a row, retry later")]
    Contention { worker_id: i64, attempts: u32 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl QueueError {
    pub fn job_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: EntityKind::Job,
            id,
        }
    }

    pub fn worker_not_found(id: i64) -> Self {
        Self::NotFound {
            entity: EntityKind::Worker,
            id,
        }
    }

    /// True when the referenced job or worker does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the caller may retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_entity() {
        let err = QueueError::worker_not_found(7);
        assert_eq!(err.to_string(), "worker 7 not found");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = QueueError::job_not_found(3);
        assert_eq!(err.to_string(), "job 3 not found");
    }

    #[test]
    fn invalid_state_message() {
        let err = QueueError::InvalidState {
            job_id: 4,
            status: JobStatus::Waiting,
            expected: JobStatus::Running,
        };
        assert_eq!(err.to_string(), "Job 4 is waiting, expected running");
    }

    #[test]
    fn contention_is_retryable() {
        let err = QueueError::Contention {
            worker_id: 1,
            attempts: 8,
        };
        assert!(err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn database_error_converts() {
        let err: QueueError = DatabaseError::Query("boom".into()).into();
        assert!(matches!(err, QueueError::Database(_)));
        assert!(err.to_string().contains("boom"));
    }
}
