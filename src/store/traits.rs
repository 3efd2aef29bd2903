//! `JobStore` trait: the storage-access interface the queue core depends on.
//!
//! Three capability groups: insert, find, and conditional update. The
//! conditional updates are the only writes to a job's `status` and
//! `worker_id`, and each is evaluated atomically by the backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, LogMessage, NewJob, NewLogMessage, NewWorker, Worker};

/// Outcome of a conditional claim write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// The job was still waiting and now belongs to the worker.
    Claimed(Job),
    /// The job was no longer waiting (another caller won it, or it is gone).
    Unavailable,
    /// The worker did not exist at the moment of the write.
    WorkerMissing,
}

/// Outcome of a conditional completion write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteAttempt {
    Completed(Job),
    /// The job exists but is not running.
    NotRunning(JobStatus),
    JobMissing,
}

/// Backend-agnostic store for workers, jobs and log messages.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Workers ─────────────────────────────────────────────────────

    /// Insert a worker. The store assigns the id.
    async fn insert_worker(
        &self,
        worker: &NewWorker,
        now: DateTime<Utc>,
    ) -> Result<Worker, DatabaseError>;

    async fn get_worker(&self, id: i64) -> Result<Option<Worker>, DatabaseError>;

    /// All workers, ordered by id.
    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a job in `waiting` state with no owner. The store assigns the id.
    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError>;

    async fn get_job(&self, id: i64) -> Result<Option<Job>, DatabaseError>;

    /// All jobs, ordered by id.
    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError>;

    /// The waiting job that comes first in claim order
    /// (priority asc, created_at asc, id asc), if any.
    async fn next_waiting_job(&self) -> Result<Option<Job>, DatabaseError>;

    /// Assign `job_id` to `worker_id` and mark it running, only if the job
    /// is still waiting and the worker exists.
    async fn claim_if_waiting(
        &self,
        job_id: i64,
        worker_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt, DatabaseError>;

    /// Mark `job_id` finished with `out_data`, only if it is running.
    async fn complete_if_running(
        &self,
        job_id: i64,
        out_data: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompleteAttempt, DatabaseError>;

    // ── Log messages ────────────────────────────────────────────────

    /// Insert a log message. Fails with `DatabaseError::Constraint` if the
    /// job or worker does not exist.
    async fn insert_log_message(
        &self,
        log: &NewLogMessage,
        now: DateTime<Utc>,
    ) -> Result<LogMessage, DatabaseError>;

    /// All log messages, ordered by created_at then id.
    async fn list_log_messages(&self) -> Result<Vec<LogMessage>, DatabaseError>;
}
