//! Job state machine: `waiting → running → finished`.
//!
//! `waiting → running` happens only through [`JobQueue::claim_job`];
//! `running → finished` only through [`JobQueue::complete_job`].

use std::str::FromStr;

use chrono::Utc;
use tracing::info;

use super::model::{Job, JobStatus};
use super::queue::JobQueue;
use crate::error::QueueError;
use crate::store::CompleteAttempt;

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!((self, target), (Waiting, Running) | (Running, Finished))
    }

    /// Whether a job in this state must have an owner.
    pub fn has_owner(&self) -> bool {
        !matches!(self, Self::Waiting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

impl JobQueue {
    /// Mark a running job finished, recording its output.
    ///
    /// Fails with `NotFound` if the job does not exist and `InvalidState`
    /// unless it is currently running.
    pub async fn complete_job(&self, job_id: i64, out_data: Option<&str>) -> Result<Job, QueueError> {
        match self
            .store()
            .complete_if_running(job_id, out_data, Utc::now())
            .await?
        {
            CompleteAttempt::Completed(job) => {
                info!(job_id, worker_id = ?job.worker_id, "Job finished");
                Ok(job)
            }
            CompleteAttempt::NotRunning(status) => Err(QueueError::InvalidState {
                job_id,
                status,
                expected: JobStatus::Running,
            }),
            CompleteAttempt::JobMissing => Err(QueueError::job_not_found(job_id)),
        }
    }
}
