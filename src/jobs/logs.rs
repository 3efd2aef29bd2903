//! Log service: append-only progress notes on jobs.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{debug, warn};

use super::model::{Job, LogDetail, LogMessage, NewLogMessage, Worker};
use super::queue::JobQueue;
use crate::error::QueueError;

impl JobQueue {
    /// Append a log message to a job, in any job state.
    ///
    /// The job and the worker must both exist; the author does not have to
    /// be the job's owner.
    pub async fn append_log(&self, log: NewLogMessage) -> Result<LogMessage, QueueError> {
        log.validate()?;
        if self.store().get_job(log.job_id).await?.is_none() {
            return Err(QueueError::job_not_found(log.job_id));
        }
        if self.store().get_worker(log.worker_id).await?.is_none() {
            return Err(QueueError::worker_not_found(log.worker_id));
        }

        let message = self.store().insert_log_message(&log, Utc::now()).await?;
        debug!(
            log_id = message.id,
            job_id = message.job_id,
            worker_id = message.worker_id,
            "Log appended"
        );
        Ok(message)
    }

    /// Every log message, oldest first, with its job and worker.
    pub async fn list_logs(&self) -> Result<Vec<LogDetail>, QueueError> {
        let logs = self.store().list_log_messages().await?;
        let jobs: HashMap<i64, Job> = self
            .store()
            .list_jobs()
            .await?
            .into_iter()
            .map(|j| (j.id, j))
            .collect();
        let workers: HashMap<i64, Worker> = self
            .store()
            .list_workers()
            .await?
            .into_iter()
            .map(|w| (w.id, w))
            .collect();

        let mut details = Vec::with_capacity(logs.len());
        for log in logs {
            match (jobs.get(&log.job_id), workers.get(&log.worker_id)) {
                (Some(job), Some(worker)) => details.push(LogDetail {
                    job: job.clone(),
                    worker: worker.clone(),
                    log,
                }),
                // Jobs and workers are read after logs and never deleted.
                _ => warn!(log_id = log.id, "Skipping log with unresolved references"),
            }
        }
        Ok(details)
    }
}
