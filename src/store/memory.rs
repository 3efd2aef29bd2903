//! In-process `JobStore`: all records behind one `RwLock`.
//!
//! Every write takes the write lock, so conditional updates are serialized
//! by construction. Reads take the read lock and return clones.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, LogMessage, NewJob, NewLogMessage, NewWorker, Worker};
use crate::store::traits::{ClaimAttempt, CompleteAttempt, JobStore};

#[derive(Default)]
struct Tables {
    workers: BTreeMap<i64, Worker>,
    jobs: BTreeMap<i64, Job>,
    logs: BTreeMap<i64, LogMessage>,
    last_worker_id: i64,
    last_job_id: i64,
    last_log_id: i64,
}

/// Volatile store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_worker(
        &self,
        worker: &NewWorker,
        now: DateTime<Utc>,
    ) -> Result<Worker, DatabaseError> {
        let mut tables = self.tables.write().await;
        tables.last_worker_id += 1;
        let worker = Worker {
            id: tables.last_worker_id,
            name: worker.name.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: i64) -> Result<Option<Worker>, DatabaseError> {
        Ok(self.tables.read().await.workers.get(&id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        Ok(self.tables.read().await.workers.values().cloned().collect())
    }

    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
        let mut tables = self.tables.write().await;
        tables.last_job_id += 1;
        let job = Job {
            id: tables.last_job_id,
            name: job.name.clone(),
            priority: job.priority,
            status: JobStatus::Waiting,
            in_data: job.in_data.clone(),
            out_data: None,
            worker_id: None,
            created_at: now,
            updated_at: now,
        };
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, DatabaseError> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        Ok(self.tables.read().await.jobs.values().cloned().collect())
    }

    async fn next_waiting_job(&self) -> Result<Option<Job>, DatabaseError> {
        let tables = self.tables.read().await;
        Ok(tables
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Waiting)
            .min_by_key(|job| (job.priority, job.created_at, job.id))
            .cloned())
    }

    async fn claim_if_waiting(
        &self,
        job_id: i64,
        worker_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt, DatabaseError> {
        let mut tables = self.tables.write().await;
        if !tables.workers.contains_key(&worker_id) {
            return Ok(ClaimAttempt::WorkerMissing);
        }
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(ClaimAttempt::Unavailable);
        };
        if !job.status.can_transition_to(JobStatus::Running) {
            return Ok(ClaimAttempt::Unavailable);
        }

        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id);
        job.updated_at = now;
        debug!(job_id, worker_id, "Job claimed in memory store");
        Ok(ClaimAttempt::Claimed(job.clone()))
    }

    async fn complete_if_running(
        &self,
        job_id: i64,
        out_data: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompleteAttempt, DatabaseError> {
        let mut tables = self.tables.write().await;
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(CompleteAttempt::JobMissing);
        };
        if !job.status.can_transition_to(JobStatus::Finished) {
            return Ok(CompleteAttempt::NotRunning(job.status));
        }

        job.status = JobStatus::Finished;
        job.out_data = out_data.map(str::to_string);
        job.updated_at = now;
        Ok(CompleteAttempt::Completed(job.clone()))
    }

    async fn insert_log_message(
        &self,
        log: &NewLogMessage,
        now: DateTime<Utc>,
    ) -> Result<LogMessage, DatabaseError> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.contains_key(&log.job_id) || !tables.workers.contains_key(&log.worker_id) {
            return Err(DatabaseError::Constraint(format!(
                "log message references missing job {} or worker {}",
                log.job_id, log.worker_id
            )));
        }
        tables.last_log_id += 1;
        let message = LogMessage {
            id: tables.last_log_id,
            job_id: log.job_id,
            worker_id: log.worker_id,
            text: log.text.clone(),
            created_at: now,
            updated_at: now,
        };
        tables.logs.insert(message.id, message.clone());
        Ok(message)
    }

    async fn list_log_messages(&self) -> Result<Vec<LogMessage>, DatabaseError> {
        let tables = self.tables.read().await;
        let mut logs: Vec<LogMessage> = tables.logs.values().cloned().collect();
        logs.sort_by_key(|log| (log.created_at, log.id));
        Ok(logs)
    }
}
