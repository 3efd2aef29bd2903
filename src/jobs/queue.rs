//! `JobQueue`: the core facade over a [`JobStore`].
//!
//! Registration of workers and jobs and the listing reads live here; the
//! claim engine, lifecycle and log service add their operations in
//! `claim.rs`, `lifecycle.rs` and `logs.rs`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use super::model::{Job, JobDetail, LogMessage, NewJob, NewWorker, Worker};
use crate::config::ClaimPolicy;
use crate::error::QueueError;
use crate::store::JobStore;

/// Job queue core. Cheap to share behind an `Arc`; holds no state besides
/// the injected store handle and the claim policy.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    policy: ClaimPolicy,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, policy: ClaimPolicy) -> Self {
        Self { store, policy }
    }

    pub(crate) fn store(&self) -> &dyn JobStore {
        self.store.as_ref()
    }

    pub fn policy(&self) -> &ClaimPolicy {
        &self.policy
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a worker.
    pub async fn create_worker(&self, worker: NewWorker) -> Result<Worker, QueueError> {
        worker.validate()?;
        let worker = self.store().insert_worker(&worker, Utc::now()).await?;
        info!(worker_id = worker.id, name = %worker.name, "Worker registered");
        Ok(worker)
    }

    /// Admit a job in `waiting` state.
    pub async fn create_job(&self, job: NewJob) -> Result<Job, QueueError> {
        job.validate()?;
        let job = self.store().insert_job(&job, Utc::now()).await?;
        info!(
            job_id = job.id,
            name = %job.name,
            priority = job.priority,
            "Job created"
        );
        Ok(job)
    }

    // ── Reads ───────────────────────────────────────────────────────

    pub async fn list_workers(&self) -> Result<Vec<Worker>, QueueError> {
        Ok(self.store().list_workers().await?)
    }

    /// One job with its owner and logs.
    pub async fn get_job(&self, job_id: i64) -> Result<JobDetail, QueueError> {
        let job = self
            .store()
            .get_job(job_id)
            .await?
            .ok_or_else(|| QueueError::job_not_found(job_id))?;
        let worker = match job.worker_id {
            Some(worker_id) => self.store().get_worker(worker_id).await?,
            None => None,
        };
        let logs = self
            .store()
            .list_log_messages()
            .await?
            .into_iter()
            .filter(|log| log.job_id == job_id)
            .collect();
        Ok(JobDetail { job, worker, logs })
    }

    /// Every job (by id) with its owner and logs (by creation).
    pub async fn list_jobs(&self) -> Result<Vec<JobDetail>, QueueError> {
        let jobs = self.store().list_jobs().await?;
        let workers: HashMap<i64, Worker> = self
            .store()
            .list_workers()
            .await?
            .into_iter()
            .map(|w| (w.id, w))
            .collect();

        let mut logs_by_job: HashMap<i64, Vec<LogMessage>> = HashMap::new();
        for log in self.store().list_log_messages().await? {
            logs_by_job.entry(log.job_id).or_default().push(log);
        }

        Ok(jobs
            .into_iter()
            .map(|job| JobDetail {
                worker: job.worker_id.and_then(|id| workers.get(&id).cloned()),
                logs: logs_by_job.remove(&job.id).unwrap_or_default(),
                job,
            })
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::jobs::model::{DEFAULT_PRIORITY, JobStatus, NewLogMessage};
    use crate::store::{LibSqlBackend, MemoryStore};

    pub(crate) fn memory_queue() -> JobQueue {
        JobQueue::new(Arc::new(MemoryStore::new()), ClaimPolicy::default())
    }

    pub(crate) async fn libsql_queue() -> JobQueue {
        let store = LibSqlBackend::new_memory().await.unwrap();
        JobQueue::new(Arc::new(store), ClaimPolicy::default())
    }

    #[tokio::test]
    async fn create_worker_assigns_id_and_timestamps() {
        let queue = libsql_queue().await;
        let worker = queue.create_worker(NewWorker::new("w1")).await.unwrap();
        assert_eq!(worker.id, 1);
        assert_eq!(worker.name, "w1");
        assert_eq!(worker.created_at, worker.updated_at);
    }

    #[tokio::test]
    async fn create_worker_rejects_blank_name() {
        let queue = memory_queue();
        let err = queue.create_worker(NewWorker::new("  ")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidInput(_)));
        assert!(queue.list_workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_job_defaults() {
        let queue = libsql_queue().await;
        let job = queue.create_job(NewJob::new("build")).await.unwrap();
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert!(job.worker_id.is_none());
        assert!(job.in_data.is_none());
    }

    #[tokio::test]
    async fn create_job_keeps_input_and_priority() {
        let queue = memory_queue();
        let job = queue
            .create_job(NewJob::new("deploy").with_priority(10).with_input("v1.2"))
            .await
            .unwrap();
        assert_eq!(job.priority, 10);
        assert_eq!(job.in_data.as_deref(), Some("v1.2"));
    }

    #[tokio::test]
    async fn create_job_rejects_blank_name() {
        let queue = memory_queue();
        assert!(queue.create_job(NewJob::new("")).await.is_err());
        assert!(queue.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_jobs_nests_owner_and_logs() {
        let queue = libsql_queue().await;
        let worker = queue.create_worker(NewWorker::new("w1")).await.unwrap();
        let build = queue.create_job(NewJob::new("build")).await.unwrap();
        let idle = queue.create_job(NewJob::new("idle")).await.unwrap();
        queue.claim_job(worker.id).await.unwrap().unwrap();
        queue
            .append_log(NewLogMessage::new(build.id, worker.id, "compiling"))
            .await
            .unwrap();

        let jobs = queue.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job.id, build.id);
        assert_eq!(jobs[0].worker.as_ref().map(|w| w.id), Some(worker.id));
        assert_eq!(jobs[0].logs.len(), 1);
        assert_eq!(jobs[0].logs[0].text, "compiling");
        assert_eq!(jobs[1].job.id, idle.id);
        assert!(jobs[1].worker.is_none());
        assert!(jobs[1].logs.is_empty());
    }

    #[tokio::test]
    async fn listing_twice_is_identical() {
        let queue = libsql_queue().await;
        let worker = queue.create_worker(NewWorker::new("w1")).await.unwrap();
        let job = queue.create_job(NewJob::new("a")).await.unwrap();
        queue.create_job(NewJob::new("b")).await.unwrap();
        queue
            .append_log(NewLogMessage::new(job.id, worker.id, "note"))
            .await
            .unwrap();

        assert_eq!(queue.list_jobs().await.unwrap(), queue.list_jobs().await.unwrap());
        assert_eq!(queue.list_logs().await.unwrap(), queue.list_logs().await.unwrap());
    }

    #[tokio::test]
    async fn get_job_detail() {
        let queue = memory_queue();
        let worker = queue.create_worker(NewWorker::new("w1")).await.unwrap();
        let job = queue.create_job(NewJob::new("build")).await.unwrap();
        queue
            .append_log(NewLogMessage::new(job.id, worker.id, "queued note"))
            .await
            .unwrap();

        let detail = queue.get_job(job.id).await.unwrap();
        assert_eq!(detail.job, job);
        assert!(detail.worker.is_none());
        assert_eq!(detail.logs.len(), 1);

        assert!(queue.get_job(999).await.unwrap_err().is_not_found());
    }
}
