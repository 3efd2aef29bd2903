//! Claim engine: hand the next waiting job to a worker, at most once.
//!
//! Each attempt reads the best waiting candidate and then flips it with a
//! conditional update that only succeeds while the job is still `waiting`.
//! A lost race is retried with linear backoff plus jitter, up to
//! [`ClaimPolicy::max_attempts`](crate::config::ClaimPolicy) times.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use super::model::Job;
use super::queue::JobQueue;
use crate::error::QueueError;
use crate::store::ClaimAttempt;

impl JobQueue {
    /// Claim the highest-priority, oldest waiting job for `worker_id`.
    ///
    /// Returns `Ok(None)` when nothing is waiting. Fails with `NotFound`
    /// (naming the worker) without touching any job when the worker is not
    /// registered, and with `Contention` when every attempt lost its race.
    pub async fn claim_job(&self, worker_id: i64) -> Result<Option<Job>, QueueError> {
        if self.store().get_worker(worker_id).await?.is_none() {
            return Err(QueueError::worker_not_found(worker_id));
        }

        let max_attempts = self.policy().max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let Some(candidate) = self.store().next_waiting_job().await? else {
                debug!(worker_id, "No waiting job");
                return Ok(None);
            };

            match self
                .store()
                .claim_if_waiting(candidate.id, worker_id, Utc::now())
                .await?
            {
                ClaimAttempt::Claimed(job) => {
                    debug_assert!(job.status.has_owner() && job.worker_id == Some(worker_id));
                    info!(
                        job_id = job.id,
                        worker_id,
                        priority = job.priority,
                        attempt,
                        "Job claimed"
                    );
                    return Ok(Some(job));
                }
                ClaimAttempt::WorkerMissing => {
                    return Err(QueueError::worker_not_found(worker_id));
                }
                ClaimAttempt::Unavailable => {
                    debug!(
                        job_id = candidate.id,
                        worker_id, attempt, "Lost claim race, retrying"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff(attempt)).await;
                    }
                }
            }
        }

        warn!(worker_id, attempts = max_attempts, "Claim gave up under contention");
        Err(QueueError::Contention {
            worker_id,
            attempts: max_attempts,
        })
    }

    /// `base * attempt` plus up to one `base` of jitter, saturating.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.policy().backoff_base;
        let jitter_ms = {
            let max = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
            if max == 0 {
                0
            } else {
                rand::thread_rng().gen_range(0..=max)
            }
        };
        base.saturating_mul(attempt)
            .saturating_add(Duration::from_millis(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::config::ClaimPolicy;
    use crate::error::DatabaseError;
    use crate::jobs::model::{JobStatus, LogMessage, NewJob, NewLogMessage, NewWorker, Worker};
    use crate::jobs::queue::tests::{libsql_queue, memory_queue};
    use crate::store::{CompleteAttempt, JobStore, MemoryStore};

    #[tokio::test]
    async fn claims_by_priority_then_none() {
        let queue = libsql_queue().await;
        let w1 = queue.create_worker(NewWorker::new("w1")).await.unwrap();
        let build = queue
            .create_job(NewJob::new("build").with_priority(5))
            .await
            .unwrap();
        let deploy = queue
            .create_job(NewJob::new("deploy").with_priority(10))
            .await
            .unwrap();

        let first = queue.claim_job(w1.id).await.unwrap().unwrap();
        assert_eq!(first.id, build.id);
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.worker_id, Some(w1.id));

        let second = queue.claim_job(w1.id).await.unwrap().unwrap();
        assert_eq!(second.id, deploy.id);

        assert!(queue.claim_job(w1.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn equal_priority_claims_oldest_first() {
        let queue = memory_queue();
        let worker = queue.create_worker(NewWorker::new("w")).await.unwrap();
        let older = queue.create_job(NewJob::new("a")).await.unwrap();
        queue.create_job(NewJob::new("b")).await.unwrap();

        assert_eq!(queue.claim_job(worker.id).await.unwrap().unwrap().id, older.id);
    }

    #[tokio::test]
    async fn empty_queue_returns_none() {
        let queue = memory_queue();
        let worker = queue.create_worker(NewWorker::new("w")).await.unwrap();
        assert!(queue.claim_job(worker.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_worker_leaves_jobs_untouched() {
        let queue = libsql_queue().await;
        let job = queue.create_job(NewJob::new("build")).await.unwrap();

        let err = queue.claim_job(42).await.unwrap_err();
        assert_eq!(err.to_string(), "worker 42 not found");

        let stored = queue.get_job(job.id).await.unwrap().job;
        assert_eq!(stored.status, JobStatus::Waiting);
        assert!(stored.worker_id.is_none());
    }

    #[tokio::test]
    async fn finished_jobs_are_never_reclaimed() {
        let queue = memory_queue();
        let worker = queue.create_worker(NewWorker::new("w")).await.unwrap();
        let job = queue.create_job(NewJob::new("once")).await.unwrap();
        queue.claim_job(worker.id).await.unwrap().unwrap();
        queue.complete_job(job.id, None).await.unwrap();

        assert!(queue.claim_job(worker.id).await.unwrap().is_none());
    }

    /// A store where every conditional update loses its race.
    struct AlwaysLosesRace {
        inner: MemoryStore,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl JobStore for AlwaysLosesRace {
        async fn insert_worker(
            &self,
            worker: &NewWorker,
            now: DateTime<Utc>,
        ) -> Result<Worker, DatabaseError> {
            self.inner.insert_worker(worker, now).await
        }

        async fn get_worker(&self, id: i64) -> Result<Option<Worker>, DatabaseError> {
            self.inner.get_worker(id).await
        }

        async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
            self.inner.list_workers().await
        }

        async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
            self.inner.insert_job(job, now).await
        }

        async fn get_job(&self, id: i64) -> Result<Option<Job>, DatabaseError> {
            self.inner.get_job(id).await
        }

        async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
            self.inner.list_jobs().await
        }

        async fn next_waiting_job(&self) -> Result<Option<Job>, DatabaseError> {
            self.inner.next_waiting_job().await
        }

        async fn claim_if_waiting(
            &self,
            _job_id: i64,
            _worker_id: i64,
            _now: DateTime<Utc>,
        ) -> Result<ClaimAttempt, DatabaseError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(ClaimAttempt::Unavailable)
        }

        async fn complete_if_running(
            &self,
            job_id: i64,
            out_data: Option<&str>,
            now: DateTime<Utc>,
        ) -> Result<CompleteAttempt, DatabaseError> {
            self.inner.complete_if_running(job_id, out_data, now).await
        }

        async fn insert_log_message(
            &self,
            log: &NewLogMessage,
            now: DateTime<Utc>,
        ) -> Result<LogMessage, DatabaseError> {
            self.inner.insert_log_message(log, now).await
        }

        async fn list_log_messages(&self) -> Result<Vec<LogMessage>, DatabaseError> {
            self.inner.list_log_messages().await
        }
    }

    #[tokio::test]
    async fn persistent_lost_races_report_contention() {
        let store = Arc::new(AlwaysLosesRace {
            inner: MemoryStore::new(),
            attempts: AtomicU32::new(0),
        });
        let queue = JobQueue::new(
            store.clone(),
            ClaimPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(1),
            },
        );
        let worker = queue.create_worker(NewWorker::new("w")).await.unwrap();
        let job = queue.create_job(NewJob::new("hot")).await.unwrap();

        let err = queue.claim_job(worker.id).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, QueueError::Contention { attempts: 3, .. }));
        assert_eq!(store.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(
            queue.get_job(job.id).await.unwrap().job.status,
            JobStatus::Waiting
        );
    }

    #[test]
    fn backoff_grows_linearly_with_bounded_jitter() {
        let queue = JobQueue::new(
            Arc::new(MemoryStore::new()),
            ClaimPolicy {
                max_attempts: 4,
                backoff_base: Duration::from_millis(10),
            },
        );
        for attempt in 1..=3u32 {
            let delay = queue.backoff(attempt);
            assert!(delay >= Duration::from_millis(10) * attempt);
            assert!(delay <= Duration::from_millis(10) * (attempt + 1));
        }
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let queue = JobQueue::new(
            Arc::new(MemoryStore::new()),
            ClaimPolicy {
                max_attempts: u32::MAX,
                backoff_base: Duration::MAX,
            },
        );
        assert_eq!(queue.backoff(1), Duration::MAX);
        assert_eq!(queue.backoff(u32::MAX), Duration::MAX);
    }
}
