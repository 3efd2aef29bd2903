//! Job queue data model: jobs, workers, log messages and their views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Priority assigned to jobs created without one. Lower values are claimed first.
pub const DEFAULT_PRIORITY: i32 = 1000;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, not yet claimed by any worker.
    Waiting,
    /// Claimed by exactly one worker.
    Running,
    /// Completed by an external signal. Terminal.
    Finished,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub name: String,
    /// Claim precedence (lower = sooner). Fixed at creation.
    pub priority: i32,
    pub status: JobStatus,
    /// Input payload. Fixed at creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_data: Option<String>,
    /// Output payload, recorded on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_data: Option<String>,
    /// The claimant. Set iff status is `running` or `finished`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    /// Not required to be unique.
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An append-only progress note written by a worker against a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub id: i64,
    pub job_id: i64,
    pub worker_id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A job that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub in_data: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl NewJob {
    /// A waiting job with default priority and no input.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_data: None,
            priority: DEFAULT_PRIORITY,
        }
    }

    /// Builder: set input payload.
    pub fn with_input(mut self, in_data: impl Into<String>) -> Self {
        self.in_data = Some(in_data.into());
        self
    }

    /// Builder: set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        require_non_blank("job name", &self.name)
    }
}

/// A worker that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewWorker {
    pub name: String,
}

impl NewWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        require_non_blank("worker name", &self.name)
    }
}

/// A log message that has not been stored yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogMessage {
    pub job_id: i64,
    pub worker_id: i64,
    pub text: String,
}

impl NewLogMessage {
    pub fn new(job_id: i64, worker_id: i64, text: impl Into<String>) -> Self {
        Self {
            job_id,
            worker_id,
            text: text.into(),
        }
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        require_non_blank("log text", &self.text)
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), QueueError> {
    if value.trim().is_empty() {
        return Err(QueueError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

/// A job together with its owner and its log messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    #[serde(default)]
    pub worker: Option<Worker>,
    #[serde(default)]
    pub logs: Vec<LogMessage>,
}

/// A log message together with the job and worker it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogDetail {
    #[serde(flatten)]
    pub log: LogMessage,
    pub job: Job,
    pub worker: Worker,
}
