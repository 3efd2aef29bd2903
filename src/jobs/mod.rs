//! Job queue core: model, lifecycle, claim engine and log service.

pub mod claim;
pub mod lifecycle;
pub mod logs;
pub mod model;
pub mod queue;

pub use model::{
    DEFAULT_PRIORITY, Job, JobDetail, JobStatus, LogDetail, LogMessage, NewJob, NewLogMessage,
    NewWorker, Worker,
};
pub use queue::JobQueue;
