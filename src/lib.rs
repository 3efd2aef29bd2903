//! Job queue where workers claim prioritized jobs exactly once and report progress.

pub mod api;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;
