//! Persistence layer: the `JobStore` interface and its backends.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{ClaimAttempt, CompleteAttempt, JobStore};
