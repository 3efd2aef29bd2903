//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Several backends may open
//! the same file; SQLite serializes their writers and every status write is
//! a single conditional `UPDATE ... RETURNING`, so a job can only leave
//! `waiting` once no matter how many connections race for it.
//!
//! File databases get a fresh connection per operation. A listing that is
//! still stepping its rows then holds its read snapshot on its own
//! connection, and writers wait on the busy timeout instead of failing to
//! upgrade a stale snapshot.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::jobs::model::{Job, JobStatus, LogMessage, NewJob, NewLogMessage, NewWorker, Worker};
use crate::store::migrations;
use crate::store::traits::{ClaimAttempt, CompleteAttempt, JobStore};

/// How long a writer waits on a locked database file before failing.
const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Primary result codes for a locked database (extended codes keep them
/// in the low byte).
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// libSQL database backend.
pub struct LibSqlBackend {
    db: Arc<LibSqlDatabase>,
    /// Set for in-memory databases, where every new connection would open
    /// a separate empty database.
    shared: Option<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            shared: None,
        };
        let conn = backend.connect().await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        migrations::run_migrations(&conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            shared: Some(conn),
        })
    }

    /// Connection for one operation.
    async fn connect(&self) -> Result<Connection, DatabaseError> {
        if let Some(conn) = &self.shared {
            return Ok(conn.clone());
        }
        let conn = self
            .db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;
        pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        Ok(conn)
    }

    /// The conditional claim write. `Ok(None)` when no row matched.
    async fn try_claim(
        &self,
        job_id: i64,
        worker_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "UPDATE jobs SET status = ?1, worker_id = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = ?5
                       AND EXISTS (SELECT 1 FROM workers WHERE id = ?2)
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    JobStatus::Running.as_str(),
                    worker_id,
                    format_datetime(&now),
                    job_id,
                    JobStatus::Waiting.as_str(),
                ],
            )
            .await
            .map_err(|e| query_error("claim_if_waiting", e))?;
        fetch_one(rows, "claim_if_waiting", row_to_job).await
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Run a PRAGMA and discard whatever it returns.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    while rows
        .next()
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?
        .is_some()
    {}
    Ok(())
}

/// Map a libSQL failure, keeping lock conflicts apart from other errors.
fn query_error(op: &str, e: libsql::Error) -> DatabaseError {
    match e {
        libsql::Error::SqliteFailure(code, msg)
            if matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED) =>
        {
            DatabaseError::Busy(format!("{op}: {msg}"))
        }
        e => DatabaseError::Query(format!("{op}: {e}")),
    }
}

/// Fixed-width RFC 3339, so text order in SQL equals time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn int_column(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

fn text_column(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{name}: {e}")))
}

/// Read the first row, then step the statement to completion.
///
/// Writes issued through `query` (`... RETURNING`) commit only once the
/// statement finishes, so the remaining rows must be drained.
async fn fetch_one<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Option<T>, DatabaseError> {
    let first = match rows.next().await.map_err(|e| query_error(op, e))? {
        Some(row) => map(&row)?,
        None => return Ok(None),
    };
    while rows.next().await.map_err(|e| query_error(op, e))?.is_some() {}
    Ok(Some(first))
}

async fn fetch_all<T>(
    mut rows: libsql::Rows,
    op: &str,
    map: impl Fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().await.map_err(|e| query_error(op, e))? {
        out.push(map(&row)?);
    }
    Ok(out)
}

// ── Row mapping ─────────────────────────────────────────────────────

const WORKER_COLUMNS: &str = "id, name, created_at, updated_at";

const JOB_COLUMNS: &str =
    "id, name, priority, status, in_data, out_data, worker_id, created_at, updated_at";

const LOG_COLUMNS: &str = "id, job_id, worker_id, text, created_at, updated_at";

fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    let created_at: String = text_column(row, 2, "worker.created_at")?;
    let updated_at: String = text_column(row, 3, "worker.updated_at")?;
    Ok(Worker {
        id: int_column(row, 0, "worker.id")?,
        name: text_column(row, 1, "worker.name")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let priority: i64 = int_column(row, 2, "job.priority")?;
    let status: String = text_column(row, 3, "job.status")?;
    let created_at: String = text_column(row, 7, "job.created_at")?;
    let updated_at: String = text_column(row, 8, "job.updated_at")?;
    Ok(Job {
        id: int_column(row, 0, "job.id")?,
        name: text_column(row, 1, "job.name")?,
        priority: priority as i32,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        // NULL columns fail typed reads; those are the `None` cases.
        in_data: row.get::<String>(4).ok(),
        out_data: row.get::<String>(5).ok(),
        worker_id: row.get::<i64>(6).ok(),
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

fn row_to_log(row: &libsql::Row) -> Result<LogMessage, DatabaseError> {
    let created_at: String = text_column(row, 4, "log.created_at")?;
    let updated_at: String = text_column(row, 5, "log.updated_at")?;
    Ok(LogMessage {
        id: int_column(row, 0, "log.id")?,
        job_id: int_column(row, 1, "log.job_id")?,
        worker_id: int_column(row, 2, "log.worker_id")?,
        text: text_column(row, 3, "log.text")?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    // ── Workers ─────────────────────────────────────────────────────

    async fn insert_worker(
        &self,
        worker: &NewWorker,
        now: DateTime<Utc>,
    ) -> Result<Worker, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "INSERT INTO workers (name, created_at, updated_at) VALUES (?1, ?2, ?2) RETURNING {WORKER_COLUMNS}"
                ),
                params![worker.name.as_str(), format_datetime(&now)],
            )
            .await
            .map_err(|e| query_error("insert_worker", e))?;

        let worker = fetch_one(rows, "insert_worker", row_to_worker)
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_worker: no row returned".into()))?;
        debug!(worker_id = worker.id, "Worker inserted");
        Ok(worker)
    }

    async fn get_worker(&self, id: i64) -> Result<Option<Worker>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_error("get_worker", e))?;
        fetch_one(rows, "get_worker", row_to_worker).await
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY id ASC"),
                (),
            )
            .await
            .map_err(|e| query_error("list_workers", e))?;
        fetch_all(rows, "list_workers", row_to_worker).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &NewJob, now: DateTime<Utc>) -> Result<Job, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "INSERT INTO jobs (name, priority, status, in_data, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5) RETURNING {JOB_COLUMNS}"
                ),
                params![
                    job.name.as_str(),
                    job.priority as i64,
                    JobStatus::Waiting.as_str(),
                    job.in_data.as_deref(),
                    format_datetime(&now),
                ],
            )
            .await
            .map_err(|e| query_error("insert_job", e))?;

        let job = fetch_one(rows, "insert_job", row_to_job)
            .await?
            .ok_or_else(|| DatabaseError::Query("insert_job: no row returned".into()))?;
        debug!(job_id = job.id, priority = job.priority, "Job inserted");
        Ok(job)
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_error("get_job", e))?;
        fetch_one(rows, "get_job", row_to_job).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY id ASC"), ())
            .await
            .map_err(|e| query_error("list_jobs", e))?;
        fetch_all(rows, "list_jobs", row_to_job).await
    }

    async fn next_waiting_job(&self) -> Result<Option<Job>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1
                     ORDER BY priority ASC, created_at ASC, id ASC LIMIT 1"
                ),
                params![JobStatus::Waiting.as_str()],
            )
            .await
            .map_err(|e| query_error("next_waiting_job", e))?;
        fetch_one(rows, "next_waiting_job", row_to_job).await
    }

    async fn claim_if_waiting(
        &self,
        job_id: i64,
        worker_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimAttempt, DatabaseError> {
        match self.try_claim(job_id, worker_id, now).await {
            Ok(Some(job)) => {
                debug!(job_id, worker_id, "Job claimed in DB");
                Ok(ClaimAttempt::Claimed(job))
            }
            Ok(None) if self.get_worker(worker_id).await?.is_none() => {
                Ok(ClaimAttempt::WorkerMissing)
            }
            Ok(None) => Ok(ClaimAttempt::Unavailable),
            // Another connection held the write lock past the busy timeout.
            Err(DatabaseError::Busy(reason)) => {
                debug!(job_id, worker_id, %reason, "Claim write lost to a lock");
                Ok(ClaimAttempt::Unavailable)
            }
            Err(e) => Err(e),
        }
    }

    async fn complete_if_running(
        &self,
        job_id: i64,
        out_data: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompleteAttempt, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "UPDATE jobs SET status = ?1, out_data = ?2, updated_at = ?3
                     WHERE id = ?4 AND status = ?5
                     RETURNING {JOB_COLUMNS}"
                ),
                params![
                    JobStatus::Finished.as_str(),
                    out_data,
                    format_datetime(&now),
                    job_id,
                    JobStatus::Running.as_str(),
                ],
            )
            .await
            .map_err(|e| query_error("complete_if_running", e))?;

        if let Some(job) = fetch_one(rows, "complete_if_running", row_to_job).await? {
            debug!(job_id, "Job completed in DB");
            return Ok(CompleteAttempt::Completed(job));
        }
        match self.get_job(job_id).await? {
            Some(job) => Ok(CompleteAttempt::NotRunning(job.status)),
            None => Ok(CompleteAttempt::JobMissing),
        }
    }

    // ── Log messages ────────────────────────────────────────────────

    async fn insert_log_message(
        &self,
        log: &NewLogMessage,
        now: DateTime<Utc>,
    ) -> Result<LogMessage, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!(
                    "INSERT INTO log_messages (job_id, worker_id, text, created_at, updated_at)
                     SELECT ?1, ?2, ?3, ?4, ?4
                     WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1)
                       AND EXISTS (SELECT 1 FROM workers WHERE id = ?2)
                     RETURNING {LOG_COLUMNS}"
                ),
                params![log.job_id, log.worker_id, log.text.as_str(), format_datetime(&now)],
            )
            .await
            .map_err(|e| query_error("insert_log_message", e))?;

        let message = fetch_one(rows, "insert_log_message", row_to_log)
            .await?
            .ok_or_else(|| {
                DatabaseError::Constraint(format!(
                    "log message references missing job {} or worker {}",
                    log.job_id, log.worker_id
                ))
            })?;
        debug!(log_id = message.id, job_id = log.job_id, "Log message inserted");
        Ok(message)
    }

    async fn list_log_messages(&self) -> Result<Vec<LogMessage>, DatabaseError> {
        let conn = self.connect().await?;
        let rows = conn
            .query(
                &format!("SELECT {LOG_COLUMNS} FROM log_messages ORDER BY created_at ASC, id ASC"),
                (),
            )
            .await
            .map_err(|e| query_error("list_log_messages", e))?;
        fetch_all(rows, "list_log_messages", row_to_log).await
    }
}

// ── Tests ───────────────────────────────────────────────────────────
