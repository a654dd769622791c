//! Durable job tracking backed by SQLite.
//!
//! One row per job, keyed by the opaque job id. The store survives process
//! restarts and is the single source of truth for job state; the worker that
//! owns a job is the only caller mutating it while it runs.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};

pub mod job;

pub use job::{Job, JobStatus};

/// Stored error messages are truncated to protect the database from
/// unbounded tracebacks produced by failing job bodies.
const MAX_ERROR_MESSAGE_LEN: usize = 1000;

/// Transient SQLite failures (locked database, pool timeout) are retried this
/// many times with linear backoff before surfacing to the caller.
const MAX_STORE_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    job_id        TEXT PRIMARY KEY,
    status        TEXT NOT NULL,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL,
    started_at    INTEGER,
    completed_at  INTEGER,
    progress      REAL NOT NULL DEFAULT 0.0,
    error_message TEXT,
    result_path   TEXT,
    metadata      TEXT NOT NULL DEFAULT '{}'
)
"#;

/// Durable record of job identity, state and progress.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the database at `db_path` and apply the schema.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert a new PENDING job. Fails with [`Error::DuplicateJob`] if the id
    /// is already taken.
    pub async fn create(&self, id: &str, metadata: HashMap<String, String>) -> Result<Job> {
        if id.is_empty() {
            return Err(Error::Validation("job id must not be empty".to_string()));
        }
        let metadata_json = serde_json::to_string(&metadata)?;
        let now = Utc::now().timestamp_millis();

        let pool = self.pool.clone();
        let job_id = id.to_string();
        let insert = with_retry("create job", move || {
            let pool = pool.clone();
            let job_id = job_id.clone();
            let metadata_json = metadata_json.clone();
            async move {
                sqlx::query(
                    "INSERT INTO jobs (job_id, status, created_at, updated_at, progress, metadata) \
                     VALUES (?1, ?2, ?3, ?3, 0.0, ?4)",
                )
                .bind(job_id)
                .bind(JobStatus::Pending.to_string())
                .bind(now)
                .bind(metadata_json)
                .execute(&pool)
                .await
            }
        })
        .await;

        match insert {
            Ok(_) => self.get(id).await,
            Err(err) if is_unique_violation(&err) => Err(Error::DuplicateJob(id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Update a job's status and any of the optional fields that are provided.
    ///
    /// `started_at` is set on the first transition into PROCESSING and
    /// `completed_at` on entry to any terminal state. Progress is clamped into
    /// `[0.0, 1.0]` (with a logged correction) and kept non-decreasing while
    /// the job stays PROCESSING. Returns [`Error::JobNotFound`] for an unknown
    /// id; callers treat that as non-fatal since the job may have been
    /// reclaimed between dispatch and update.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: Option<f64>,
        error_message: Option<&str>,
        result_path: Option<&str>,
    ) -> Result<Job> {
        let progress = progress.map(|p| clamp_progress(id, p));
        let error_message = error_message.map(truncate_error);
        let result_path = result_path.map(str::to_string);
        let now = Utc::now().timestamp_millis();

        let pool = self.pool.clone();
        let job_id = id.to_string();
        let status_str = status.to_string();
        let is_terminal = status.is_terminal();
        let updated = with_retry("update job status", move || {
            let pool = pool.clone();
            let job_id = job_id.clone();
            let status_str = status_str.clone();
            let error_message = error_message.clone();
            let result_path = result_path.clone();
            async move {
                sqlx::query(
                    "UPDATE jobs SET \
                         status = ?2, \
                         updated_at = ?3, \
                         started_at = CASE WHEN ?2 = 'processing' \
                             THEN COALESCE(started_at, ?3) ELSE started_at END, \
                         completed_at = CASE WHEN ?7 \
                             THEN COALESCE(completed_at, ?3) ELSE completed_at END, \
                         progress = CASE \
                             WHEN ?4 IS NULL THEN progress \
                             WHEN status = 'processing' AND ?2 = 'processing' \
                                 THEN MAX(progress, ?4) \
                             ELSE ?4 END, \
                         error_message = COALESCE(?5, error_message), \
                         result_path = COALESCE(?6, result_path) \
                     WHERE job_id = ?1",
                )
                .bind(job_id)
                .bind(status_str)
                .bind(now)
                .bind(progress)
                .bind(error_message)
                .bind(result_path)
                .bind(is_terminal)
                .execute(&pool)
                .await
            }
        })
        .await?;

        if updated.rows_affected() == 0 {
            return Err(Error::JobNotFound(id.to_string()));
        }
        self.get(id).await
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: &str) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(Error::JobNotFound(id.to_string())),
        }
    }

    /// List jobs, most recently created first, optionally filtered by status.
    pub async fn list(&self, status: Option<JobStatus>, limit: u32) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE status = ?1 \
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )
                .bind(status.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC, rowid DESC LIMIT ?1")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    /// Delete jobs whose `created_at` is older than `age`. Returns the number
    /// of rows removed. Used by the reclaimer and the operator surface.
    pub async fn delete_older_than(&self, age: Duration) -> Result<u64> {
        let age_ms = i64::try_from(age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(age_ms);

        let pool = self.pool.clone();
        let deleted = with_retry("delete expired jobs", move || {
            let pool = pool.clone();
            async move {
                sqlx::query("DELETE FROM jobs WHERE created_at < ?1")
                    .bind(cutoff)
                    .execute(&pool)
                    .await
            }
        })
        .await?;
        Ok(deleted.rows_affected())
    }
}

/// Retry transient SQLite failures with linear backoff.
async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> sqlx::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_STORE_ATTEMPTS && is_transient(&err) => {
                tracing::warn!(op, attempt, error = %err, "Transient store error, retrying");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("database is locked") || msg.contains("database table is locked")
        }
        _ => false,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn clamp_progress(id: &str, progress: f64) -> f64 {
    if progress.is_nan() {
        tracing::warn!(job_id = id, "Progress is NaN, correcting to 0.0");
        return 0.0;
    }
    if !(0.0..=1.0).contains(&progress) {
        tracing::warn!(job_id = id, progress, "Progress out of range, clamping");
        return progress.clamp(0.0, 1.0);
    }
    progress
}

fn truncate_error(msg: &str) -> String {
    match msg.char_indices().nth(MAX_ERROR_MESSAGE_LEN) {
        Some((cut, _)) => msg[..cut].to_string(),
        None => msg.to_string(),
    }
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let metadata: String = row.try_get("metadata")?;
    Ok(Job {
        id: row.try_get("job_id")?,
        status: status.parse()?,
        progress: row.try_get("progress")?,
        error_message: row.try_get("error_message")?,
        result_path: row.try_get("result_path")?,
        metadata: serde_json::from_str(&metadata)?,
        created_at: millis_to_utc(row.try_get("created_at")?),
        updated_at: millis_to_utc(row.try_get("updated_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(millis_to_utc),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(millis_to_utc),
    })
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
