//! Durable job store backed by a single SQLite file.
//!
//! All mutable state shared between the admission layer, the worker, and the
//! control plane lives here. Transactions are short; no transaction ever
//! spans a stabilization wait or a subprocess run. Status transitions are
//! enforced in SQL (`WHERE status = ...`) so concurrent writers cannot race a
//! job into an invalid state.

use crate::classify::Classification;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("job {0} not found")]
    NotFound(i64),

    #[error("job {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: i64,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("job {0} has exhausted its retries")]
    RetryExhausted(i64),

    #[error("job {0} is running and cannot be deleted")]
    DeleteWhileRunning(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transcode job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Stable machine-readable failure kinds stored on the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Missing,
    Unstable,
    Nospace,
    Encode,
    Publish,
    Shutdown,
    Interrupted,
    RetryExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Missing => "missing",
            ErrorKind::Unstable => "unstable",
            ErrorKind::Nospace => "nospace",
            ErrorKind::Encode => "encode",
            ErrorKind::Publish => "publish",
            ErrorKind::Shutdown => "shutdown",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::RetryExhausted => "retry_exhausted",
        }
    }

    /// Whether the control plane may requeue a job failed with this kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::RetryExhausted)
    }
}

/// A transcode job row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub title: String,
    /// Directory basename under the raw root, as admitted.
    pub source_hint: String,
    /// Absolute path under the raw root, set once resolved.
    pub source_resolved: Option<PathBuf>,
    pub status: JobStatus,
    pub progress: f64,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub output_path: Option<PathBuf>,
    pub classification: Option<Classification>,
    /// Encoder family the job actually ran with, resolved at job start.
    pub encoder_family: Option<String>,
    /// Upstream rip job id, when the notifier supplied one.
    pub arm_job_id: Option<String>,
    /// Number of video tracks discovered in the source.
    pub total_tracks: u32,
    /// Basename of the main feature file.
    pub main_feature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied by admission when creating a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub title: String,
    pub source_hint: String,
    pub arm_job_id: Option<String>,
}

/// Aggregate counters for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_processed: u64,
    /// Mean wall-clock seconds from start to completion, completed jobs only.
    pub avg_duration_secs: Option<f64>,
}

/// Minimum progress delta committed to the database.
const PROGRESS_STEP: f64 = 5.0;
/// Progress commits are forced through after this many seconds regardless of delta.
const PROGRESS_MAX_INTERVAL_SECS: i64 = 10;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    title           TEXT NOT NULL,
    source_hint     TEXT NOT NULL,
    source_resolved TEXT,
    status          TEXT NOT NULL DEFAULT 'pending',
    progress        REAL NOT NULL DEFAULT 0.0,
    progress_at     TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    error_kind      TEXT,
    output_path     TEXT,
    classification  TEXT,
    encoder_family  TEXT,
    arm_job_id      TEXT,
    total_tracks    INTEGER NOT NULL DEFAULT 0,
    main_feature    TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at, id);
";

/// The durable job store.
///
/// A single connection behind a mutex: every operation is a short critical
/// section, which in practice serializes admission, worker, and control-plane
/// writes exactly as the data model requires.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (and if necessary creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        f(&conn)
    }

    /// Inserts a new PENDING job and returns it.
    pub fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO jobs (title, source_hint, arm_job_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![new.title, new.source_hint, new.arm_job_id, now, now],
            )?;
            let id = conn.last_insert_rowid();
            get_job(conn, id)
        })
    }

    /// Fetches a job by id.
    pub fn get(&self, id: i64) -> Result<Job, StoreError> {
        self.with_conn(|conn| get_job(conn, id))
    }

    /// Atomically claims the oldest PENDING job, marking it RUNNING.
    ///
    /// Jobs are claimed in `(created_at, id)` order. The claim starts a fresh
    /// episode: progress and any stale error reset.
    pub fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM jobs WHERE status = 'pending'
                     ORDER BY created_at, id LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = id else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE jobs SET status = 'running', started_at = ?1, updated_at = ?1,
                        progress = 0.0, progress_at = NULL, error = NULL, error_kind = NULL
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )?;

            get_job(conn, id).map(Some)
        })
    }

    /// Records transcode progress, rate-limited.
    ///
    /// A commit happens only when the new value is a full step ahead of the
    /// last committed one, reaches 100, or the last commit is old enough.
    /// Regressions and everything else no-op silently.
    pub fn update_progress(&self, id: i64, progress: f64) -> Result<(), StoreError> {
        let progress = progress.clamp(0.0, 100.0);
        self.with_conn(|conn| {
            let row: Option<(f64, Option<DateTime<Utc>>)> = conn
                .query_row(
                    "SELECT progress, progress_at FROM jobs WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((committed, committed_at)) = row else {
                return Err(StoreError::NotFound(id));
            };

            if progress < committed {
                return Ok(());
            }

            let now = Utc::now();
            let stale = committed_at
                .map(|at| (now - at).num_seconds() >= PROGRESS_MAX_INTERVAL_SECS)
                .unwrap_or(true);
            let accept = progress >= committed + PROGRESS_STEP || progress >= 100.0 || stale;
            if !accept {
                return Ok(());
            }

            conn.execute(
                "UPDATE jobs SET progress = ?1, progress_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![progress, now, id],
            )?;
            Ok(())
        })
    }

    /// Records the resolved source path.
    pub fn set_source_resolved(&self, id: i64, path: &Path) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE jobs SET source_resolved = ?1, updated_at = ?2 WHERE id = ?3",
                params![path.to_string_lossy(), now, id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
    }

    /// Records the planning outcome on the job.
    pub fn set_plan(
        &self,
        id: i64,
        classification: Classification,
        encoder_family: Option<&str>,
        total_tracks: u32,
        main_feature: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE jobs SET classification = ?1, encoder_family = ?2,
                        total_tracks = ?3, main_feature = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    classification.to_string(),
                    encoder_family,
                    total_tracks,
                    main_feature,
                    now,
                    id
                ],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
    }

    /// Transitions a RUNNING job to a terminal status.
    pub fn finish(
        &self,
        id: i64,
        status: JobStatus,
        error_kind: Option<ErrorKind>,
        error: Option<&str>,
        output_path: Option<&Path>,
    ) -> Result<Job, StoreError> {
        debug_assert!(status.is_terminal());
        self.with_conn(|conn| {
            let now = Utc::now();
            let progress: Option<f64> = (status == JobStatus::Completed).then_some(100.0);
            let n = conn.execute(
                "UPDATE jobs SET status = ?1, error_kind = ?2, error = ?3, output_path = ?4,
                        progress = COALESCE(?5, progress), completed_at = ?6, updated_at = ?6
                 WHERE id = ?7 AND status = 'running'",
                params![
                    status.to_string(),
                    error_kind.map(|k| k.as_str()),
                    error,
                    output_path.map(|p| p.to_string_lossy().to_string()),
                    progress,
                    now,
                    id
                ],
            )?;
            if n == 0 {
                let job = get_job(conn, id)?;
                return Err(StoreError::InvalidTransition {
                    id,
                    status: job.status,
                    expected: JobStatus::Running,
                });
            }
            get_job(conn, id)
        })
    }

    /// Returns a RUNNING job to PENDING without consuming a retry.
    ///
    /// Used at shutdown (`shutdown`) and on startup orphan recovery
    /// (`interrupted`): the episode never completed, so the retry counter is
    /// untouched and progress resets.
    pub fn park_pending(&self, id: i64, kind: ErrorKind) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE jobs SET status = 'pending', error = ?1, error_kind = ?1,
                        progress = 0.0, progress_at = NULL, started_at = NULL, updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![kind.as_str(), now, id],
            )?;
            if n == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
    }

    /// Requeues a FAILED job, consuming one retry.
    pub fn requeue(&self, id: i64, max_retry_count: u32) -> Result<Job, StoreError> {
        self.with_conn(|conn| {
            let job = get_job(conn, id)?;
            if job.status != JobStatus::Failed {
                return Err(StoreError::InvalidTransition {
                    id,
                    status: job.status,
                    expected: JobStatus::Failed,
                });
            }
            if job.retry_count >= max_retry_count {
                return Err(StoreError::RetryExhausted(id));
            }

            let now = Utc::now();
            conn.execute(
                "UPDATE jobs SET status = 'pending', retry_count = retry_count + 1,
                        error = NULL, error_kind = NULL, progress = 0.0, progress_at = NULL,
                        output_path = NULL, started_at = NULL, completed_at = NULL,
                        updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![now, id],
            )?;
            get_job(conn, id)
        })
    }

    /// Deletes a job. Refused while the job is RUNNING.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let job = get_job(conn, id)?;
            if job.status == JobStatus::Running {
                return Err(StoreError::DeleteWhileRunning(id));
            }
            conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
            Ok(())
        })
    }

    /// Lists jobs, newest first, optionally filtered by status.
    ///
    /// `limit` is capped at 500. Returns the page plus the total matching
    /// count for pagination.
    pub fn list(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<(Vec<Job>, u64), StoreError> {
        let limit = limit.min(500);
        self.with_conn(|conn| {
            let status_str = status.map(|s| s.to_string());

            let total: u64 = match &status_str {
                Some(s) => conn.query_row(
                    "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                    params![s],
                    |row| row.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?,
            };

            let mut jobs = Vec::new();
            match &status_str {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM jobs WHERE status = ?1
                         ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                    )?;
                    let rows = stmt.query_map(params![s, limit, offset], job_from_row)?;
                    for row in rows {
                        jobs.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT * FROM jobs ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
                    )?;
                    let rows = stmt.query_map(params![limit, offset], job_from_row)?;
                    for row in rows {
                        jobs.push(row?);
                    }
                }
            }
            Ok((jobs, total))
        })
    }

    /// Aggregate counters for the stats endpoint.
    pub fn stats(&self) -> Result<Stats, StoreError> {
        self.with_conn(|conn| {
            let mut stats = Stats::default();
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status.as_str() {
                    "pending" => stats.pending = count,
                    "running" => stats.running = count,
                    "completed" => stats.completed = count,
                    "failed" => stats.failed = count,
                    "cancelled" => stats.cancelled = count,
                    _ => {}
                }
            }
            stats.total_processed = stats.completed + stats.failed + stats.cancelled;

            stats.avg_duration_secs = conn.query_row(
                "SELECT AVG((julianday(completed_at) - julianday(started_at)) * 86400.0)
                 FROM jobs
                 WHERE status = 'completed' AND started_at IS NOT NULL
                   AND completed_at IS NOT NULL",
                [],
                |row| row.get(0),
            )?;

            Ok(stats)
        })
    }

    /// Number of PENDING jobs, for the health endpoint.
    pub fn queue_size(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Startup recovery: any job still RUNNING belonged to a dead process.
    ///
    /// Its subprocess died with that process, so the job goes back to PENDING
    /// with `error = "interrupted"`, progress reset, retry count untouched.
    pub fn recover_orphans(&self) -> Result<u64, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now();
            let n = conn.execute(
                "UPDATE jobs SET status = 'pending', error = 'interrupted',
                        error_kind = 'interrupted', progress = 0.0, progress_at = NULL,
                        started_at = NULL, updated_at = ?1
                 WHERE status = 'running'",
                params![now],
            )?;
            Ok(n as u64)
        })
    }
}

fn job_from_row(row: &Row<'_>) -> Result<Job, rusqlite::Error> {
    let status_str: String = row.get("status")?;
    let classification: Option<String> = row.get("classification")?;
    Ok(Job {
        id: row.get("id")?,
        title: row.get("title")?,
        source_hint: row.get("source_hint")?,
        source_resolved: row
            .get::<_, Option<String>>("source_resolved")?
            .map(PathBuf::from),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
        progress: row.get("progress")?,
        retry_count: row.get("retry_count")?,
        error: row.get("error")?,
        error_kind: row.get("error_kind")?,
        output_path: row
            .get::<_, Option<String>>("output_path")?
            .map(PathBuf::from),
        classification: classification.as_deref().and_then(Classification::parse),
        encoder_family: row.get("encoder_family")?,
        arm_job_id: row.get("arm_job_id")?,
        total_tracks: row.get("total_tracks")?,
        main_feature: row.get("main_feature")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn get_job(conn: &Connection, id: i64) -> Result<Job, StoreError> {
    conn.query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
        .optional()?
        .ok_or(StoreError::NotFound(id))
}
