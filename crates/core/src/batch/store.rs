use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use super::error::{QueueError, ValidationErrors};
use super::model::{
    progress_percent, BatchJob, BatchJobItem, ItemOutcome, ItemStatus, JobConfig, JobFilter,
    JobStatus, JobType, NewBatchJob,
};
use super::schedule::QueuedJob;

pub const DB_FILE_NAME: &str = "graphcap.db";

const JOB_COLUMNS: &str = "job_id, job_type, status, priority, config_json, total_images, \
     processed_images, failed_images, progress, error, created_at, started_at, completed_at, archived";

const ITEM_COLUMNS: &str =
    "id, job_id, image_path, perspective, status, error, started_at, completed_at, processing_time";

/// Processed/failed counters after an item transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemCounts {
    pub processed: u32,
    pub failed: u32,
    pub total: u32,
}

/// SQLite-backed queue state. Every call opens its own connection so the
/// store can be cloned freely into blocking tasks.
#[derive(Debug, Clone)]
pub struct BatchStore {
    db_path: PathBuf,
}

impl BatchStore {
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!(
                "failed to create data directory for queue db: {}",
                data_dir.display()
            )
        })?;

        let store = Self {
            db_path: data_dir.join(DB_FILE_NAME),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn ping(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .context("queue db did not answer")?;
            Ok(())
        })
    }

    /// Inserts the job, one item per `(image, perspective)` and the
    /// dependency edges in a single transaction.
    pub fn create_job(&self, job: &NewBatchJob) -> Result<BatchJob, QueueError> {
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin create transaction")?;

            let mut errors = ValidationErrors::new();
            for (idx, dependency) in job.dependencies.iter().enumerate() {
                let exists: bool = tx
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM batch_jobs WHERE job_id = ?1)",
                        params![dependency.to_string()],
                        |row| row.get(0),
                    )
                    .context("failed to look up dependency")?;
                if !exists {
                    errors.add(format!("dependencies.{idx}"), "Unknown job");
                }
            }
            if !errors.is_empty() {
                return Err(errors.into());
            }

            let job_id = Uuid::new_v4();
            let created_at = Utc::now();
            let config_json =
                serde_json::to_string(&job.config).context("failed to encode job config")?;

            tx.execute(
                "INSERT INTO batch_jobs (
                    job_id, job_type, status, priority, config_json, total_images,
                    processed_images, failed_images, progress, created_at, archived
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, 0, ?7, 0)",
                params![
                    job_id.to_string(),
                    job.job_type.as_str(),
                    JobStatus::Pending.as_str(),
                    job.priority,
                    config_json,
                    job.total_items(),
                    format_timestamp(created_at),
                ],
            )
            .with_context(|| format!("failed to insert batch job {job_id}"))?;

            {
                let mut insert_item = tx
                    .prepare(
                        "INSERT INTO batch_job_items (job_id, image_path, perspective, status)
                         VALUES (?1, ?2, ?3, ?4)",
                    )
                    .context("failed to prepare item insert")?;
                for (image, perspective) in job.item_pairs() {
                    insert_item
                        .execute(params![
                            job_id.to_string(),
                            image,
                            perspective,
                            ItemStatus::Pending.as_str()
                        ])
                        .with_context(|| format!("failed to insert item {image}/{perspective}"))?;
                }

                let mut insert_dependency = tx
                    .prepare(
                        "INSERT OR IGNORE INTO batch_job_dependencies (job_id, depends_on_job_id)
                         VALUES (?1, ?2)",
                    )
                    .context("failed to prepare dependency insert")?;
                for dependency in &job.dependencies {
                    insert_dependency
                        .execute(params![job_id.to_string(), dependency.to_string()])
                        .context("failed to insert dependency")?;
                }
            }

            tx.commit().context("failed to commit batch job")?;
            debug!(%job_id, total_items = job.total_items(), "Inserted batch job");

            Ok(BatchJob {
                job_id,
                job_type: job.job_type,
                status: JobStatus::Pending,
                priority: job.priority,
                total_images: job.total_items(),
                processed_images: 0,
                failed_images: 0,
                progress: 0,
                config: job.config.clone(),
                error: None,
                dependencies: job.dependencies.clone(),
                created_at: parse_timestamp(&format_timestamp(created_at))?,
                started_at: None,
                completed_at: None,
                archived: false,
            })
        })
    }

    /// Page of jobs ordered by `priority ASC, created_at ASC`, plus the total
    /// number of rows matching the same filter.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<(Vec<BatchJob>, u64)> {
        self.with_connection(|conn| {
            let status = filter.status.map(JobStatus::as_str);
            let total: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM batch_jobs
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 OR archived = 0)",
                    params![status, filter.include_archived],
                    |row| row.get(0),
                )
                .context("failed to count batch jobs")?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM batch_jobs
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 OR archived = 0)
                 ORDER BY priority ASC, created_at ASC, rowid ASC
                 LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt.query_map(
                params![status, filter.include_archived, filter.limit, filter.offset],
                job_from_row,
            )?;

            let mut jobs = Vec::new();
            for row in rows {
                let mut job = row.context("failed to decode batch job row")?;
                job.dependencies = load_dependencies(conn, job.job_id)?;
                jobs.push(job);
            }

            Ok((jobs, total.max(0) as u64))
        })
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<BatchJob>> {
        self.with_connection(|conn| fetch_job(conn, job_id))
    }

    pub fn list_items(&self, job_id: Uuid) -> Result<Vec<BatchJobItem>> {
        self.with_connection(|conn| query_items(conn, job_id, None))
    }

    pub fn pending_items(&self, job_id: Uuid) -> Result<Vec<BatchJobItem>> {
        self.with_connection(|conn| query_items(conn, job_id, Some(ItemStatus::Pending)))
    }

    pub fn job_status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        self.with_connection(|conn| fetch_status(conn, job_id))
    }

    /// Current status of each id that still exists.
    pub fn statuses_of(&self, job_ids: &[Uuid]) -> Result<HashMap<Uuid, JobStatus>> {
        self.with_connection(|conn| {
            let mut statuses = HashMap::with_capacity(job_ids.len());
            for job_id in job_ids {
                if let Some(status) = fetch_status(conn, *job_id)? {
                    statuses.insert(*job_id, status);
                }
            }
            Ok(statuses)
        })
    }

    /// Pending and running jobs that are not archived, in priority order.
    pub fn queued_jobs(&self) -> Result<Vec<QueuedJob>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT job_id, status, priority, created_at, started_at FROM batch_jobs
                 WHERE status IN ('pending', 'running') AND archived = 0
                 ORDER BY priority ASC, created_at ASC, rowid ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(QueuedJob {
                    job_id: uuid_column(row, 0)?,
                    status: job_status_column(row, 1)?,
                    priority: row.get(2)?,
                    created_at: timestamp_column(row, 3)?,
                    started_at: optional_timestamp_column(row, 4)?,
                    dependencies: Vec::new(),
                })
            })?;

            let mut jobs = Vec::new();
            for row in rows {
                let mut job = row.context("failed to decode queued job row")?;
                job.dependencies = load_dependencies(conn, job.job_id)?;
                jobs.push(job);
            }
            Ok(jobs)
        })
    }

    pub fn cancel_job(&self, job_id: Uuid) -> Result<BatchJob, QueueError> {
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin cancel transaction")?;
            let status = fetch_status(&tx, job_id)?.ok_or(QueueError::NotFound(job_id))?;
            if status.is_terminal() {
                return Err(QueueError::NotCancellable { status });
            }

            let now = format_timestamp(Utc::now());
            tx.execute(
                "UPDATE batch_jobs SET status = 'cancelled', completed_at = ?2 WHERE job_id = ?1",
                params![job_id.to_string(), now],
            )
            .context("failed to cancel batch job")?;
            let cancelled_items = cancel_open_items(&tx, job_id, &now)?;
            tx.commit().context("failed to commit cancellation")?;

            debug!(%job_id, cancelled_items, "Cancelled batch job");
            fetch_job(conn, job_id)?.ok_or(QueueError::NotFound(job_id))
        })
    }

    pub fn archive_job(&self, job_id: Uuid) -> Result<BatchJob, QueueError> {
        self.with_connection(|conn| {
            let status = fetch_status(conn, job_id)?.ok_or(QueueError::NotFound(job_id))?;
            if !status.is_terminal() {
                return Err(QueueError::NotArchivable { status });
            }
            conn.execute(
                "UPDATE batch_jobs SET archived = 1 WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .context("failed to archive batch job")?;
            fetch_job(conn, job_id)?.ok_or(QueueError::NotFound(job_id))
        })
    }

    /// Rewrites priorities to `index * 10` following `job_ids`. Unknown ids are skipped.
    pub fn reorder(&self, job_ids: &[Uuid]) -> Result<usize> {
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin reorder transaction")?;
            let mut updated = 0;
            for (idx, job_id) in job_ids.iter().enumerate() {
                updated += tx
                    .execute(
                        "UPDATE batch_jobs SET priority = ?2 WHERE job_id = ?1",
                        params![job_id.to_string(), (idx as i64) * 10],
                    )
                    .with_context(|| format!("failed to reprioritize {job_id}"))?;
            }
            tx.commit().context("failed to commit reorder")?;
            Ok(updated)
        })
    }

    /// Moves a pending job to running. Returns false when someone else got there first.
    pub fn claim_job(&self, job_id: Uuid) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE batch_jobs SET status = 'running', started_at = ?2, error = NULL
                     WHERE job_id = ?1 AND status = 'pending' AND archived = 0",
                    params![job_id.to_string(), format_timestamp(Utc::now())],
                )
                .context("failed to claim batch job")?;
            Ok(changed == 1)
        })
    }

    /// Fails a job that has not finished yet and cancels its open items.
    pub fn fail_job(&self, job_id: Uuid, reason: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin fail transaction")?;
            let now = format_timestamp(Utc::now());
            let changed = tx
                .execute(
                    "UPDATE batch_jobs SET status = 'failed', error = ?2, completed_at = ?3
                     WHERE job_id = ?1 AND status IN ('pending', 'running')",
                    params![job_id.to_string(), reason, now],
                )
                .context("failed to mark batch job failed")?;
            if changed == 1 {
                cancel_open_items(&tx, job_id, &now)?;
            }
            tx.commit().context("failed to commit job failure")?;
            Ok(changed == 1)
        })
    }

    /// Final transition of a running job; a job cancelled meanwhile is left alone.
    pub fn complete_job(&self, job_id: Uuid, status: JobStatus) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE batch_jobs SET status = ?2, completed_at = ?3
                     WHERE job_id = ?1 AND status = 'running'",
                    params![
                        job_id.to_string(),
                        status.as_str(),
                        format_timestamp(Utc::now())
                    ],
                )
                .context("failed to complete batch job")?;
            Ok(changed == 1)
        })
    }

    /// Marks a pending item running. False when it was cancelled meanwhile.
    pub fn start_item(&self, item_id: i64) -> Result<bool> {
        self.with_connection(|conn| {
            let changed = conn
                .execute(
                    "UPDATE batch_job_items SET status = 'running', started_at = ?2, error = NULL
                     WHERE id = ?1 AND status = 'pending'",
                    params![item_id, format_timestamp(Utc::now())],
                )
                .with_context(|| format!("failed to start item {item_id}"))?;
            Ok(changed == 1)
        })
    }

    /// Records the outcome of a running item and refreshes the job aggregates
    /// in one transaction. An item that is no longer running (cancelled while
    /// the backend call was in flight) is left untouched.
    pub fn finish_item(
        &self,
        job_id: Uuid,
        item_id: i64,
        outcome: &ItemOutcome,
    ) -> Result<ItemCounts> {
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin item transaction")?;

            let (error, processing_time) = match outcome {
                ItemOutcome::Completed { processing_time_ms } => (None, Some(*processing_time_ms)),
                ItemOutcome::Failed {
                    error,
                    processing_time_ms,
                } => (Some(error.as_str()), Some(*processing_time_ms)),
                ItemOutcome::Cancelled => (None, None),
            };
            let changed = tx
                .execute(
                    "UPDATE batch_job_items
                     SET status = ?2, error = ?3, completed_at = ?4, processing_time = ?5
                     WHERE id = ?1 AND status = 'running'",
                    params![
                        item_id,
                        outcome.status().as_str(),
                        error,
                        format_timestamp(Utc::now()),
                        processing_time
                    ],
                )
                .with_context(|| format!("failed to finish item {item_id}"))?;
            if changed == 0 {
                debug!(%job_id, item_id, "Item no longer running; outcome dropped");
                return stored_counts(&tx, job_id);
            }

            let (processed, failed): (i64, i64) = tx
                .query_row(
                    "SELECT
                        COALESCE(SUM(status = 'completed'), 0),
                        COALESCE(SUM(status = 'failed'), 0)
                     FROM batch_job_items WHERE job_id = ?1",
                    params![job_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .context("failed to count item outcomes")?;
            let total: i64 = tx
                .query_row(
                    "SELECT total_images FROM batch_jobs WHERE job_id = ?1",
                    params![job_id.to_string()],
                    |row| row.get(0),
                )
                .with_context(|| format!("batch job {job_id} disappeared"))?;

            let counts = ItemCounts {
                processed: processed as u32,
                failed: failed as u32,
                total: total as u32,
            };
            tx.execute(
                "UPDATE batch_jobs SET processed_images = ?2, failed_images = ?3, progress = ?4
                 WHERE job_id = ?1",
                params![
                    job_id.to_string(),
                    counts.processed,
                    counts.failed,
                    progress_percent(counts.processed, counts.failed, counts.total)
                ],
            )
            .context("failed to update job aggregates")?;

            tx.commit().context("failed to commit item outcome")?;
            Ok(counts)
        })
    }

    /// Jobs interrupted by a shutdown go back to pending; their in-flight
    /// items are retried, finished items are kept.
    pub fn requeue_interrupted(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let tx = write_transaction(conn).context("failed to begin startup reconciliation")?;
            tx.execute(
                "UPDATE batch_job_items SET status = 'pending', started_at = NULL
                 WHERE status = 'running'
                   AND job_id IN (SELECT job_id FROM batch_jobs WHERE status = 'running')",
                [],
            )
            .context("failed to reset interrupted items")?;
            let jobs = tx
                .execute(
                    "UPDATE batch_jobs SET status = 'pending', started_at = NULL
                     WHERE status = 'running'",
                    [],
                )
                .context("failed to requeue interrupted jobs")?;
            tx.commit().context("failed to commit startup reconciliation")?;

            if jobs > 0 {
                info!(requeued = jobs, "Requeued batch jobs interrupted by shutdown");
            }
            Ok(jobs)
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS batch_jobs (
                    job_id TEXT PRIMARY KEY,
                    job_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 100,
                    config_json TEXT NOT NULL,
                    total_images INTEGER NOT NULL,
                    processed_images INTEGER NOT NULL DEFAULT 0,
                    failed_images INTEGER NOT NULL DEFAULT 0,
                    progress INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT,
                    archived INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE TABLE IF NOT EXISTS batch_job_items (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES batch_jobs(job_id) ON DELETE CASCADE,
                    image_path TEXT NOT NULL,
                    perspective TEXT NOT NULL,
                    status TEXT NOT NULL,
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    processing_time INTEGER
                 );
                 CREATE TABLE IF NOT EXISTS batch_job_dependencies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL REFERENCES batch_jobs(job_id) ON DELETE CASCADE,
                    depends_on_job_id TEXT NOT NULL,
                    UNIQUE (job_id, depends_on_job_id)
                 );
                 CREATE INDEX IF NOT EXISTS idx_batch_jobs_queue
                    ON batch_jobs(status, archived, priority, created_at);
                 CREATE INDEX IF NOT EXISTS idx_batch_job_items_job ON batch_job_items(job_id, status);
                 CREATE INDEX IF NOT EXISTS idx_batch_job_deps_job ON batch_job_dependencies(job_id);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize queue schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T, E>(&self, op: impl FnOnce(&Connection) -> Result<T, E>) -> Result<T, E>
    where
        E: From<anyhow::Error>,
    {
        let conn = open_connection(&self.db_path)?;
        op(&conn)
    }
}

pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open db: {}", db_path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))
        .context("failed to set db busy timeout")?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("failed to enable foreign keys")?;
    Ok(conn)
}

/// `BEGIN IMMEDIATE`. Holds the write lock before the first read; a busy
/// database is waited on through `busy_timeout`.
pub(crate) fn write_transaction(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

fn fetch_job(conn: &Connection, job_id: Uuid) -> Result<Option<BatchJob>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM batch_jobs WHERE job_id = ?1"),
            params![job_id.to_string()],
            job_from_row,
        )
        .optional()
        .with_context(|| format!("failed to load batch job {job_id}"))?;

    match job {
        Some(mut job) => {
            job.dependencies = load_dependencies(conn, job_id)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

fn fetch_status(conn: &Connection, job_id: Uuid) -> Result<Option<JobStatus>> {
    conn.query_row(
        "SELECT status FROM batch_jobs WHERE job_id = ?1",
        params![job_id.to_string()],
        |row| job_status_column(row, 0),
    )
    .optional()
    .with_context(|| format!("failed to load status of batch job {job_id}"))
}

fn query_items(
    conn: &Connection,
    job_id: Uuid,
    status: Option<ItemStatus>,
) -> Result<Vec<BatchJobItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM batch_job_items
         WHERE job_id = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map(
        params![job_id.to_string(), status.map(ItemStatus::as_str)],
        item_from_row,
    )?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to load items of batch job {job_id}"))
}

fn load_dependencies(conn: &Connection, job_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_job_id FROM batch_job_dependencies WHERE job_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![job_id.to_string()], |row| uuid_column(row, 0))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .with_context(|| format!("failed to load dependencies of batch job {job_id}"))
}

fn stored_counts(conn: &Connection, job_id: Uuid) -> Result<ItemCounts> {
    conn.query_row(
        "SELECT processed_images, failed_images, total_images FROM batch_jobs WHERE job_id = ?1",
        params![job_id.to_string()],
        |row| {
            Ok(ItemCounts {
                processed: row.get(0)?,
                failed: row.get(1)?,
                total: row.get(2)?,
            })
        },
    )
    .with_context(|| format!("failed to load counters of batch job {job_id}"))
}

fn cancel_open_items(conn: &Connection, job_id: Uuid, now: &str) -> Result<usize> {
    conn.execute(
        "UPDATE batch_job_items SET status = 'cancelled', completed_at = ?2
         WHERE job_id = ?1 AND status IN ('pending', 'running')",
        params![job_id.to_string(), now],
    )
    .context("failed to cancel open items")
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<BatchJob> {
    let job_type_raw: String = row.get(1)?;
    let job_type = JobType::parse(&job_type_raw)
        .ok_or_else(|| invalid_column(1, format!("unknown job type: {job_type_raw}")))?;
    let config_raw: String = row.get(4)?;
    let config: JobConfig = serde_json::from_str(&config_raw)
        .map_err(|err| invalid_column(4, format!("invalid job config: {err}")))?;
    let progress: i64 = row.get(8)?;

    Ok(BatchJob {
        job_id: uuid_column(row, 0)?,
        job_type,
        status: job_status_column(row, 2)?,
        priority: row.get(3)?,
        total_images: row.get(5)?,
        processed_images: row.get(6)?,
        failed_images: row.get(7)?,
        progress: progress.clamp(0, 100) as u8,
        config,
        error: row.get(9)?,
        dependencies: Vec::new(),
        created_at: timestamp_column(row, 10)?,
        started_at: optional_timestamp_column(row, 11)?,
        completed_at: optional_timestamp_column(row, 12)?,
        archived: row.get(13)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<BatchJobItem> {
    let status_raw: String = row.get(4)?;
    Ok(BatchJobItem {
        id: row.get(0)?,
        job_id: uuid_column(row, 1)?,
        image_path: row.get(2)?,
        perspective: row.get(3)?,
        status: ItemStatus::parse(&status_raw)
            .ok_or_else(|| invalid_column(4, format!("unknown item status: {status_raw}")))?,
        error: row.get(5)?,
        started_at: optional_timestamp_column(row, 6)?,
        completed_at: optional_timestamp_column(row, 7)?,
        processing_time: row.get(8)?,
    })
}

fn job_status_column(row: &Row<'_>, index: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(index)?;
    JobStatus::parse(&raw).ok_or_else(|| invalid_column(index, format!("unknown job status: {raw}")))
}

fn uuid_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).map_err(|err| invalid_column(index, format!("invalid uuid {raw}: {err}")))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| invalid_column(index, err.to_string()))
}

fn optional_timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.as_deref()
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| invalid_column(index, err.to_string()))
}

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
        .map(|ts| ts.with_timezone(&Utc))
}
