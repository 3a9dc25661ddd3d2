//! Print job store and render primitive.
//!
//! Jobs live in the `print_jobs` table of the terminal database. Every state
//! change is a guarded `UPDATE ... WHERE status = ...`, so an illegal
//! transition is detected by the row count rather than by a read followed by
//! a write. Job content is denormalized at enqueue time; the order a job
//! refers to may be gone by the time it prints.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::PosError;
use crate::models::{NewPrintJob, PrintDestination, PrintJob, PrintJobStatus};

const RECEIPTS_DIR: &str = "receipts";

const JOB_COLUMNS: &str = "seq, id, order_id, destination, priority, content, attempts, status,
     created_at, started_at, finished_at, last_error";

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PrintQueue {
    db: Arc<DbState>,
}

impl PrintQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    pub fn enqueue(&self, job: &NewPrintJob, now: i64) -> Result<PrintJob, PosError> {
        let id = Uuid::new_v4().to_string();
        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO print_jobs (id, order_id, destination, priority, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6)",
            params![
                id,
                job.order_id,
                job.destination.as_str(),
                job.priority,
                job.content,
                now
            ],
        )?;
        info!(
            job_id = %id,
            order_id = %job.order_id,
            destination = job.destination.as_str(),
            priority = job.priority,
            "Print job enqueued"
        );
        require(load_job(&conn, &id)?, &id)
    }

    /// Every job in insertion order.
    pub fn list(&self) -> Result<Vec<PrintJob>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM print_jobs ORDER BY seq ASC"
        ))?;
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    pub fn get(&self, id: &str) -> Result<Option<PrintJob>, PosError> {
        load_job(&*self.db.lock()?, id)
    }

    /// The queued job this terminal should print next: lowest priority
    /// value first, then oldest.
    pub fn next_candidate(
        &self,
        destinations: &[PrintDestination],
    ) -> Result<Option<PrintJob>, PosError> {
        if destinations.is_empty() {
            return Ok(None);
        }
        let allowed = destinations
            .iter()
            .map(|d| format!("'{}'", d.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.db.lock()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM print_jobs
                     WHERE status = 'queued' AND destination IN ({allowed})
                     ORDER BY priority ASC, seq ASC
                     LIMIT 1"
                ),
                [],
                row_to_job,
            )
            .optional()?)
    }

    pub fn printing_count(&self) -> Result<usize, PosError> {
        let conn = self.db.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM print_jobs WHERE status = 'printing'",
            [],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    /// `queued -> printing`. Refused while any other job is printing.
    pub fn mark_printing(&self, id: &str, now: i64) -> Result<PrintJob, PosError> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE print_jobs
             SET status = 'printing', attempts = attempts + 1, started_at = ?1,
                 finished_at = NULL, last_error = NULL
             WHERE id = ?2 AND status = 'queued'
               AND NOT EXISTS (SELECT 1 FROM print_jobs WHERE status = 'printing')",
            params![now, id],
        )?;
        finish_transition(&conn, id, updated, "start printing")
    }

    /// `printing -> done`.
    pub fn mark_done(&self, id: &str, now: i64) -> Result<PrintJob, PosError> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE print_jobs SET status = 'done', finished_at = ?1
             WHERE id = ?2 AND status = 'printing'",
            params![now, id],
        )?;
        finish_transition(&conn, id, updated, "complete")
    }

    /// `printing -> error`, keeping the job for a manual retry.
    pub fn mark_error(&self, id: &str, error: &str, now: i64) -> Result<PrintJob, PosError> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE print_jobs SET status = 'error', finished_at = ?1, last_error = ?2
             WHERE id = ?3 AND status = 'printing'",
            params![now, error, id],
        )?;
        finish_transition(&conn, id, updated, "fail")
    }

    /// `error -> queued`. The only way out of `error`.
    pub fn retry(&self, id: &str) -> Result<PrintJob, PosError> {
        let conn = self.db.lock()?;
        let updated = conn.execute(
            "UPDATE print_jobs SET status = 'queued', started_at = NULL, finished_at = NULL
             WHERE id = ?1 AND status = 'error'",
            params![id],
        )?;
        let job = finish_transition(&conn, id, updated, "retry")?;
        info!(job_id = %id, attempts = job.attempts, "Print job re-queued");
        Ok(job)
    }

    /// Drop a job that is not currently printing.
    pub fn remove(&self, id: &str) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        let deleted = conn.execute(
            "DELETE FROM print_jobs WHERE id = ?1 AND status != 'printing'",
            params![id],
        )?;
        if deleted == 0 {
            return match load_job(&conn, id)? {
                Some(_) => Err(PosError::IllegalTransition(format!(
                    "print job {id} is printing and cannot be removed"
                ))),
                None => Err(PosError::NotFound(format!("print job {id}"))),
            };
        }
        debug!(job_id = %id, "Print job removed");
        Ok(())
    }

    /// Delete a `done` job. A no-op for any other state.
    pub fn remove_done(&self, id: &str) -> Result<bool, PosError> {
        let deleted = self.db.lock()?.execute(
            "DELETE FROM print_jobs WHERE id = ?1 AND status = 'done'",
            params![id],
        )?;
        Ok(deleted > 0)
    }

    /// Delete `done` jobs that finished before `cutoff`.
    pub fn purge_done_before(&self, cutoff: i64) -> Result<usize, PosError> {
        let purged = self.db.lock()?.execute(
            "DELETE FROM print_jobs WHERE status = 'done' AND finished_at < ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            debug!(purged, "Expired done print jobs purged");
        }
        Ok(purged)
    }

    /// Jobs left `printing` by a crash cannot be trusted to have printed.
    pub fn recover_interrupted(&self, now: i64) -> Result<usize, PosError> {
        let recovered = self.db.lock()?.execute(
            "UPDATE print_jobs SET status = 'error', finished_at = ?1, last_error = 'interrupted'
             WHERE status = 'printing'",
            params![now],
        )?;
        if recovered > 0 {
            warn!(recovered, "Print jobs interrupted by shutdown marked as error");
        }
        Ok(recovered)
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrintJob> {
    let destination: String = row.get(3)?;
    let status: String = row.get(7)?;
    let attempts: i64 = row.get(6)?;
    Ok(PrintJob {
        seq: row.get(0)?,
        id: row.get(1)?,
        order_id: row.get(2)?,
        destination: PrintDestination::parse(&destination).unwrap_or(PrintDestination::Receipt),
        priority: row.get(4)?,
        content: row.get(5)?,
        attempts: attempts.max(0) as u32,
        status: PrintJobStatus::parse(&status).unwrap_or(PrintJobStatus::Error),
        created_at: row.get(8)?,
        started_at: row.get(9)?,
        finished_at: row.get(10)?,
        last_error: row.get(11)?,
    })
}

fn load_job(conn: &Connection, id: &str) -> Result<Option<PrintJob>, PosError> {
    Ok(conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM print_jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )
        .optional()?)
}

fn require(job: Option<PrintJob>, id: &str) -> Result<PrintJob, PosError> {
    job.ok_or_else(|| PosError::NotFound(format!("print job {id}")))
}

fn finish_transition(
    conn: &Connection,
    id: &str,
    updated: usize,
    action: &str,
) -> Result<PrintJob, PosError> {
    let job = require(load_job(conn, id)?, id)?;
    if updated == 0 {
        return Err(PosError::IllegalTransition(format!(
            "cannot {action} print job {id} in state {}",
            job.status.as_str()
        )));
    }
    Ok(job)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Device output for one job. An `Err` moves the job to `error`.
#[async_trait]
pub trait PrintRenderer: Send + Sync {
    async fn render(&self, job: &PrintJob) -> Result<(), PosError>;
}

/// Spools each job as a small HTML file under `{data_dir}/receipts`.
pub struct FileRenderer {
    dir: PathBuf,
}

impl FileRenderer {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(RECEIPTS_DIR),
        }
    }

    pub fn path_for(&self, job: &PrintJob) -> PathBuf {
        self.dir.join(format!(
            "{}_{}_{}.html",
            job.destination.as_str(),
            file_safe(&job.order_id),
            job.id
        ))
    }
}

#[async_trait]
impl PrintRenderer for FileRenderer {
    async fn render(&self, job: &PrintJob) -> Result<(), PosError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(job);
        let html = format!("<pre>{}</pre>\n", escape_html(&job.content));
        tokio::fs::write(&path, html).await?;
        info!(job_id = %job.id, path = %path.display(), "Print artifact written");
        Ok(())
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn file_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Forces the next render to fail, once.
#[derive(Debug, Default)]
pub struct FailureInjector {
    fail_next: AtomicBool,
}

impl FailureInjector {
    pub fn fail_once(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn consume(&self) -> bool {
        self.fail_next.swap(false, Ordering::SeqCst)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
