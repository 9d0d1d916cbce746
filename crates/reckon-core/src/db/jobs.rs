//! Job state machine persistence
//!
//! Transitions are guarded in SQL (`WHERE status IN (...)`) so two workers
//! can't race a job backwards. Counters only move through `x = x + ?`.

use rusqlite::{params, OptionalExtension};
use tracing::{info, warn};

use super::{parse_datetime, parse_enum, Database};
use crate::error::{redact, Error, Result};
use crate::models::{IngestCounts, Job, JobKind, JobStatus, JobUnitError};

const JOB_COLUMNS: &str = "id, kind, status, processed_count, total_count, failed_units,
     tokens_used, cost_usd, cancel_requested, error_message, summary, created_at,
     started_at, completed_at, inserted_count, replaced_count, duplicate_count, rejected_count";

impl Database {
    /// Create a queued job
    pub fn create_job(&self, kind: JobKind, total_count: i64) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (kind, status, total_count) VALUES (?, 'queued', ?)",
            params![kind.as_str(), total_count],
        )?;
        let id = conn.last_insert_rowid();
        info!(job_id = id, kind = %kind, total_count, "Job queued");
        Ok(id)
    }

    /// Get a job by ID
    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let job = conn.query_row(&sql, params![id], Self::row_to_job).optional()?;
        Ok(job)
    }

    /// List recent jobs, newest first
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE ?1 IS NULL OR status = ?1 ORDER BY id DESC LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], Self::row_to_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Move a job to `next`, failing if its current status doesn't allow it
    ///
    /// `error_message` is redacted before it is stored.
    pub fn transition_job(
        &self,
        id: i64,
        next: JobStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let allowed = next.allowed_predecessors();
        if allowed.is_empty() {
            return Err(Error::InvalidTransition {
                from: "any".to_string(),
                to: next.to_string(),
            });
        }
        let allowed_list = allowed
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let timestamp_column = match next {
            JobStatus::Running => "started_at",
            _ => "completed_at",
        };
        let sql = format!(
            "UPDATE jobs SET status = ?1, {} = CURRENT_TIMESTAMP,
                error_message = COALESCE(?2, error_message)
             WHERE id = ?3 AND status IN ({})",
            timestamp_column, allowed_list
        );

        let conn = self.conn()?;
        let updated = conn.execute(
            &sql,
            params![next.as_str(), error_message.map(redact), id],
        )?;

        if updated == 0 {
            let current: Option<String> = conn
                .query_row("SELECT status FROM jobs WHERE id = ?", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            return match current {
                Some(from) => Err(Error::InvalidTransition {
                    from,
                    to: next.to_string(),
                }),
                None => Err(Error::NotFound(format!("Job {}", id))),
            };
        }

        info!(job_id = id, status = %next, "Job status changed");
        Ok(())
    }

    pub fn set_job_total(&self, id: i64, total_count: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET total_count = ? WHERE id = ?",
            params![total_count, id],
        )?;
        Ok(())
    }

    /// Atomically add to the processed and failed counters
    pub fn increment_job_progress(&self, id: i64, processed: i64, failed: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET processed_count = processed_count + ?,
                failed_units = failed_units + ? WHERE id = ?",
            params![processed, failed, id],
        )?;
        Ok(())
    }

    /// Atomically add token and cost usage
    pub fn add_job_usage(&self, id: i64, tokens: i64, cost_usd: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET tokens_used = tokens_used + ?, cost_usd = cost_usd + ? WHERE id = ?",
            params![tokens, cost_usd, id],
        )?;
        Ok(())
    }

    /// Atomically add a unit's ingestion counts
    pub fn add_job_ingest(&self, id: i64, counts: &IngestCounts) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET inserted_count = inserted_count + ?, replaced_count = replaced_count + ?,
                duplicate_count = duplicate_count + ?, rejected_count = rejected_count + ?
             WHERE id = ?",
            params![counts.inserted, counts.replaced, counts.duplicates, counts.rejected, id],
        )?;
        Ok(())
    }

    /// Ask a job to stop; workers notice before their next unit
    ///
    /// A job that has not started yet is cancelled immediately. Returns false
    /// for jobs that already finished.
    pub fn request_job_cancel(&self, id: i64) -> Result<bool> {
        let job = self
            .get_job(id)?
            .ok_or_else(|| Error::NotFound(format!("Job {}", id)))?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET cancel_requested = 1 WHERE id = ?",
            params![id],
        )?;
        drop(conn);

        if job.status == JobStatus::Queued {
            // Lost the race to a worker that just started it: the flag still stands
            match self.transition_job(id, JobStatus::Cancelled, None) {
                Ok(()) | Err(Error::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        info!(job_id = id, "Job cancellation requested");
        Ok(true)
    }

    pub fn is_cancel_requested(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let requested = conn
            .query_row(
                "SELECT cancel_requested FROM jobs WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(false);
        Ok(requested)
    }

    /// Store a per-unit failure (message redacted)
    pub fn record_job_unit_error(
        &self,
        job_id: i64,
        unit: &str,
        error_kind: &str,
        message: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_unit_errors (job_id, unit, error_kind, message) VALUES (?, ?, ?, ?)",
            params![job_id, unit, error_kind, redact(message)],
        )?;
        Ok(())
    }

    pub fn list_job_unit_errors(&self, job_id: i64) -> Result<Vec<JobUnitError>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, unit, error_kind, message, created_at
             FROM job_unit_errors WHERE job_id = ? ORDER BY id",
        )?;
        let errors = stmt
            .query_map(params![job_id], |row| {
                let created_at: String = row.get(5)?;
                Ok(JobUnitError {
                    id: row.get(0)?,
                    job_id: row.get(1)?,
                    unit: row.get(2)?,
                    error_kind: row.get(3)?,
                    message: row.get(4)?,
                    created_at: parse_datetime(&created_at),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(errors)
    }

    /// Attach the JSON summary written when a job finishes
    pub fn set_job_summary(&self, id: i64, summary: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET summary = ? WHERE id = ?",
            params![summary.to_string(), id],
        )?;
        Ok(())
    }

    /// Fail jobs left `running` by a process that exited mid-job
    pub fn recover_interrupted_jobs(&self) -> Result<usize> {
        let conn = self.conn()?;
        let recovered = conn.execute(
            "UPDATE jobs SET status = 'failed', completed_at = CURRENT_TIMESTAMP,
                error_message = 'interrupted before completion'
             WHERE status = 'running'",
            [],
        )?;
        if recovered > 0 {
            warn!(recovered, "Marked interrupted jobs as failed");
        }
        Ok(recovered)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let kind: String = row.get(1)?;
        let status: String = row.get(2)?;
        let created_at: String = row.get(11)?;
        let started_at: Option<String> = row.get(12)?;
        let completed_at: Option<String> = row.get(13)?;

        Ok(Job {
            id: row.get(0)?,
            kind: parse_enum(1, &kind)?,
            status: parse_enum(2, &status)?,
            processed_count: row.get(3)?,
            total_count: row.get(4)?,
            failed_units: row.get(5)?,
            tokens_used: row.get(6)?,
            cost_usd: row.get(7)?,
            ingest: IngestCounts {
                inserted: row.get(14)?,
                replaced: row.get(15)?,
                duplicates: row.get(16)?,
                rejected: row.get(17)?,
            },
            cancel_requested: row.get(8)?,
            error_message: row.get(9)?,
            summary: row.get(10)?,
            created_at: parse_datetime(&created_at),
            started_at: started_at.map(|s| parse_datetime(&s)),
            completed_at: completed_at.map(|s| parse_datetime(&s)),
        })
    }
}
