//! Job coordinator
//!
//! Runs the units of a persisted job on a bounded worker pool. Each unit is
//! wrapped in a timeout, its outcome is written back with atomic counter
//! increments, and the cancel flag is checked before a unit starts. A unit
//! that overruns its timeout has its [`JobUnit::on_timeout`] action run
//! before the failure is settled. A unit failure is recorded against the
//! job and never fails it; `failed` is left for faults of the coordinator
//! itself (see [`JobCoordinator::fail`]).

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::JobsConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{IngestCounts, JobStatus};

/// One independently retryable piece of a job
pub trait JobUnit: Send + 'static {
    /// Label stored with unit errors (must not carry PII)
    fn label(&self) -> String;

    /// How many progress steps this unit accounts for
    fn weight(&self) -> i64 {
        1
    }

    /// Bookkeeping to run if the unit overruns the unit timeout
    ///
    /// Taken before the unit starts, since a timed-out unit is dropped with
    /// its future.
    fn on_timeout(&self) -> Option<TimeoutAction> {
        None
    }
}

/// Runs against the job's database after a unit timed out
pub type TimeoutAction = Box<dyn FnOnce(&Database, i64, &Error) -> Result<()> + Send>;

/// What a finished unit reports back
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitReport {
    pub processed: i64,
    /// Items inside the unit that failed without failing the unit
    pub failed: i64,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub ingest: IngestCounts,
}

impl UnitReport {
    pub fn processed(count: i64) -> Self {
        Self {
            processed: count,
            ..Default::default()
        }
    }
}

/// Final state of a `run_units` call
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: i64,
    pub status: JobStatus,
    pub units_run: usize,
    pub units_failed: usize,
    /// Never started because the job was cancelled
    pub units_skipped: usize,
}

/// A job running in the background
pub struct JobHandle {
    pub job_id: i64,
    handle: JoinHandle<Result<JobOutcome>>,
}

impl JobHandle {
    pub fn new(job_id: i64, handle: JoinHandle<Result<JobOutcome>>) -> Self {
        Self { job_id, handle }
    }

    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> Result<JobOutcome> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Job(format!("Job {} task aborted: {}", self.job_id, e))),
        }
    }
}

/// Bounded-concurrency executor for persisted jobs
#[derive(Clone)]
pub struct JobCoordinator {
    db: Database,
    config: JobsConfig,
}

impl JobCoordinator {
    pub fn new(db: Database, config: JobsConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Run every unit of `job_id` through `worker` and finish the job
    ///
    /// The job moves `queued → running → completed | cancelled`. A job that
    /// was cancelled before it started runs nothing.
    pub async fn run_units<T, F, Fut>(
        &self,
        job_id: i64,
        units: Vec<T>,
        worker: F,
    ) -> Result<JobOutcome>
    where
        T: JobUnit,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UnitReport>> + Send + 'static,
    {
        let total_units = units.len();
        match self.db.transition_job(job_id, JobStatus::Running, None) {
            Ok(()) => {}
            Err(Error::InvalidTransition { from, .. }) if from == JobStatus::Cancelled.as_str() => {
                info!(job_id, "Job cancelled before it started");
                return Ok(JobOutcome {
                    job_id,
                    status: JobStatus::Cancelled,
                    units_run: 0,
                    units_failed: 0,
                    units_skipped: total_units,
                });
            }
            Err(e) => return Err(e),
        }

        info!(
            job_id,
            units = total_units,
            concurrency = self.config.concurrency,
            "Job started"
        );

        let worker = Arc::new(worker);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let timeout = self.config.unit_timeout;
        let mut tasks = JoinSet::new();
        let mut units_skipped = 0;

        let mut pending = units.into_iter();
        while let Some(unit) = pending.next() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Job(e.to_string()))?;

            // Checked after waiting for a slot so a cancel during the wait counts
            if self.db.is_cancel_requested(job_id)? {
                units_skipped = 1 + pending.len();
                info!(job_id, skipped = units_skipped, "Cancellation noticed, draining");
                break;
            }

            let db = self.db.clone();
            let worker = worker.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let label = unit.label();
                let weight = unit.weight();
                let on_timeout = unit.on_timeout();
                let result = match tokio::time::timeout(timeout, worker(unit)).await {
                    Ok(result) => result,
                    Err(_) => {
                        let error = Error::Timeout(timeout.as_secs());
                        if let Some(action) = on_timeout {
                            if let Err(e) = action(&db, job_id, &error) {
                                warn!(job_id, unit = %label, error = %e, "Could not record unit timeout");
                            }
                        }
                        Err(error)
                    }
                };
                settle_unit(&db, job_id, &label, weight, result)
            });
        }

        let mut units_run = 0;
        let mut units_failed = 0;
        while let Some(joined) = tasks.join_next().await {
            units_run += 1;
            match joined {
                Ok(true) => {}
                Ok(false) => units_failed += 1,
                Err(e) => {
                    units_failed += 1;
                    warn!(job_id, error = %e, "Job unit panicked");
                    self.db
                        .record_job_unit_error(job_id, "unknown", "job", &e.to_string())?;
                    self.db.increment_job_progress(job_id, 1, 1)?;
                }
            }
        }

        let status = if units_skipped > 0 || self.db.is_cancel_requested(job_id)? {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        self.db.transition_job(job_id, status, None)?;

        let outcome = JobOutcome {
            job_id,
            status,
            units_run,
            units_failed,
            units_skipped,
        };
        self.db.set_job_summary(job_id, &serde_json::to_value(&outcome)?)?;
        info!(
            job_id,
            status = %status,
            units_run,
            units_failed,
            units_skipped,
            "Job finished"
        );
        Ok(outcome)
    }

    /// Run `run_units` on a background task
    pub fn spawn<T, F, Fut>(&self, job_id: i64, units: Vec<T>, worker: F) -> JobHandle
    where
        T: JobUnit,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<UnitReport>> + Send + 'static,
    {
        let coordinator = self.clone();
        let handle = tokio::spawn(async move {
            let result = coordinator.run_units(job_id, units, worker).await;
            if let Err(ref e) = result {
                coordinator.fail(job_id, e);
            }
            result
        });
        JobHandle::new(job_id, handle)
    }

    /// Mark a job failed after a coordinator fault
    ///
    /// A job that already reached a terminal state keeps it.
    pub fn fail(&self, job_id: i64, error: &Error) {
        match self
            .db
            .transition_job(job_id, JobStatus::Failed, Some(&error.to_string()))
        {
            Ok(()) => warn!(job_id, error_kind = error.kind(), "Job failed"),
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(job_id, from = %from, "Job already finished, not marking failed")
            }
            Err(e) => warn!(job_id, error = %e, "Could not mark job failed"),
        }
    }
}

/// Write a unit's outcome to the job counters; true when the unit succeeded
fn settle_unit(
    db: &Database,
    job_id: i64,
    label: &str,
    weight: i64,
    result: Result<UnitReport>,
) -> bool {
    let (succeeded, written) = match result {
        Ok(report) => {
            debug!(
                job_id,
                unit = label,
                processed = report.processed,
                failed = report.failed,
                "Unit finished"
            );
            let written = db
                .increment_job_progress(job_id, report.processed, report.failed)
                .and_then(|()| db.add_job_usage(job_id, report.tokens_used, report.cost_usd))
                .and_then(|()| {
                    if report.ingest.is_empty() {
                        Ok(())
                    } else {
                        db.add_job_ingest(job_id, &report.ingest)
                    }
                });
            (true, written)
        }
        Err(e) => {
            warn!(job_id, unit = label, error_kind = e.kind(), "Unit failed");
            let written = db
                .record_job_unit_error(job_id, label, e.kind(), &e.to_string())
                .and_then(|()| db.increment_job_progress(job_id, weight, weight));
            (false, written)
        }
    };
    if let Err(e) = written {
        warn!(job_id, unit = label, error = %e, "Could not record unit outcome");
    }
    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Step(i64);

    impl JobUnit for Step {
        fn label(&self) -> String {
            format!("step-{}", self.0)
        }
    }

    fn coordinator(db: &Database, concurrency: usize) -> JobCoordinator {
        JobCoordinator::new(
            db.clone(),
            JobsConfig {
                concurrency,
                unit_timeout: Duration::from_millis(200),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_unit_failures_do_not_fail_job() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Sync, 5).unwrap();

        let outcome = coordinator(&db, 2)
            .run_units(job_id, (0..5).map(Step).collect(), |step: Step| async move {
                if step.0 == 3 {
                    Err(Error::Upstream("provider unavailable".into()))
                } else {
                    Ok(UnitReport {
                        processed: 1,
                        failed: 0,
                        tokens_used: 10,
                        cost_usd: 0.01,
                        ..Default::default()
                    })
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.units_run, 5);
        assert_eq!(outcome.units_failed, 1);

        let job = db.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processed_count, 5);
        assert_eq!(job.failed_units, 1);
        assert_eq!(job.tokens_used, 40);
        assert!(job.summary.is_some());

        let errors = db.list_job_unit_errors(job_id).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].unit, "step-3");
        assert_eq!(errors[0].error_kind, "upstream");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Sync, 8).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (active.clone(), peak.clone());
        coordinator(&db, 2)
            .run_units(job_id, (0..8).map(Step).collect(), move |_step: Step| {
                let (active, peak) = (a.clone(), p.clone());
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(UnitReport::processed(1))
                }
            })
            .await
            .unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(db.get_job(job_id).unwrap().unwrap().processed_count, 8);
    }

    #[tokio::test]
    async fn test_timeout_is_a_unit_failure() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Enrichment, 2).unwrap();

        let outcome = coordinator(&db, 1)
            .run_units(job_id, vec![Step(0), Step(1)], |step: Step| async move {
                if step.0 == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok(UnitReport::processed(1))
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.units_failed, 1);
        let errors = db.list_job_unit_errors(job_id).unwrap();
        assert_eq!(errors[0].error_kind, "timeout");
    }

    struct Tracked(i64);

    impl JobUnit for Tracked {
        fn label(&self) -> String {
            format!("tracked-{}", self.0)
        }

        fn on_timeout(&self) -> Option<TimeoutAction> {
            let id = self.0;
            Some(Box::new(move |db: &Database, job_id: i64, error: &Error| {
                db.record_job_unit_error(job_id, &format!("cleanup-{}", id), error.kind(), "timed out")
            }))
        }
    }

    #[tokio::test]
    async fn test_timeout_action_runs_only_for_timed_out_units() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Enrichment, 2).unwrap();

        let outcome = coordinator(&db, 2)
            .run_units(
                job_id,
                vec![Tracked(0), Tracked(1)],
                |unit: Tracked| async move {
                    if unit.0 == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok(UnitReport::processed(1))
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.units_failed, 1);
        let mut units: Vec<String> = db
            .list_job_unit_errors(job_id)
            .unwrap()
            .into_iter()
            .map(|e| e.unit)
            .collect();
        units.sort();
        assert_eq!(units, vec!["cleanup-0".to_string(), "tracked-0".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_between_units() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Sync, 4).unwrap();

        let cancel_db = db.clone();
        let outcome = coordinator(&db, 1)
            .run_units(job_id, (0..4).map(Step).collect(), move |step: Step| {
                let db = cancel_db.clone();
                async move {
                    if step.0 == 1 {
                        db.request_job_cancel(job_id)?;
                    }
                    Ok(UnitReport::processed(1))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.units_run, 2);
        assert_eq!(outcome.units_skipped, 2);
        let job = db.get_job(job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.processed_count, 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Sync, 1).unwrap();
        assert!(db.request_job_cancel(job_id).unwrap());

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let outcome = coordinator(&db, 1)
            .spawn(job_id, vec![Step(0)], move |_step: Step| {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok(UnitReport::processed(1)) }
            })
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fail_keeps_terminal_state() {
        let db = Database::in_memory().unwrap();
        let job_id = db.create_job(JobKind::Sync, 0).unwrap();
        let coordinator = coordinator(&db, 1);

        coordinator
            .run_units(job_id, Vec::<Step>::new(), |_step: Step| async {
                Ok(UnitReport::default())
            })
            .await
            .unwrap();
        coordinator.fail(job_id, &Error::Job("late".into()));

        assert_eq!(
            db.get_job(job_id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
