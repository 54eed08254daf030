//! The scheduler loop: three jobs on one runtime clock.
//!
//! Jobs run one at a time. Each run executes inside its own task so that a
//! panic in one job is recorded as a failure and the loop keeps going. The
//! incident processor is built on first use and shared by later cycles.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, StoreError};
use crate::processor::{CycleReport, IncidentProcessor};
use crate::scheduler::cron::{JobSchedule, ScheduledJob};
use crate::scheduler::jobs::{JobKind, JobRecord, JobSlot, JobStatus};
use crate::store::StateStore;
use crate::types::PurgeCounts;

/// Builds the processor the first time a cycle needs it.
pub type ProcessorFactory =
    Arc<dyn Fn(Arc<StateStore>) -> Result<IncidentProcessor, SchedulerError> + Send + Sync>;

/// How many finished job runs are kept for inspection.
const HISTORY_LIMIT: usize = 100;

/// Snapshot read by the health check job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub pending: u64,
    pub total_analyses: u64,
    pub total_feedback: u64,
    /// In `[0, 1]`.
    pub accuracy: f64,
}

impl HealthReport {
    pub fn summary_line(&self) -> String {
        format!(
            "HEALTH: OK | pending={} | analyses={} | feedback={} | accuracy={:.1}%",
            self.pending,
            self.total_analyses,
            self.total_feedback,
            self.accuracy * 100.0
        )
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    store: Arc<StateStore>,
    factory: ProcessorFactory,
    processor: OnceCell<Arc<IncidentProcessor>>,
    process_slot: JobSlot,
    cleanup_slot: JobSlot,
    health_slot: JobSlot,
}

impl SchedulerInner {
    fn slot(&self, kind: JobKind) -> &JobSlot {
        match kind {
            JobKind::ProcessIncidents => &self.process_slot,
            JobKind::CleanupOldData => &self.cleanup_slot,
            JobKind::HealthCheck => &self.health_slot,
        }
    }

    async fn processor(&self) -> Result<Arc<IncidentProcessor>, SchedulerError> {
        self.processor
            .get_or_try_init(|| async {
                info!("Initializing incident processor");
                (self.factory)(Arc::clone(&self.store)).map(Arc::new)
            })
            .await
            .map(Arc::clone)
    }

    async fn process(&self, cancel: &CancellationToken) -> Result<CycleReport, SchedulerError> {
        let processor = self.processor().await?;
        processor
            .run_cycle(
                self.config.lookback_hours,
                self.config.max_analyses_per_cycle,
                cancel,
            )
            .await
            .map_err(|e| SchedulerError::JobFailed {
                job: JobKind::ProcessIncidents.name().to_string(),
                message: e.to_string(),
            })
    }

    async fn cleanup(&self) -> Result<PurgeCounts, StoreError> {
        let age = chrono::Duration::days(self.config.retention_days as i64);
        self.store
            .run_blocking(move |store| store.purge_older_than(age))
            .await
    }

    async fn health(&self) -> Result<HealthReport, StoreError> {
        let (pending, stats) = self
            .store
            .run_blocking(|store| Ok((store.count_pending()?, store.aggregate_stats()?)))
            .await?;
        Ok(HealthReport {
            pending,
            total_analyses: stats.total_analyses,
            total_feedback: stats.total_feedback,
            accuracy: stats.accuracy,
        })
    }

    async fn execute(&self, kind: JobKind, cancel: &CancellationToken) -> Result<String, SchedulerError> {
        let failed = |e: StoreError| SchedulerError::JobFailed {
            job: kind.name().to_string(),
            message: e.to_string(),
        };
        match kind {
            JobKind::ProcessIncidents => {
                let report = self.process(cancel).await?;
                Ok(format!(
                    "{} succeeded, {} failed, {} skipped",
                    report.succeeded, report.failed, report.skipped
                ))
            }
            JobKind::CleanupOldData => {
                let purged = self.cleanup().await.map_err(failed)?;
                info!(
                    retention_days = self.config.retention_days,
                    incidents = purged.incidents,
                    analyses = purged.analyses,
                    feedback = purged.feedback,
                    "Retention cleanup finished"
                );
                Ok(format!("purged {purged}"))
            }
            JobKind::HealthCheck => match self.health().await {
                Ok(report) => {
                    let line = report.summary_line();
                    info!("{line}");
                    Ok(line)
                }
                Err(e) => {
                    error!("HEALTH: FAIL | {e}");
                    Err(failed(e))
                }
            },
        }
    }
}

/// Runs `process_incidents`, `cleanup_old_data` and `health_check` until cancelled.
pub struct TriageScheduler {
    inner: Arc<SchedulerInner>,
    jobs: Vec<ScheduledJob>,
    history: Vec<JobRecord>,
}

impl TriageScheduler {
    /// The store must already be open: failing to open it is fatal before
    /// the scheduler exists.
    pub fn new(
        config: SchedulerConfig,
        store: Arc<StateStore>,
        factory: ProcessorFactory,
    ) -> Result<Self, SchedulerError> {
        let now = Utc::now();
        let jobs = vec![
            ScheduledJob::new(
                JobKind::ProcessIncidents,
                JobSchedule::every_minutes(config.scan_interval_minutes),
                now,
            ),
            ScheduledJob::new(
                JobKind::CleanupOldData,
                JobSchedule::cron(&config.cleanup_schedule)?,
                now,
            ),
            ScheduledJob::new(
                JobKind::HealthCheck,
                JobSchedule::every_minutes(config.health_interval_minutes),
                now,
            ),
        ];
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                factory,
                processor: OnceCell::new(),
                process_slot: JobSlot::new(),
                cleanup_slot: JobSlot::new(),
                health_slot: JobSlot::new(),
            }),
            jobs,
            history: Vec::new(),
        })
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Most recent job runs, oldest first.
    pub fn history(&self) -> &[JobRecord] {
        &self.history
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    /// One processing cycle outside the loop.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, SchedulerError> {
        self.inner.process(cancel).await
    }

    pub async fn health_check(&self) -> Result<HealthReport, StoreError> {
        self.inner.health().await
    }

    pub async fn cleanup(&self) -> Result<PurgeCounts, StoreError> {
        self.inner.cleanup().await
    }

    /// Run one job with the single-instance guard and panic isolation.
    pub async fn run_job(&mut self, kind: JobKind, cancel: &CancellationToken) -> JobRecord {
        let started_at = Utc::now();
        let started = Instant::now();
        let inner = Arc::clone(&self.inner);

        let record = match inner.slot(kind).try_acquire() {
            None => {
                warn!(job = %kind, "Previous run still in progress, skipping trigger");
                JobRecord::new(kind, started_at, JobStatus::Skipped, None)
            }
            Some(_guard) => {
                info!(job = %kind, "Job started");
                let task_inner = Arc::clone(&inner);
                let task_cancel = cancel.clone();
                let handle =
                    tokio::spawn(async move { task_inner.execute(kind, &task_cancel).await });
                let elapsed_ms = || started.elapsed().as_millis() as u64;
                match handle.await {
                    Ok(Ok(detail)) => {
                        info!(job = %kind, elapsed_ms = elapsed_ms(), detail = %detail, "Job completed");
                        JobRecord::new(kind, started_at, JobStatus::Completed, Some(detail))
                    }
                    Ok(Err(e)) => {
                        error!(job = %kind, error_class = "job", error = %e, elapsed_ms = elapsed_ms(), "Job failed");
                        JobRecord::new(kind, started_at, JobStatus::Failed, Some(e.to_string()))
                    }
                    Err(join_err) => {
                        error!(job = %kind, error_class = "panic", error = %join_err, "Job aborted");
                        JobRecord::new(kind, started_at, JobStatus::Failed, Some(join_err.to_string()))
                    }
                }
            }
        };

        self.history.push(record.clone());
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
        record
    }

    /// Main loop. Returns once `cancel` fires; a job already running is
    /// allowed to finish first.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(
            scan_interval_minutes = self.inner.config.scan_interval_minutes,
            cleanup_schedule = %self.inner.config.cleanup_schedule,
            health_interval_minutes = self.inner.config.health_interval_minutes,
            "Scheduler started"
        );

        if self.inner.config.run_on_startup && !cancel.is_cancelled() {
            self.run_job(JobKind::ProcessIncidents, &cancel).await;
        }

        loop {
            let Some(next_due) = self.jobs.iter().filter_map(|j| j.next_run).min() else {
                warn!("No job has a next fire time, stopping scheduler");
                break;
            };
            let wait = (next_due - Utc::now()).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let now = Utc::now();
            let due: Vec<JobKind> = self
                .jobs
                .iter()
                .filter(|j| j.is_due(now))
                .map(|j| j.kind)
                .collect();
            for kind in due {
                if cancel.is_cancelled() {
                    break;
                }
                self.run_job(kind, &cancel).await;
                let finished = Utc::now();
                if let Some(job) = self.jobs.iter_mut().find(|j| j.kind == kind) {
                    job.mark_executed(finished);
                }
            }
        }

        info!("Scheduler stopped");
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
