//! Scheduling for the triage pipeline.
//!
//! Three periodic jobs (`process_incidents`, `cleanup_old_data`,
//! `health_check`) share one store and one lazily built processor, each
//! guarded so that at most one run of it is in progress.

pub mod cron;
pub mod jobs;
pub mod runner;

pub use cron::{JobSchedule, ScheduledJob, parse_cron_expression};
pub use jobs::{JobKind, JobRecord, JobSlot, JobStatus};
pub use runner::{HealthReport, ProcessorFactory, TriageScheduler, shutdown_signal};
