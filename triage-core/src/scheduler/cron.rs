//! Job schedules: fixed intervals and cron expressions.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

use crate::error::SchedulerError;
use crate::scheduler::jobs::JobKind;

/// Parse a cron expression string into a Schedule.
///
/// Expressions carry a seconds field first, e.g. `"0 0 3 * * * *"` for 03:00 daily.
pub fn parse_cron_expression(expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(expr).map_err(|e| SchedulerError::InvalidCronExpression {
        expression: expr.to_string(),
        message: e.to_string(),
    })
}

/// When a job fires.
#[derive(Debug, Clone)]
pub enum JobSchedule {
    Every(Duration),
    Cron(Box<Schedule>),
}

impl JobSchedule {
    pub fn every_minutes(minutes: u64) -> Self {
        JobSchedule::Every(Duration::from_secs(minutes.max(1) * 60))
    }

    pub fn cron(expr: &str) -> Result<Self, SchedulerError> {
        Ok(JobSchedule::Cron(Box::new(parse_cron_expression(expr)?)))
    }

    /// First fire time strictly after `from`.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Every(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                from.checked_add_signed(period)
            }
            JobSchedule::Cron(schedule) => schedule.after(&from).next(),
        }
    }
}

impl std::fmt::Display for JobSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobSchedule::Every(period) => write!(f, "every {}s", period.as_secs()),
            JobSchedule::Cron(schedule) => write!(f, "cron '{}'", schedule),
        }
    }
}

/// A job and its position on the clock.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub schedule: JobSchedule,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: usize,
}

impl ScheduledJob {
    pub fn new(kind: JobKind, schedule: JobSchedule, now: DateTime<Utc>) -> Self {
        let next_run = schedule.next_after(now);
        Self {
            kind,
            schedule,
            last_run: None,
            next_run,
            run_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run.is_some_and(|next| next <= now)
    }

    /// Record a finished run. The next fire time counts from `finished`, so
    /// triggers missed while the job ran are dropped rather than replayed.
    pub fn mark_executed(&mut self, finished: DateTime<Utc>) {
        self.last_run = Some(finished);
        self.run_count += 1;
        self.next_run = self.schedule.next_after(finished);
    }
}
