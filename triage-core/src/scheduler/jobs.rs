//! Job identities, run records and the single-instance guard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// The three periodic jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ProcessIncidents,
    CleanupOldData,
    HealthCheck,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::ProcessIncidents,
        JobKind::CleanupOldData,
        JobKind::HealthCheck,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::ProcessIncidents => "process_incidents",
            JobKind::CleanupOldData => "cleanup_old_data",
            JobKind::HealthCheck => "health_check",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
    /// A previous run of the same job was still in progress.
    Skipped,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of one job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobRecord {
    pub fn new(kind: JobKind, started_at: DateTime<Utc>, status: JobStatus, detail: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status,
            started_at,
            completed_at: Utc::now(),
            detail,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// At most one running instance of a job.
#[derive(Debug, Default)]
pub struct JobSlot {
    running: AtomicBool,
}

impl JobSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or `None` if a run is already in progress.
    pub fn try_acquire(&self) -> Option<JobSlotGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| JobSlotGuard { slot: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Releases the slot on drop, including when the job panics.
#[derive(Debug)]
pub struct JobSlotGuard<'a> {
    slot: &'a JobSlot,
}

impl Drop for JobSlotGuard<'_> {
    fn drop(&mut self) {
        self.slot.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_names() {
        let names: Vec<_> = JobKind::ALL.iter().map(JobKind::name).collect();
        assert_eq!(names, ["process_incidents", "cleanup_old_data", "health_check"]);
        let json = serde_json::to_string(&JobKind::CleanupOldData).unwrap();
        assert_eq!(json, "\"cleanup_old_data\"");
    }

    #[test]
    fn test_slot_single_instance() {
        let slot = JobSlot::new();
        let guard = slot.try_acquire().unwrap();
        assert!(slot.is_running());
        assert!(slot.try_acquire().is_none());
        drop(guard);
        assert!(!slot.is_running());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn test_record_status() {
        let record = JobRecord::new(JobKind::HealthCheck, Utc::now(), JobStatus::Skipped, None);
        assert!(!record.is_success());
        assert_eq!(record.status.to_string(), "skipped");
        assert!(record.completed_at >= record.started_at);
    }
}
