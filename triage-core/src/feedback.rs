//! Analyst feedback recording.
//!
//! A review is validated here (comment length, incident and analysis
//! exist), then stored in the same transaction as the incident's new
//! status: `REQUIRES_REVIEW` sends it back to `pending` for another cycle,
//! any other verdict settles it as `analyzed`.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::FeedbackError;
use crate::store::StateStore;
use crate::types::{IncidentStatus, NewFeedback, RelevanceScore, Verdict};

/// Minimum analyst comment length, in characters after trimming.
pub const MIN_COMMENT_CHARS: usize = 10;

/// Check an analyst comment and return it trimmed.
pub fn validate_comment(comment: &str) -> Result<&str, FeedbackError> {
    let trimmed = comment.trim();
    let len = trimmed.chars().count();
    if len < MIN_COMMENT_CHARS {
        return Err(FeedbackError::Validation {
            field: "comment".to_string(),
            message: format!("must be at least {MIN_COMMENT_CHARS} characters (got {len})"),
        });
    }
    Ok(trimmed)
}

/// What a successful review changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedFeedback {
    pub feedback_id: i64,
    pub incident_id: String,
    pub analysis_id: i64,
    pub original_verdict: Verdict,
    pub corrected_verdict: Verdict,
    /// Incident status after the review.
    pub status: IncidentStatus,
}

pub struct FeedbackRecorder {
    store: Arc<StateStore>,
}

impl FeedbackRecorder {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        incident_id: &str,
        analysis_id: i64,
        original_verdict: Verdict,
        corrected_verdict: Verdict,
        comment: &str,
        relevance: RelevanceScore,
    ) -> Result<RecordedFeedback, FeedbackError> {
        let comment = validate_comment(comment)?.to_string();

        let id = incident_id.to_string();
        let incident = self
            .store
            .run_blocking(move |store| store.get_incident(&id))
            .await?;
        if incident.is_none() {
            return Err(FeedbackError::UnknownIncident {
                incident_id: incident_id.to_string(),
            });
        }

        let analysis = self
            .store
            .run_blocking(move |store| store.get_analysis(analysis_id))
            .await?
            .ok_or_else(|| FeedbackError::NoAnalysis {
                incident_id: incident_id.to_string(),
            })?;
        if analysis.incident_id != incident_id {
            return Err(FeedbackError::Validation {
                field: "analysis_id".to_string(),
                message: format!(
                    "analysis {analysis_id} belongs to incident {}, not {incident_id}",
                    analysis.incident_id
                ),
            });
        }

        let feedback = NewFeedback {
            incident_id: incident_id.to_string(),
            analysis_id,
            original_verdict,
            corrected_verdict,
            analyst_comment: comment,
            relevance_score: relevance,
            created_at: Utc::now(),
        };
        let status = if corrected_verdict == Verdict::RequiresReview {
            IncidentStatus::Pending
        } else {
            IncidentStatus::Analyzed
        };
        let feedback_id = self
            .store
            .run_blocking(move |store| store.record_feedback(&feedback, status))
            .await?;

        info!(
            incident_id,
            analysis_id,
            feedback_id,
            original = %original_verdict,
            corrected = %corrected_verdict,
            relevance = relevance.value(),
            status = %status,
            "Analyst feedback recorded"
        );

        Ok(RecordedFeedback {
            feedback_id,
            incident_id: incident_id.to_string(),
            analysis_id,
            original_verdict,
            corrected_verdict,
            status,
        })
    }

    /// Review the incident's latest analysis, using its verdict as the original.
    pub async fn record_for_latest(
        &self,
        incident_id: &str,
        corrected_verdict: Verdict,
        comment: &str,
        relevance: RelevanceScore,
    ) -> Result<RecordedFeedback, FeedbackError> {
        validate_comment(comment)?;
        let id = incident_id.to_string();
        let (incident, latest) = self
            .store
            .run_blocking(move |store| Ok((store.get_incident(&id)?, store.latest_analysis(&id)?)))
            .await?;
        if incident.is_none() {
            return Err(FeedbackError::UnknownIncident {
                incident_id: incident_id.to_string(),
            });
        }
        let latest = latest.ok_or_else(|| FeedbackError::NoAnalysis {
            incident_id: incident_id.to_string(),
        })?;

        self.record(
            incident_id,
            latest.id,
            latest.verdict,
            corrected_verdict,
            comment,
            relevance,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Incident, NewAnalysis};
    use pretty_assertions::assert_eq;

    fn setup() -> (tempfile::TempDir, Arc<StateStore>, i64) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("t.db")).unwrap());
        store
            .put_incident(&Incident::new("inc-1", serde_json::json!({"k": "v"})))
            .unwrap();
        store.put_incident(&Incident::new("inc-2", serde_json::json!({}))).unwrap();
        let analysis_id = store
            .put_analysis(&NewAnalysis {
                incident_id: "inc-1".into(),
                verdict: Verdict::TruePositive,
                confidence: 0.8,
                reasoning: "Customer list".into(),
                raw_response: "{}".into(),
                processing_time_secs: 2.0,
                created_at: Utc::now(),
            })
            .unwrap();
        (dir, store, analysis_id)
    }

    #[test]
    fn test_validate_comment() {
        assert!(validate_comment("too short").is_err());
        assert!(validate_comment("   padded    ").is_err());
        assert_eq!(validate_comment("  Approved vendor transfer ").unwrap(), "Approved vendor transfer");
        let err = validate_comment("").unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_correction_settles_incident() {
        let (_dir, store, analysis_id) = setup();
        let recorder = FeedbackRecorder::new(store.clone());
        let recorded = recorder
            .record(
                "inc-1",
                analysis_id,
                Verdict::TruePositive,
                Verdict::FalsePositive,
                "Dummy data from the staging seed",
                RelevanceScore::HIGH,
            )
            .await
            .unwrap();
        assert_eq!(recorded.status, IncidentStatus::Analyzed);
        assert_eq!(
            store.get_incident("inc-1").unwrap().unwrap().status,
            IncidentStatus::Analyzed
        );
        assert_eq!(store.feedback_stats().unwrap().corrections, 1);
    }

    #[tokio::test]
    async fn test_failed_status_update_keeps_no_feedback() {
        let (_dir, store, analysis_id) = setup();
        rusqlite::Connection::open(store.path())
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER freeze_status BEFORE UPDATE OF status ON incidents
                 BEGIN SELECT RAISE(ABORT, 'status is frozen'); END;",
            )
            .unwrap();

        let err = FeedbackRecorder::new(store.clone())
            .record(
                "inc-1",
                analysis_id,
                Verdict::TruePositive,
                Verdict::FalsePositive,
                "Dummy data from the staging seed",
                RelevanceScore::HIGH,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "persistence");
        assert_eq!(store.feedback_stats().unwrap().total_feedback, 0);
    }

    #[tokio::test]
    async fn test_requires_review_requeues_incident() {
        let (_dir, store, analysis_id) = setup();
        store.set_incident_status("inc-1", IncidentStatus::Analyzed).unwrap();
        let recorded = FeedbackRecorder::new(store.clone())
            .record(
                "inc-1",
                analysis_id,
                Verdict::TruePositive,
                Verdict::RequiresReview,
                "Need the DLP owner to confirm",
                RelevanceScore::MEDIUM,
            )
            .await
            .unwrap();
        assert_eq!(recorded.status, IncidentStatus::Pending);
        assert_eq!(
            store.get_incident("inc-1").unwrap().unwrap().status,
            IncidentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_short_comment_writes_nothing() {
        let (_dir, store, analysis_id) = setup();
        let err = FeedbackRecorder::new(store.clone())
            .record(
                "inc-1",
                analysis_id,
                Verdict::TruePositive,
                Verdict::FalsePositive,
                "nope",
                RelevanceScore::LOW,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::Validation { .. }));
        assert_eq!(store.feedback_stats().unwrap().total_feedback, 0);
    }

    #[tokio::test]
    async fn test_unknown_incident_and_mismatched_analysis() {
        let (_dir, store, analysis_id) = setup();
        let recorder = FeedbackRecorder::new(store);
        let err = recorder
            .record(
                "ghost",
                analysis_id,
                Verdict::TruePositive,
                Verdict::TruePositive,
                "Confirmed by the data owner",
                RelevanceScore::HIGH,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::UnknownIncident { .. }));

        let err = recorder
            .record(
                "inc-2",
                analysis_id,
                Verdict::TruePositive,
                Verdict::TruePositive,
                "Confirmed by the data owner",
                RelevanceScore::HIGH,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::Validation { ref field, .. } if field == "analysis_id"));
    }

    #[tokio::test]
    async fn test_record_for_latest() {
        let (_dir, store, analysis_id) = setup();
        let recorder = FeedbackRecorder::new(store);
        let recorded = recorder
            .record_for_latest(
                "inc-1",
                Verdict::TruePositive,
                "Confirmed exfiltration of customer list",
                RelevanceScore::HIGH,
            )
            .await
            .unwrap();
        assert_eq!(recorded.analysis_id, analysis_id);
        assert_eq!(recorded.original_verdict, Verdict::TruePositive);

        let err = recorder
            .record_for_latest(
                "inc-2",
                Verdict::FalsePositive,
                "Nothing was analysed here",
                RelevanceScore::LOW,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::NoAnalysis { .. }));
    }
}
