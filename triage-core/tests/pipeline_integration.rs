//! Integration tests for the triage pipeline.
//!
//! These drive the store, engine, processor and feedback recorder together
//! against a temporary SQLite file, with MockLlmProvider standing in for the
//! model.

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use triage_core::analysis::AnalysisEngine;
use triage_core::brain::MockLlmProvider;
use triage_core::error::{AnalysisError, LlmError};
use triage_core::evidence::{EvidenceContent, IncidentMetadata};
use triage_core::feedback::FeedbackRecorder;
use triage_core::processor::IncidentProcessor;
use triage_core::prompt::{PRIOR_CORRECTIONS_HEADING, PromptComposer, SECTION_PRIOR_CORRECTIONS};
use triage_core::store::StateStore;
use triage_core::types::{
    Incident, IncidentStatus, NewAnalysis, NewFeedback, RelevanceScore, Verdict,
};

const INSTRUCTIONS: &str = "You are a DLP analyst.";

fn open_store() -> (tempfile::TempDir, Arc<StateStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::open(dir.path().join("incidents.db")).unwrap());
    (dir, store)
}

fn vendor_blob(policy: &str) -> serde_json::Value {
    json!({
        "user": {"email": "jane@example.com"},
        "policy": {"name": policy, "severity": "HIGH"},
        "risk_score": 7
    })
}

fn analysis_for(incident_id: &str, verdict: Verdict, created_at: chrono::DateTime<Utc>) -> NewAnalysis {
    NewAnalysis {
        incident_id: incident_id.to_string(),
        verdict,
        confidence: 0.9,
        reasoning: "Contains card numbers".to_string(),
        raw_response: "{}".to_string(),
        processing_time_secs: 1.5,
        created_at,
    }
}

#[test]
fn duplicate_incident_is_stored_once() {
    let (_dir, store) = open_store();
    let incident = Incident::new("INC-100", vendor_blob("PCI"));

    assert!(store.put_incident(&incident).unwrap());
    assert!(!store.put_incident(&incident).unwrap());
    assert_eq!(store.list_incidents(None).unwrap().len(), 1);
}

#[test]
fn retrieval_ranks_by_relevance_then_recency() {
    let (_dir, store) = open_store();
    store.put_incident(&Incident::new("INC-1", vendor_blob("PII"))).unwrap();
    let analysis_id = store
        .put_analysis(&analysis_for("INC-1", Verdict::TruePositive, Utc::now()))
        .unwrap();

    let base = Utc::now() - Duration::hours(2);
    let mut ids = Vec::new();
    for (n, score) in [1.0, 0.3, 0.7, 1.0].into_iter().enumerate() {
        let id = store
            .put_feedback(&NewFeedback {
                incident_id: "INC-1".into(),
                analysis_id,
                original_verdict: Verdict::TruePositive,
                corrected_verdict: Verdict::FalsePositive,
                analyst_comment: format!("Correction number {n}"),
                relevance_score: RelevanceScore::new(score).unwrap(),
                created_at: base + Duration::minutes(n as i64),
            })
            .unwrap();
        ids.push(id);
    }

    let selected: Vec<i64> = store
        .feedback_for_retrieval(3)
        .unwrap()
        .iter()
        .map(|item| item.feedback.id)
        .collect();
    assert_eq!(selected, vec![ids[3], ids[0], ids[2]]);
}

#[tokio::test]
async fn response_without_reasoning_is_rejected() {
    let (_dir, store) = open_store();
    store.put_incident(&Incident::new("INC-7", vendor_blob("HR"))).unwrap();
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_response(
        json!({
            "verdict": "FALSE_POSITIVE",
            "confidence": 0.6,
            "summary": "Looks like a template",
            "risk_level": "LOW"
        })
        .to_string(),
    );
    let engine = AnalysisEngine::new(Arc::clone(&store), mock, INSTRUCTIONS);

    let err = engine
        .analyze("INC-7", &vendor_blob("HR"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Schema { .. }));
    assert_eq!(err.kind(), "schema");
    assert!(store.latest_analysis("INC-7").unwrap().is_none());
}

#[tokio::test]
async fn feedback_moves_incident_status() {
    let (_dir, store) = open_store();
    for id in ["INC-A", "INC-B"] {
        store.put_incident(&Incident::new(id, vendor_blob("PII"))).unwrap();
        store.set_incident_status(id, IncidentStatus::Analyzed).unwrap();
        store
            .put_analysis(&analysis_for(id, Verdict::TruePositive, Utc::now()))
            .unwrap();
    }
    let recorder = FeedbackRecorder::new(Arc::clone(&store));

    let review = recorder
        .record_for_latest(
            "INC-A",
            Verdict::RequiresReview,
            "Escalating to the data owner",
            RelevanceScore::MEDIUM,
        )
        .await
        .unwrap();
    assert_eq!(review.status, IncidentStatus::Pending);
    assert_eq!(
        store.get_incident("INC-A").unwrap().unwrap().status,
        IncidentStatus::Pending
    );

    recorder
        .record_for_latest(
            "INC-B",
            Verdict::FalsePositive,
            "Synthetic test data from QA",
            RelevanceScore::HIGH,
        )
        .await
        .unwrap();
    assert_eq!(
        store.get_incident("INC-B").unwrap().unwrap().status,
        IncidentStatus::Analyzed
    );
}

#[test]
fn retention_purge_respects_the_window() {
    let (_dir, store) = open_store();
    for (id, age_days) in [("OLD", 31), ("RECENT", 29)] {
        let at = Utc::now() - Duration::days(age_days);
        store
            .put_incident(&Incident::new(id, vendor_blob("PII")).with_created_at(at))
            .unwrap();
        let analysis_id = store
            .put_analysis(&analysis_for(id, Verdict::TruePositive, at))
            .unwrap();
        store
            .put_feedback(&NewFeedback {
                incident_id: id.to_string(),
                analysis_id,
                original_verdict: Verdict::TruePositive,
                corrected_verdict: Verdict::TruePositive,
                analyst_comment: "Confirmed by analyst".into(),
                relevance_score: RelevanceScore::HIGH,
                created_at: at,
            })
            .unwrap();
    }

    let purged = store.purge_older_than(Duration::days(30)).unwrap();
    assert_eq!((purged.incidents, purged.analyses, purged.feedback), (1, 1, 1));

    assert!(store.get_incident("OLD").unwrap().is_none());
    assert!(store.get_incident("RECENT").unwrap().is_some());
    assert!(store.latest_analysis("RECENT").unwrap().is_some());
    assert_eq!(store.feedback_stats().unwrap().total_feedback, 1);
}

#[tokio::test]
async fn failing_incident_does_not_abort_cycle() {
    let (_dir, store) = open_store();
    for (n, id) in ["INC-1", "INC-2", "INC-3"].into_iter().enumerate() {
        store
            .put_incident(
                &Incident::new(id, vendor_blob("PII"))
                    .with_created_at(Utc::now() - Duration::minutes(30 - n as i64)),
            )
            .unwrap();
    }
    let mock = Arc::new(MockLlmProvider::new());
    mock.queue_response(MockLlmProvider::verdict_json("TRUE_POSITIVE", 0.95));
    mock.queue_error(LlmError::Connection {
        message: "connection reset by peer".into(),
    });
    mock.queue_response(MockLlmProvider::verdict_json("FALSE_POSITIVE", 0.7));

    let engine = AnalysisEngine::new(Arc::clone(&store), mock.clone(), INSTRUCTIONS);
    let processor = IncidentProcessor::new(Arc::clone(&store), engine);
    let report = processor
        .run_cycle(24, 10, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!((report.succeeded, report.failed), (2, 1));
    assert_eq!(mock.call_count(), 3);
    let status = |id: &str| store.get_incident(id).unwrap().unwrap().status;
    assert_eq!(status("INC-1"), IncidentStatus::Analyzed);
    assert_eq!(status("INC-2"), IncidentStatus::Error);
    assert_eq!(status("INC-3"), IncidentStatus::Analyzed);
    assert_eq!(
        store.latest_analysis("INC-3").unwrap().unwrap().verdict,
        Verdict::FalsePositive
    );
    assert_eq!(store.aggregate_stats().unwrap().total_analyses, 2);
}

#[test]
fn empty_feedback_context_has_no_corrections_section() {
    let metadata = IncidentMetadata::from_vendor(&vendor_blob("PII"));
    let content = EvidenceContent::new("export.csv", "name,ssn\nJohn,123-45-6789");
    let builder = PromptComposer::default().sections(INSTRUCTIONS, &[], &metadata, Some(&content));

    assert!(builder.get(SECTION_PRIOR_CORRECTIONS).is_none());
    let prompt = builder.build();
    assert!(prompt.starts_with(INSTRUCTIONS));
    assert!(!prompt.contains(PRIOR_CORRECTIONS_HEADING));
    assert!(prompt.contains("123-45-6789"));
}

#[tokio::test]
async fn correction_feeds_into_the_next_prompt() {
    let (_dir, store) = open_store();
    store
        .put_incident(&Incident::new("INC-1", vendor_blob("PII")).with_file("/evidence/INC-1/seed.csv", Some(42)))
        .unwrap();
    store.put_incident(&Incident::new("INC-2", vendor_blob("PII"))).unwrap();

    let mock = Arc::new(MockLlmProvider::with_response(MockLlmProvider::verdict_json(
        "TRUE_POSITIVE",
        0.9,
    )));
    let engine = AnalysisEngine::new(Arc::clone(&store), mock.clone(), INSTRUCTIONS);
    let first = engine
        .analyze("INC-1", &vendor_blob("PII"), None)
        .await
        .unwrap();
    FeedbackRecorder::new(Arc::clone(&store))
        .record(
            "INC-1",
            first.analysis_id,
            Verdict::TruePositive,
            Verdict::FalsePositive,
            "Seed data for the staging database",
            RelevanceScore::HIGH,
        )
        .await
        .unwrap();

    engine
        .analyze("INC-2", &vendor_blob("PII"), None)
        .await
        .unwrap();
    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].prompt.contains(PRIOR_CORRECTIONS_HEADING));
    assert!(requests[1].prompt.contains(PRIOR_CORRECTIONS_HEADING));
    assert!(requests[1].prompt.contains("Seed data for the staging database"));
}
