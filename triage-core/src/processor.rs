//! One processing cycle: ingest, pick pending incidents, analyse them one at
//! a time, record the outcome per incident.
//!
//! A failing incident is marked `error` and the cycle moves on. Each
//! incident is claimed for the duration of its analysis so that two callers
//! can never analyse the same incident concurrently.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::analysis::{AnalysisEngine, AnalysisResult};
use crate::error::{AnalysisError, StoreError};
use crate::evidence::{ContentExtractor, IncidentSource, PlainTextExtractor};
use crate::store::StateStore;
use crate::types::{Incident, IncidentStatus};

/// Outcome counts of one processing cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    /// New incidents stored from the evidence source.
    pub ingested: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Not attempted: already claimed elsewhere, or shutdown requested.
    pub skipped: usize,
    pub duration: Duration,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            ingested: 0,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            duration: Duration::ZERO,
        }
    }
}

/// Removes the incident from the in-flight set when dropped.
struct InFlightClaim<'a> {
    set: &'a Mutex<HashSet<String>>,
    incident_id: String,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        let mut set = self
            .set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.incident_id);
    }
}

pub struct IncidentProcessor {
    store: Arc<StateStore>,
    engine: AnalysisEngine,
    extractor: Arc<dyn ContentExtractor>,
    source: Option<Arc<dyn IncidentSource>>,
    in_flight: Mutex<HashSet<String>>,
}

impl IncidentProcessor {
    pub fn new(store: Arc<StateStore>, engine: AnalysisEngine) -> Self {
        Self {
            store,
            engine,
            extractor: Arc::new(PlainTextExtractor),
            source: None,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn IncidentSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    fn claim(&self, incident_id: &str) -> Option<InFlightClaim<'_>> {
        let mut set = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !set.insert(incident_id.to_string()) {
            return None;
        }
        Some(InFlightClaim {
            set: &self.in_flight,
            incident_id: incident_id.to_string(),
        })
    }

    /// Pull new incidents from the evidence source, if one is configured.
    /// Returns how many were new.
    pub async fn ingest(&self, lookback_hours: u64) -> usize {
        let Some(source) = &self.source else {
            return 0;
        };
        let since = Utc::now() - chrono::Duration::hours(lookback_hours as i64);
        let incidents = match source.fetch_recent(since).await {
            Ok(incidents) => incidents,
            Err(e) => {
                warn!(source = %source.describe(), error = %e, "Evidence ingestion failed");
                return 0;
            }
        };

        let stored = self
            .store
            .run_blocking(move |store| {
                let mut inserted = 0;
                for incident in &incidents {
                    // Per-incident failures are already logged by the store.
                    if let Ok(true) = store.put_incident(incident) {
                        inserted += 1;
                    }
                }
                Ok(inserted)
            })
            .await;
        stored.unwrap_or_else(|e| {
            warn!(error = %e, "Evidence ingestion could not reach the store");
            0
        })
    }

    /// Run one processing cycle.
    ///
    /// Only a failure to read the pending queue aborts the cycle; every
    /// per-incident failure is logged, recorded as `error` and counted.
    pub async fn run_cycle(
        &self,
        lookback_hours: u64,
        max_analyses: usize,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, StoreError> {
        let started = Instant::now();
        let mut report = CycleReport::new();
        info!(cycle_id = %report.cycle_id, lookback_hours, max_analyses, "Processing cycle started");

        report.ingested = self.ingest(lookback_hours).await;

        let since = Utc::now() - chrono::Duration::hours(lookback_hours as i64);
        let pending = self
            .store
            .run_blocking(move |store| store.pending_incidents(since, max_analyses))
            .await?;

        for (idx, incident) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped += pending.len() - idx;
                warn!(cycle_id = %report.cycle_id, skipped = pending.len() - idx, "Shutdown requested, ending cycle early");
                break;
            }
            let Some(_claim) = self.claim(&incident.incident_id) else {
                warn!(incident_id = %incident.incident_id, "Incident already in flight, skipping");
                report.skipped += 1;
                continue;
            };

            report.attempted += 1;
            match self.process(incident).await {
                Ok(_) => report.succeeded += 1,
                Err(_) => report.failed += 1,
            }
        }

        report.duration = started.elapsed();
        info!(
            cycle_id = %report.cycle_id,
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            ingested = report.ingested,
            duration_ms = report.duration.as_millis() as u64,
            "Processing cycle finished"
        );
        Ok(report)
    }

    /// Analyse one stored incident on demand, whatever its status.
    pub async fn analyze_one(&self, incident_id: &str) -> Result<AnalysisResult, AnalysisError> {
        let id = incident_id.to_string();
        let incident = self
            .store
            .run_blocking(move |store| store.get_incident(&id))
            .await?
            .ok_or_else(|| AnalysisError::Input {
                message: format!("incident {incident_id} not found"),
            })?;
        let _claim = self.claim(incident_id).ok_or_else(|| AnalysisError::Busy {
            incident_id: incident_id.to_string(),
        })?;
        self.process(&incident).await
    }

    /// Analyse and record the status transition. Caller holds the claim.
    async fn process(&self, incident: &Incident) -> Result<AnalysisResult, AnalysisError> {
        let content = match &incident.file_path {
            Some(path) => Some(self.extractor.extract(path).await),
            None => None,
        };

        let outcome = self
            .engine
            .analyze(&incident.incident_id, &incident.vendor_data, content)
            .await;

        let status = match &outcome {
            Ok(_) => IncidentStatus::Analyzed,
            Err(e) => {
                error!(
                    incident_id = %incident.incident_id,
                    error_class = e.kind(),
                    error = %e,
                    "Incident analysis failed"
                );
                IncidentStatus::Error
            }
        };

        let id = incident.incident_id.clone();
        let updated = self
            .store
            .run_blocking(move |store| store.set_incident_status(&id, status))
            .await;
        match (outcome, updated) {
            (Ok(result), Ok(_)) => Ok(result),
            (Ok(_), Err(e)) => Err(AnalysisError::Persistence(e)),
            (Err(e), _) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::error::LlmError;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::path::Path;

    fn setup(mock: Arc<MockLlmProvider>) -> (tempfile::TempDir, Arc<StateStore>, IncidentProcessor) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("t.db")).unwrap());
        let engine = AnalysisEngine::new(store.clone(), mock, "SYSTEM");
        let processor = IncidentProcessor::new(store.clone(), engine);
        (dir, store, processor)
    }

    fn pending(store: &StateStore, id: &str, minutes_ago: i64) {
        store
            .put_incident(
                &Incident::new(id, json!({"policy": {"name": "PII"}}))
                    .with_created_at(Utc::now() - ChronoDuration::minutes(minutes_ago)),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_cycle_isolates_failures() {
        let mock = Arc::new(MockLlmProvider::new());
        mock.queue_response(MockLlmProvider::verdict_json("TRUE_POSITIVE", 0.9));
        mock.queue_error(LlmError::ApiRequest {
            message: "quota exceeded".into(),
        });
        mock.queue_response(MockLlmProvider::verdict_json("FALSE_POSITIVE", 0.7));
        let (_dir, store, processor) = setup(mock);
        pending(&store, "first", 30);
        pending(&store, "second", 20);
        pending(&store, "third", 10);

        let report = processor
            .run_cycle(24, 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let status = |id: &str| store.get_incident(id).unwrap().unwrap().status;
        assert_eq!(status("first"), IncidentStatus::Analyzed);
        assert_eq!(status("second"), IncidentStatus::Error);
        assert_eq!(status("third"), IncidentStatus::Analyzed);
        assert!(store.latest_analysis("second").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cycle_respects_cap_and_window() {
        let mock = Arc::new(MockLlmProvider::with_response(MockLlmProvider::verdict_json(
            "TRUE_POSITIVE",
            0.9,
        )));
        let (_dir, store, processor) = setup(mock.clone());
        pending(&store, "too-old", 60 * 30);
        for n in 0..4 {
            pending(&store, &format!("inc-{n}"), 50 - n);
        }

        let report = processor
            .run_cycle(24, 2, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(mock.call_count(), 2);
        let status = |id: &str| store.get_incident(id).unwrap().unwrap().status;
        assert_eq!(status("inc-0"), IncidentStatus::Analyzed);
        assert_eq!(status("inc-1"), IncidentStatus::Analyzed);
        assert_eq!(status("inc-2"), IncidentStatus::Pending);
        assert_eq!(status("too-old"), IncidentStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_skips_remaining() {
        let mock = Arc::new(MockLlmProvider::with_response(MockLlmProvider::verdict_json(
            "TRUE_POSITIVE",
            0.9,
        )));
        let (_dir, store, processor) = setup(mock.clone());
        pending(&store, "a", 5);
        pending(&store, "b", 4);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = processor.run_cycle(24, 10, &cancel).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 2);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_claimed_incident_is_skipped() {
        let mock = Arc::new(MockLlmProvider::with_response(MockLlmProvider::verdict_json(
            "TRUE_POSITIVE",
            0.9,
        )));
        let (_dir, store, processor) = setup(mock);
        pending(&store, "busy", 5);

        let claim = processor.claim("busy").unwrap();
        assert!(processor.claim("busy").is_none());
        let report = processor
            .run_cycle(24, 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.attempted, 0);

        let err = processor.analyze_one("busy").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Busy { ref incident_id } if incident_id == "busy"));
        assert_eq!(err.kind(), "busy");

        drop(claim);
        assert!(processor.analyze_one("busy").await.is_ok());
    }

    #[tokio::test]
    async fn test_analyze_one_unknown_incident() {
        let (_dir, _store, processor) = setup(Arc::new(MockLlmProvider::new()));
        let err = processor.analyze_one("ghost").await.unwrap_err();
        assert!(matches!(err, AnalysisError::Input { .. }));
    }

    struct FixedSource(Vec<Incident>);

    #[async_trait]
    impl IncidentSource for FixedSource {
        async fn fetch_recent(
            &self,
            _since: chrono::DateTime<Utc>,
        ) -> Result<Vec<Incident>, crate::error::SourceError> {
            Ok(self.0.clone())
        }

        fn describe(&self) -> String {
            "fixed".into()
        }
    }

    struct UpperCaseExtractor;

    #[async_trait]
    impl ContentExtractor for UpperCaseExtractor {
        async fn extract(&self, path: &Path) -> crate::evidence::EvidenceContent {
            crate::evidence::EvidenceContent::new(
                path.file_name().unwrap().to_string_lossy(),
                "EXTRACTED BODY",
            )
        }
    }

    #[tokio::test]
    async fn test_cycle_ingests_and_extracts() {
        let mock = Arc::new(MockLlmProvider::with_response(MockLlmProvider::verdict_json(
            "TRUE_POSITIVE",
            0.9,
        )));
        let (_dir, store, processor) = setup(mock.clone());
        let delivered = vec![
            Incident::new("src-1", json!({"policy": {"name": "PCI"}})).with_file("/ev/cards.pdf", Some(9)),
            Incident::new("src-1", json!({"policy": {"name": "PCI"}})),
        ];
        let processor = processor
            .with_source(Arc::new(FixedSource(delivered)))
            .with_extractor(Arc::new(UpperCaseExtractor));

        let report = processor
            .run_cycle(24, 10, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.succeeded, 1);
        assert!(mock.requests()[0].prompt.contains("EXTRACTED BODY"));
        assert_eq!(
            store.get_incident("src-1").unwrap().unwrap().status,
            IncidentStatus::Analyzed
        );
    }
}
