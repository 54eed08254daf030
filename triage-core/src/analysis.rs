//! Analysis engine: compose, call the model under a fixed schema, validate,
//! persist.
//!
//! The model output is decoded into a typed `ModelVerdict` in one step. A
//! response that is not valid JSON, misses a required field or carries an
//! out-of-range confidence is a `SchemaError` and nothing is written.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::brain::{LlmProvider, StructuredRequest};
use crate::config::TriageConfig;
use crate::error::{AnalysisError, ConfigError, LlmError};
use crate::evidence::{EvidenceContent, IncidentMetadata};
use crate::prompt::PromptComposer;
use crate::retriever::FeedbackRetriever;
use crate::store::StateStore;
use crate::types::{NewAnalysis, RiskLevel, Verdict};

/// JSON schema the model must answer with.
pub fn response_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "verdict": {
                "type": "string",
                "enum": ["TRUE_POSITIVE", "FALSE_POSITIVE", "REQUIRES_REVIEW"],
                "description": "Classification of the incident"
            },
            "confidence": {
                "type": "number",
                "description": "Confidence between 0.0 and 1.0"
            },
            "summary": {
                "type": "string",
                "description": "Short summary of the analysis (max 200 chars)"
            },
            "reasoning": {
                "type": "string",
                "description": "Detailed justification of the verdict (min 100 chars)"
            },
            "risk_level": {
                "type": "string",
                "enum": ["CRITICAL", "HIGH", "MEDIUM", "LOW", "N/A"],
                "description": "Risk level when the incident is a true positive"
            },
            "indicators": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Technical indicators found"
            },
            "recommendations": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Recommended SOC actions"
            },
            "false_positive_reasons": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Why the alert is benign, for false positives"
            }
        },
        "required": ["verdict", "confidence", "summary", "reasoning", "risk_level", "indicators"]
    })
}

/// The model's answer after schema validation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelVerdict {
    pub verdict: Verdict,
    pub confidence: f64,
    pub summary: String,
    pub reasoning: String,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub indicators: Option<Vec<String>>,
    #[serde(default)]
    pub recommendations: Option<Vec<String>>,
    #[serde(default)]
    pub false_positive_reasons: Option<Vec<String>>,
}

/// Remove a Markdown code fence some models wrap around JSON.
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Decode and validate raw model output.
pub fn decode_model_output(raw: &str) -> Result<ModelVerdict, AnalysisError> {
    let parsed: ModelVerdict =
        serde_json::from_str(strip_code_fence(raw)).map_err(|e| AnalysisError::Schema {
            message: e.to_string(),
        })?;

    if !parsed.confidence.is_finite() || !(0.0..=1.0).contains(&parsed.confidence) {
        return Err(AnalysisError::Schema {
            message: format!("confidence {} outside [0, 1]", parsed.confidence),
        });
    }
    if parsed.reasoning.trim().is_empty() {
        return Err(AnalysisError::Schema {
            message: "reasoning is empty".to_string(),
        });
    }
    Ok(parsed)
}

/// Outcome of one successful analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub analysis_id: i64,
    pub incident_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub summary: String,
    pub reasoning: String,
    pub risk_level: RiskLevel,
    pub indicators: Vec<String>,
    pub recommendations: Vec<String>,
    pub false_positive_reasons: Vec<String>,
    /// Wall-clock seconds from start to persisted row.
    pub processing_time: f64,
    pub has_file: bool,
    pub file_name: Option<String>,
}

/// Sends incidents to the model and records verdicts.
pub struct AnalysisEngine {
    store: Arc<StateStore>,
    provider: Arc<dyn LlmProvider>,
    retriever: FeedbackRetriever,
    composer: PromptComposer,
    instructions: String,
    use_feedback_context: bool,
    temperature: f32,
    max_output_tokens: u32,
    call_timeout: Duration,
}

impl AnalysisEngine {
    pub fn new(
        store: Arc<StateStore>,
        provider: Arc<dyn LlmProvider>,
        instructions: impl Into<String>,
    ) -> Self {
        let defaults = crate::config::LlmConfig::default();
        Self {
            retriever: FeedbackRetriever::new(Arc::clone(&store)),
            store,
            provider,
            composer: PromptComposer::default(),
            instructions: instructions.into(),
            use_feedback_context: true,
            temperature: defaults.temperature,
            max_output_tokens: defaults.max_output_tokens,
            call_timeout: defaults.call_budget(),
        }
    }

    /// Build an engine with every knob taken from configuration.
    pub fn from_config(
        store: Arc<StateStore>,
        provider: Arc<dyn LlmProvider>,
        config: &TriageConfig,
    ) -> Result<Self, ConfigError> {
        let instructions = config.load_system_prompt()?;
        let mut engine = Self::new(store, provider, instructions);
        engine.retriever = engine.retriever.with_limit(config.analysis.retrieval_limit);
        engine.composer = PromptComposer::new(config.analysis.max_content_chars);
        engine.use_feedback_context = config.analysis.use_feedback_context;
        engine.temperature = config.llm.temperature;
        engine.max_output_tokens = config.llm.max_output_tokens;
        engine.call_timeout = config.llm.call_budget();
        Ok(engine)
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_feedback_context(mut self, enabled: bool) -> Self {
        self.use_feedback_context = enabled;
        self
    }

    pub fn with_retrieval_limit(mut self, limit: usize) -> Self {
        self.retriever = self.retriever.with_limit(limit);
        self
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Build the prompt for an incident without calling the model.
    pub async fn compose_prompt(
        &self,
        metadata: &Value,
        content: Option<&EvidenceContent>,
    ) -> String {
        let retrieved = if self.use_feedback_context {
            match self.retriever.context().await {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "Feedback retrieval failed, analysing without context");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        self.composer.compose(
            &self.instructions,
            &retrieved,
            &IncidentMetadata::from_vendor(metadata),
            content,
        )
    }

    /// Classify one incident and persist the verdict.
    pub async fn analyze(
        &self,
        incident_id: &str,
        metadata: &Value,
        content: Option<EvidenceContent>,
    ) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();

        let metadata_empty = match metadata {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if content.is_none() && metadata_empty {
            return Err(AnalysisError::Input {
                message: format!("incident {incident_id} has neither content nor metadata"),
            });
        }

        let prompt = self.compose_prompt(metadata, content.as_ref()).await;
        debug!(
            incident_id,
            prompt_chars = prompt.chars().count(),
            model = self.provider.model_name(),
            "Requesting verdict"
        );

        let request = StructuredRequest {
            prompt,
            response_schema: response_schema(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        };
        let raw = tokio::time::timeout(self.call_timeout, self.provider.generate_structured(request))
            .await
            .map_err(|_| LlmError::Timeout {
                timeout_secs: self.call_timeout.as_secs(),
            })??;

        let verdict = decode_model_output(&raw)?;
        let processing_time = started.elapsed().as_secs_f64();

        let record = NewAnalysis {
            incident_id: incident_id.to_string(),
            verdict: verdict.verdict,
            confidence: verdict.confidence,
            reasoning: verdict.reasoning.clone(),
            raw_response: raw,
            processing_time_secs: processing_time,
            created_at: Utc::now(),
        };
        let analysis_id = self
            .store
            .run_blocking(move |store| store.put_analysis(&record))
            .await?;

        info!(
            incident_id,
            analysis_id,
            verdict = %verdict.verdict,
            confidence = verdict.confidence,
            elapsed_ms = (processing_time * 1000.0) as u64,
            "Incident analysed"
        );

        Ok(AnalysisResult {
            analysis_id,
            incident_id: incident_id.to_string(),
            verdict: verdict.verdict,
            confidence: verdict.confidence,
            summary: verdict.summary,
            reasoning: verdict.reasoning,
            risk_level: verdict.risk_level.unwrap_or_default(),
            indicators: verdict.indicators.unwrap_or_default(),
            recommendations: verdict.recommendations.unwrap_or_default(),
            false_positive_reasons: verdict.false_positive_reasons.unwrap_or_default(),
            processing_time,
            has_file: content.is_some(),
            file_name: content.map(|c| c.file_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::MockLlmProvider;
    use crate::types::Incident;
    use pretty_assertions::assert_eq;

    fn setup(mock: MockLlmProvider) -> (tempfile::TempDir, Arc<StateStore>, Arc<MockLlmProvider>, AnalysisEngine) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("t.db")).unwrap());
        store
            .put_incident(&Incident::new("inc-1", json!({"policy": {"name": "PII"}})))
            .unwrap();
        let mock = Arc::new(mock);
        let engine = AnalysisEngine::new(store.clone(), mock.clone(), "SYSTEM INSTRUCTIONS");
        (dir, store, mock, engine)
    }

    #[test]
    fn test_decode_valid_output() {
        let raw = MockLlmProvider::verdict_json("TRUE_POSITIVE", 0.92);
        let verdict = decode_model_output(&raw).unwrap();
        assert_eq!(verdict.verdict, Verdict::TruePositive);
        assert_eq!(verdict.risk_level, Some(RiskLevel::High));
    }

    #[test]
    fn test_decode_missing_reasoning_is_schema_error() {
        let raw = r#"{"verdict": "TRUE_POSITIVE", "confidence": 0.9, "summary": "s"}"#;
        match decode_model_output(raw) {
            Err(AnalysisError::Schema { message }) => assert!(message.contains("reasoning")),
            other => panic!("Expected Schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_verdict_and_bad_confidence() {
        let raw = r#"{"verdict": "MAYBE", "confidence": 0.5, "summary": "s", "reasoning": "r"}"#;
        assert!(matches!(decode_model_output(raw), Err(AnalysisError::Schema { .. })));

        let raw = r#"{"verdict": "FALSE_POSITIVE", "confidence": 1.5, "summary": "s", "reasoning": "r"}"#;
        assert!(matches!(decode_model_output(raw), Err(AnalysisError::Schema { .. })));

        assert!(matches!(decode_model_output("not json"), Err(AnalysisError::Schema { .. })));
    }

    #[test]
    fn test_decode_tolerates_fence_and_null_lists() {
        let raw = "```json\n{\"verdict\": \"FALSE_POSITIVE\", \"confidence\": 0.3, \"summary\": \"s\", \
                   \"reasoning\": \"Public brochure\", \"false_positive_reasons\": null}\n```";
        let verdict = decode_model_output(raw).unwrap();
        assert_eq!(verdict.verdict, Verdict::FalsePositive);
        assert_eq!(verdict.false_positive_reasons, None);
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = response_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        for field in ["verdict", "confidence", "summary", "reasoning"] {
            assert!(required.contains(&field));
        }
    }

    #[tokio::test]
    async fn test_analyze_persists_verdict() {
        let (_dir, store, mock, engine) =
            setup(MockLlmProvider::with_response(MockLlmProvider::verdict_json("TRUE_POSITIVE", 0.9)));
        let content = EvidenceContent::new("ssn.txt", "123-45-6789");

        let result = engine
            .analyze("inc-1", &json!({"policy": {"name": "PII"}}), Some(content))
            .await
            .unwrap();
        assert_eq!(result.verdict, Verdict::TruePositive);
        assert_eq!(result.risk_level, RiskLevel::High);
        assert!(result.has_file);
        assert_eq!(result.file_name.as_deref(), Some("ssn.txt"));

        let stored = store.latest_analysis("inc-1").unwrap().unwrap();
        assert_eq!(stored.id, result.analysis_id);
        assert_eq!(stored.verdict, Verdict::TruePositive);
        assert!(stored.raw_response.contains("TRUE_POSITIVE"));

        let request = &mock.requests()[0];
        assert!(request.prompt.starts_with("SYSTEM INSTRUCTIONS"));
        assert!(request.prompt.contains("123-45-6789"));
        assert_eq!(request.response_schema, response_schema());
    }

    #[tokio::test]
    async fn test_analyze_schema_error_writes_nothing() {
        let (_dir, store, _mock, engine) = setup(MockLlmProvider::with_response(
            r#"{"verdict": "TRUE_POSITIVE", "confidence": 0.9, "summary": "s"}"#,
        ));
        let err = engine
            .analyze("inc-1", &json!({"policy": {}}), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "schema");
        assert!(store.latest_analysis("inc-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_analyze_without_input_is_input_error() {
        let (_dir, _store, mock, engine) = setup(MockLlmProvider::new());
        let err = engine.analyze("inc-1", &json!({}), None).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Input { .. }));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_analyze_times_out() {
        let mock = MockLlmProvider::with_response(MockLlmProvider::verdict_json("TRUE_POSITIVE", 0.9))
            .with_delay(Duration::from_millis(500));
        let (_dir, store, _mock, engine) = setup(mock);
        let engine = engine.with_call_timeout(Duration::from_millis(20));

        let err = engine
            .analyze("inc-1", &json!({"policy": {}}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Transport(LlmError::Timeout { .. })));
        assert!(store.latest_analysis("inc-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metadata_only_prompt_has_marker() {
        let (_dir, _store, mock, engine) =
            setup(MockLlmProvider::with_response(MockLlmProvider::verdict_json("FALSE_POSITIVE", 0.4)));
        let result = engine
            .analyze("inc-1", &json!({"user": {"id": "dan@example.com"}}), None)
            .await
            .unwrap();
        assert!(!result.has_file);
        assert_eq!(result.risk_level, RiskLevel::NotApplicable);
        assert!(mock.requests()[0].prompt.contains(crate::prompt::NO_FILE_MARKER));
    }
}
