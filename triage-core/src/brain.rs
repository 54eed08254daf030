//! Model invocation boundary.
//!
//! Defines the `LlmProvider` trait: one prompt plus a fixed JSON schema in,
//! raw JSON text out. Providers own their transport, authentication and
//! retries; the analysis engine owns validation.

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// A single structured-output request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub prompt: String,
    /// JSON schema the response must follow.
    pub response_schema: serde_json::Value,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Trait for model providers that can answer under a response schema.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send the request and return the model's raw JSON text.
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, LlmError>;

    /// Return the model name.
    fn model_name(&self) -> &str;

    /// Short provider identifier used in logs ("gemini", "openai", ...).
    fn provider_name(&self) -> &str;
}

/// A scripted provider for tests and dry runs.
///
/// Responses and failures are returned in queue order. Once the queue is
/// drained the fallback response (if any) is returned for every call.
pub struct MockLlmProvider {
    model: String,
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    requests: Mutex<Vec<StructuredRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A provider that answers every call with `text`.
    pub fn with_response(text: impl Into<String>) -> Self {
        Self {
            fallback: Some(text.into()),
            ..Self::new()
        }
    }

    /// Sleep before answering, to exercise call timeouts.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn queue_response(&self, text: impl Into<String>) {
        self.lock_script().push_back(Ok(text.into()));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.lock_script().push_back(Err(error));
    }

    /// A well-formed verdict document for scripting.
    pub fn verdict_json(verdict: &str, confidence: f64) -> String {
        serde_json::json!({
            "verdict": verdict,
            "confidence": confidence,
            "summary": "Scripted verdict",
            "reasoning": "The scripted provider classified this incident for testing purposes.",
            "risk_level": if verdict == "TRUE_POSITIVE" { "HIGH" } else { "N/A" },
            "indicators": ["scripted indicator"],
            "recommendations": ["scripted recommendation"],
            "false_positive_reasons": []
        })
        .to_string()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<StructuredRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<String, LlmError>>> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, LlmError> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.lock_script().pop_front();
        match scripted {
            Some(result) => result,
            None => self.fallback.clone().ok_or_else(|| LlmError::ApiRequest {
                message: "mock provider has no scripted response".to_string(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}
