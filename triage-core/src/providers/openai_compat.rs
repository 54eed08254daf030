//! OpenAI-compatible provider.
//!
//! Supports OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any endpoint
//! that follows the chat completions API with `response_format: json_schema`.

use crate::brain::{LlmProvider, StructuredRequest};
use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::providers::{map_send_error, retry_after_secs, with_retry};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Name given to the response schema in `response_format`.
const SCHEMA_NAME: &str = "incident_verdict";

pub struct OpenAiCompatibleProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = crate::providers::resolve_api_key(config)?;
        Self::new_with_key(config, api_key)
    }

    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, LlmError> {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LlmError::Connection {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            timeout_secs: config.timeout_secs,
            retry: config.retry.clone(),
        })
    }

    fn build_request_body(&self, request: &StructuredRequest) -> Value {
        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_output_tokens,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": SCHEMA_NAME,
                    "schema": request.response_schema,
                    "strict": false
                }
            }
        })
    }

    fn parse_response(body: &Value) -> Result<String, LlmError> {
        let message = &body["choices"][0]["message"];
        if let Some(refusal) = message["refusal"].as_str() {
            return Err(LlmError::ApiRequest {
                message: format!("Model refused: {refusal}"),
            });
        }
        message["content"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing 'choices[0].message.content' in response".to_string(),
            })
    }

    fn map_http_error(status: reqwest::StatusCode, retry_after: u64, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => {
                debug!(body = %body, "Authentication failed");
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => LlmError::RateLimited {
                retry_after_secs: retry_after,
            },
            500..=599 => LlmError::Connection {
                message: format!("HTTP {}: {}", status, body),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }

    async fn send_once(&self, body: &Value) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error("OpenAI-compatible", e, self.timeout_secs))?;

        let status = response.status();
        let retry_after = retry_after_secs(response.headers());
        let body_text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &body_text));
        }

        let json: Value = serde_json::from_str(&body_text).map_err(|e| LlmError::ResponseParse {
            message: format!("Invalid JSON in response: {}", e),
        })?;
        Self::parse_response(&json)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, LlmError> {
        let body = self.build_request_body(&request);
        debug!(
            model = self.model.as_str(),
            base_url = self.base_url.as_str(),
            "Sending structured chat completion"
        );
        with_retry(&self.retry, || self.send_once(&body)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "openai"
    }
}
