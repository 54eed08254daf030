//! Google Gemini API provider implementation.
//!
//! Uses `generateContent` with `responseMimeType: application/json` and a
//! `responseSchema`, so the model is constrained to the verdict document.
//!
//! Key differences from OpenAI-compatible APIs:
//! - Auth via the `x-goog-api-key` header
//! - Structured output is configured in `generationConfig`
//! - The schema dialect is an OpenAPI subset; unsupported keywords are stripped

use crate::brain::{LlmProvider, StructuredRequest};
use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use crate::providers::{map_send_error, retry_after_secs, with_retry};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// The default Google Gemini API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini API provider.
pub struct GeminiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl GeminiProvider {
    /// Create a new Gemini provider from configuration.
    ///
    /// Reads the API key from the environment variable specified in `config.api_key_env`.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = crate::providers::resolve_api_key(config)?;
        Self::new_with_key(config, api_key)
    }

    /// Create a new Gemini provider with an explicitly provided API key.
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

    fn endpoint_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn build_request_body(request: &StructuredRequest) -> Value {
        json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": request.prompt}]
            }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_output_tokens,
                "responseMimeType": "application/json",
                "responseSchema": Self::sanitize_schema(&request.response_schema)
            }
        })
    }

    /// Strip JSON-schema keywords the Gemini schema dialect rejects.
    fn sanitize_schema(schema: &Value) -> Value {
        const ALLOWED_KEYS: &[&str] = &[
            "type",
            "description",
            "properties",
            "required",
            "enum",
            "items",
            "format",
            "nullable",
        ];

        match schema {
            Value::Object(map) => {
                let mut clean = serde_json::Map::new();
                for (key, value) in map {
                    if !ALLOWED_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    let cleaned_value = match (key.as_str(), value) {
                        ("properties", Value::Object(props)) => Value::Object(
                            props
                                .iter()
                                .map(|(k, v)| (k.clone(), Self::sanitize_schema(v)))
                                .collect(),
                        ),
                        ("items", _) => Self::sanitize_schema(value),
                        _ => value.clone(),
                    };
                    clean.insert(key.clone(), cleaned_value);
                }
                Value::Object(clean)
            }
            other => other.clone(),
        }
    }

    /// Concatenated text parts of the first candidate.
    fn parse_response(body: &Value) -> Result<String, LlmError> {
        if let Some(reason) = body["promptFeedback"]["blockReason"].as_str() {
            return Err(LlmError::ApiRequest {
                message: format!("Gemini blocked the prompt: {reason}"),
            });
        }

        let candidate = body["candidates"]
            .as_array()
            .and_then(|c| c.first())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Missing or empty 'candidates' array in response".to_string(),
            })?;

        let parts = candidate["content"]["parts"]
            .as_array()
            .ok_or_else(|| LlmError::ResponseParse {
                message: format!(
                    "Missing 'parts' in candidate (finishReason: {})",
                    candidate["finishReason"].as_str().unwrap_or("unknown")
                ),
            })?;

        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();

        if text.trim().is_empty() {
            return Err(LlmError::ResponseParse {
                message: "Candidate contained no text".to_string(),
            });
        }
        Ok(text)
    }

    /// Map an HTTP status code to the appropriate `LlmError`.
    fn map_http_error(status: reqwest::StatusCode, retry_after: u64, body_text: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::AuthFailed {
                provider: "Gemini".to_string(),
            },
            429 => LlmError::RateLimited {
                retry_after_secs: retry_after,
            },
            500..=599 => LlmError::Connection {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {} from Gemini API: {}", status, body_text),
            },
        }
    }

    async fn send_once(&self, url: &str, body: &Value) -> Result<String, LlmError> {
        let response = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| map_send_error("Gemini", e, self.timeout_secs))?;

        let status = response.status();
        let retry_after = retry_after_secs(response.headers());
        let body_text = response.text().await.map_err(|e| LlmError::ResponseParse {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, retry_after, &body_text));
        }

        let response_json: Value =
            serde_json::from_str(&body_text).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON in response: {}", e),
            })?;

        Self::parse_response(&response_json)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate_structured(&self, request: StructuredRequest) -> Result<String, LlmError> {
        let body = Self::build_request_body(&request);
        let url = self.endpoint_url();

        debug!(
            model = self.model.as_str(),
            prompt_chars = request.prompt.chars().count(),
            "Sending Gemini structured request"
        );

        with_retry(&self.retry, || self.send_once(&url, &body)).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_provider() -> GeminiProvider {
        GeminiProvider::new_with_key(&LlmConfig::default(), "test-gemini-key".to_string()).unwrap()
    }

    fn request() -> StructuredRequest {
        StructuredRequest {
            prompt: "Classify this incident".into(),
            response_schema: json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "verdict": {"type": "string", "enum": ["TRUE_POSITIVE"], "minLength": 1},
                    "indicators": {"type": "array", "items": {"type": "string", "pattern": ".*"}}
                },
                "required": ["verdict"]
            }),
            temperature: 1.0,
            max_output_tokens: 1024,
        }
    }

    #[test]
    fn test_new_with_key_defaults() {
        let provider = make_provider();
        assert_eq!(provider.api_key, "test-gemini-key");
        assert_eq!(provider.model, "gemini-2.5-pro");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
        assert_eq!(provider.provider_name(), "gemini");
    }

    #[test]
    fn test_custom_base_url_trailing_slash() {
        let config = LlmConfig {
            base_url: Some("https://proxy.example.com/v1beta/".into()),
            ..LlmConfig::default()
        };
        let provider = GeminiProvider::new_with_key(&config, "k".into()).unwrap();
        assert_eq!(
            provider.endpoint_url(),
            "https://proxy.example.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
    }

    #[test]
    fn test_build_request_body() {
        let body = GeminiProvider::build_request_body(&request());
        assert_eq!(body["contents"][0]["parts"][0]["text"], "Classify this incident");
        let generation = &body["generationConfig"];
        assert_eq!(generation["responseMimeType"], "application/json");
        assert_eq!(generation["temperature"], 1.0);
        assert_eq!(generation["maxOutputTokens"], 1024);

        let schema = &generation["responseSchema"];
        assert!(schema.get("additionalProperties").is_none());
        assert!(schema["properties"]["verdict"].get("minLength").is_none());
        assert!(schema["properties"]["indicators"]["items"].get("pattern").is_none());
        assert_eq!(schema["required"], json!(["verdict"]));
    }

    #[test]
    fn test_parse_text_response() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"text": "{\"verdict\":"}, {"text": "\"FALSE_POSITIVE\"}"}]},
                "finishReason": "STOP"
            }]
        });
        assert_eq!(
            GeminiProvider::parse_response(&body).unwrap(),
            "{\"verdict\":\"FALSE_POSITIVE\"}"
        );
    }

    #[test]
    fn test_parse_empty_candidates() {
        let err = GeminiProvider::parse_response(&json!({"candidates": []})).unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
    }

    #[test]
    fn test_parse_missing_parts_reports_finish_reason() {
        let body = json!({"candidates": [{"content": {}, "finishReason": "MAX_TOKENS"}]});
        match GeminiProvider::parse_response(&body) {
            Err(LlmError::ResponseParse { message }) => assert!(message.contains("MAX_TOKENS")),
            other => panic!("Expected ResponseParse, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_blocked_prompt() {
        let body = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = GeminiProvider::parse_response(&body).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_http_error_mapping() {
        let err = GeminiProvider::map_http_error(reqwest::StatusCode::UNAUTHORIZED, 30, "bad key");
        assert!(matches!(err, LlmError::AuthFailed { .. }));

        let err = GeminiProvider::map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, 12, "");
        match err {
            LlmError::RateLimited { retry_after_secs } => assert_eq!(retry_after_secs, 12),
            other => panic!("Expected RateLimited, got {:?}", other),
        }

        let err = GeminiProvider::map_http_error(reqwest::StatusCode::SERVICE_UNAVAILABLE, 30, "");
        assert!(matches!(err, LlmError::Connection { .. }));

        let err = GeminiProvider::map_http_error(reqwest::StatusCode::BAD_REQUEST, 30, "schema");
        match err {
            LlmError::ApiRequest { message } => assert!(message.contains("400")),
            other => panic!("Expected ApiRequest, got {:?}", other),
        }
    }
}
