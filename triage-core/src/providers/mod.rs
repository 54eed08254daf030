//! Model provider implementations.
//!
//! Provides concrete implementations of the `LlmProvider` trait for:
//! - Google Gemini (`generateContent` with `responseSchema`)
//! - OpenAI-compatible chat completions (`response_format: json_schema`)
//!
//! Use `create_provider()` to instantiate the appropriate provider based on config.

pub mod gemini;
pub mod openai_compat;

use crate::brain::LlmProvider;
use crate::config::{LlmConfig, RetryConfig};
use crate::error::LlmError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatibleProvider;

/// Execute an async operation with exponential backoff retry on transient errors.
///
/// Retries on `LlmError::RateLimited` (respects `retry_after_secs`),
/// `LlmError::Connection` and `LlmError::Timeout`. Permanent errors (auth,
/// parse, bad request) return immediately.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, LlmError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) if !is_retryable(&e) || attempt >= config.max_retries => return Err(e),
            Err(e) => {
                let backoff_ms = compute_backoff(config, attempt, &e);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = config.max_retries,
                    backoff_ms,
                    error = %e,
                    "Retrying model call after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                attempt += 1;
            }
        }
    }
}

fn is_retryable(err: &LlmError) -> bool {
    matches!(
        err,
        LlmError::RateLimited { .. } | LlmError::Connection { .. } | LlmError::Timeout { .. }
    )
}

/// Backoff delay. A rate limit's retry-after is honoured up to `max_backoff_ms`.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &LlmError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let LlmError::RateLimited { retry_after_secs } = err {
        let requested = retry_after_secs
            .saturating_mul(1000)
            .min(config.max_backoff_ms);
        return requested.max(computed);
    }
    computed
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        capped + (capped as f64 * 0.25 * jitter_fraction()) as u64
    } else {
        capped
    }
}

/// Cheap value in `[0, 1)` from the clock's sub-second nanos.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

/// Read the API key from the environment variable named in the config.
pub fn resolve_api_key(config: &LlmConfig) -> Result<String, LlmError> {
    std::env::var(&config.api_key_env)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| LlmError::AuthFailed {
            provider: format!(
                "{} (env var '{}' not set)",
                config.provider, config.api_key_env
            ),
        })
}

/// Map a transport-level reqwest failure to an `LlmError`.
pub(crate) fn map_send_error(provider: &str, err: reqwest::Error, timeout_secs: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { timeout_secs }
    } else if err.is_connect() {
        LlmError::Connection {
            message: format!("Cannot reach {provider} API: {err}"),
        }
    } else {
        LlmError::ApiRequest {
            message: format!("Request to {provider} API failed: {err}"),
        }
    }
}

/// Parse a `Retry-After` header value in seconds, defaulting to 30.
pub(crate) fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> u64 {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(30)
}

/// Create a model provider with an explicitly provided API key.
pub fn create_provider_with_key(
    config: &LlmConfig,
    api_key: String,
) -> Result<Arc<dyn LlmProvider>, LlmError> {
    match config.provider.as_str() {
        "gemini" => Ok(Arc::new(GeminiProvider::new_with_key(config, api_key)?)),
        "openai" | "openai_compat" | "azure" | "ollama" => Ok(Arc::new(
            OpenAiCompatibleProvider::new_with_key(config, api_key)?,
        )),
        other => Err(LlmError::UnsupportedProvider {
            provider: other.to_string(),
        }),
    }
}

/// Create a model provider based on the configuration.
///
/// Routes `"gemini"` to `GeminiProvider` and `"openai"` (plus its aliases)
/// to `OpenAiCompatibleProvider`. Anything else is `UnsupportedProvider`.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let api_key = resolve_api_key(config)?;
    create_provider_with_key(config, api_key)
}
