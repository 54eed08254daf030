//! Error types for the triage pipeline.
//!
//! Uses `thiserror` for public API error types with one structured enum per
//! domain: persistence, model transport, analysis, feedback, configuration,
//! scheduling and evidence ingestion.

use std::path::PathBuf;

/// Top-level error type for the triage core library.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Feedback error: {0}")]
    Feedback(#[from] FeedbackError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Evidence source error: {0}")]
    Source(#[from] SourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the SQLite state store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Persistence failure during {operation}: {message}")]
    Persistence { operation: String, message: String },

    #[error("Stored row could not be decoded: {message}")]
    Corrupt { message: String },

    #[error("Store task failed to complete: {message}")]
    TaskJoin { message: String },
}

impl StoreError {
    pub(crate) fn persistence(operation: &str, err: impl std::fmt::Display) -> Self {
        StoreError::Persistence {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors from model provider interactions (the transport class).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },

    #[error("Unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },
}

/// Errors from analysing one incident.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The model answered, but not in the contracted shape.
    #[error("Model output rejected: {message}")]
    Schema { message: String },

    /// The model call itself failed.
    #[error("Model call failed: {0}")]
    Transport(#[from] LlmError),

    /// Nothing to classify: no content and no metadata.
    #[error("Unusable input: {message}")]
    Input { message: String },

    /// Another caller is analysing this incident right now.
    #[error("Incident {incident_id} is already being analysed")]
    Busy { incident_id: String },

    #[error("Could not persist analysis: {0}")]
    Persistence(#[from] StoreError),
}

impl AnalysisError {
    /// Stable short class name used as the `error_class` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::Schema { .. } => "schema",
            AnalysisError::Transport(_) => "transport",
            AnalysisError::Input { .. } => "input",
            AnalysisError::Busy { .. } => "busy",
            AnalysisError::Persistence(_) => "persistence",
        }
    }
}

/// Errors from recording analyst feedback.
#[derive(Debug, thiserror::Error)]
pub enum FeedbackError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Incident not found: {incident_id}")]
    UnknownIncident { incident_id: String },

    #[error("Incident {incident_id} has no analysis to review")]
    NoAnalysis { incident_id: String },

    #[error("Could not persist feedback: {0}")]
    Persistence(#[from] StoreError),
}

impl FeedbackError {
    pub fn kind(&self) -> &'static str {
        match self {
            FeedbackError::Validation { .. } => "validation",
            FeedbackError::UnknownIncident { .. } | FeedbackError::NoAnalysis { .. } => "input",
            FeedbackError::Persistence(_) => "persistence",
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("System prompt not found: {path}")]
    PromptNotFound { path: PathBuf },
}

/// Errors from the job scheduler.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression '{expression}': {message}")]
    InvalidCronExpression { expression: String, message: String },

    #[error("Job '{job}' failed: {message}")]
    JobFailed { job: String, message: String },

    #[error("Pipeline initialization failed: {message}")]
    Initialization { message: String },
}

/// Errors from the evidence ingestion boundary.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Evidence directory unavailable: {path}: {message}")]
    Unavailable { path: PathBuf, message: String },

    #[error("Malformed metadata for incident {incident_id}: {message}")]
    Metadata {
        incident_id: String,
        message: String,
    },
}

/// A type alias for results using the top-level `TriageError`.
pub type Result<T> = std::result::Result<T, TriageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_store() {
        let err = TriageError::Store(StoreError::Persistence {
            operation: "put_incident".into(),
            message: "disk I/O error".into(),
        });
        assert_eq!(
            err.to_string(),
            "Store error: Persistence failure during put_incident: disk I/O error"
        );
    }

    #[test]
    fn test_error_display_analysis_schema() {
        let err = AnalysisError::Schema {
            message: "missing field `reasoning`".into(),
        };
        assert_eq!(
            err.to_string(),
            "Model output rejected: missing field `reasoning`"
        );
        assert_eq!(err.kind(), "schema");
    }

    #[test]
    fn test_transport_error_from_llm() {
        let err: AnalysisError = LlmError::Timeout { timeout_secs: 60 }.into();
        assert!(matches!(err, AnalysisError::Transport(_)));
        assert_eq!(err.kind(), "transport");
        assert_eq!(
            err.to_string(),
            "Model call failed: Request timed out after 60s"
        );
    }

    #[test]
    fn test_feedback_validation_kind() {
        let err = FeedbackError::Validation {
            field: "comment".into(),
            message: "must be at least 10 characters".into(),
        };
        assert_eq!(err.kind(), "validation");
        assert_eq!(
            err.to_string(),
            "Invalid comment: must be at least 10 characters"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TriageError = io_err.into();
        assert!(matches!(err, TriageError::Io(_)));
    }

    #[test]
    fn test_scheduler_error_display() {
        let err = SchedulerError::InvalidCronExpression {
            expression: "not a cron".into(),
            message: "bad field".into(),
        };
        assert!(err.to_string().contains("not a cron"));
    }
}
