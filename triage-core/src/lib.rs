//! # Triage Core
//!
//! Core library for LLM-assisted triage of DLP incidents.
//! Provides the SQLite state store, feedback retrieval, prompt composition,
//! model providers, the analysis engine, analyst feedback recording and the
//! job scheduler that runs it all unattended.

pub mod analysis;
pub mod brain;
pub mod config;
pub mod error;
pub mod evidence;
pub mod feedback;
pub mod processor;
pub mod prompt;
pub mod providers;
pub mod retriever;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use analysis::{AnalysisEngine, AnalysisResult, ModelVerdict, decode_model_output, response_schema};
pub use brain::{LlmProvider, MockLlmProvider, StructuredRequest};
pub use config::{TriageConfig, load_config};
pub use error::{
    AnalysisError, ConfigError, FeedbackError, LlmError, Result, SchedulerError, SourceError,
    StoreError, TriageError,
};
pub use evidence::{
    ContentExtractor, DirectorySource, EvidenceContent, IncidentMetadata, IncidentSource,
    PlainTextExtractor,
};
pub use feedback::{FeedbackRecorder, RecordedFeedback};
pub use processor::{CycleReport, IncidentProcessor};
pub use prompt::{PromptBuilder, PromptComposer};
pub use retriever::FeedbackRetriever;
pub use scheduler::{HealthReport, JobKind, TriageScheduler};
pub use store::StateStore;
pub use types::{
    AggregateStats, Analysis, Feedback, FeedbackStats, Incident, IncidentStatus, NewAnalysis,
    NewFeedback, PurgeCounts, RelevanceScore, RetrievedFeedback, RiskLevel, Verdict,
};
