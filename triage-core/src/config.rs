//! Configuration for the triage pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> legacy flat environment variables -> `TRIAGE_`
//! prefixed environment variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Built-in analyst instructions, used unless `analysis.prompt_path` is set.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../prompts/system_prompt.md");

/// Flat variable names understood by older deployments, and the keys they set.
const LEGACY_ENV_KEYS: &[(&str, &str)] = &[
    ("SCAN_INTERVAL_MINUTES", "scheduler.scan_interval_minutes"),
    ("HOURS_BACK", "scheduler.lookback_hours"),
    ("MAX_ANALYSIS_PER_CYCLE", "scheduler.max_analyses_per_cycle"),
    ("CLEANUP_DAYS", "scheduler.retention_days"),
    ("GEMINI_MODEL", "llm.model"),
    ("RAG_LIMIT", "analysis.retrieval_limit"),
    ("INCIDENTS_DB_PATH", "database.path"),
    ("EVIDENCE_DIR", "evidence.incidents_dir"),
];

/// Top-level configuration for the triage service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub analysis: AnalysisConfig,
    pub scheduler: SchedulerConfig,
    pub evidence: EvidenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite file; parent directories are created on open.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/incidents.db"),
        }
    }
}

/// Model provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name: "gemini" or "openai" (any OpenAI-compatible endpoint).
    pub provider: String,
    /// Model identifier (e.g., "gemini-2.5-pro").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    pub base_url: Option<String>,
    /// Sampling temperature. Must be non-zero.
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Upper bound on a single model call, in seconds.
    pub timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: "gemini-2.5-pro".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            base_url: None,
            temperature: 1.0,
            max_output_tokens: 8192,
            timeout_secs: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Upper bound on one model call including every retry and backoff.
    pub fn call_budget(&self) -> std::time::Duration {
        let attempts = u64::from(self.retry.max_retries) + 1;
        let backoff_ms = self
            .retry
            .max_backoff_ms
            .saturating_mul(u64::from(self.retry.max_retries));
        std::time::Duration::from_secs(self.timeout_secs.saturating_mul(attempts))
            .saturating_add(std::time::Duration::from_millis(
                backoff_ms.saturating_add(backoff_ms / 4),
            ))
    }
}

/// Retry policy for transient model errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Add up to 25% random delay on top of the computed backoff.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Feedback items injected into each prompt.
    pub retrieval_limit: usize,
    /// Character budget for evidentiary content.
    pub max_content_chars: usize,
    pub use_feedback_context: bool,
    /// Replaces the built-in system prompt when set.
    pub prompt_path: Option<PathBuf>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            retrieval_limit: 5,
            max_content_chars: 50_000,
            use_feedback_context: true,
            prompt_path: None,
        }
    }
}

/// Job scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scan_interval_minutes: u64,
    /// Only pending incidents created within this window are picked up.
    pub lookback_hours: u64,
    pub max_analyses_per_cycle: usize,
    pub retention_days: u64,
    /// Cron expression (seconds field first) for the cleanup job.
    pub cleanup_schedule: String,
    pub health_interval_minutes: u64,
    /// Run one processing cycle immediately at startup.
    pub run_on_startup: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_minutes: 30,
            lookback_hours: 24,
            max_analyses_per_cycle: 10,
            retention_days: 30,
            cleanup_schedule: "0 0 3 * * * *".to_string(),
            health_interval_minutes: 5,
            run_on_startup: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Directory of `<incident_id>/metadata.json` folders to ingest each cycle.
    pub incidents_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Where the JSON log file goes. Defaults to the platform data directory.
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn resolved_log_dir(&self) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

impl TriageConfig {
    /// Check value ranges. All problems are reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let s = &self.scheduler;
        for (name, value) in [
            ("scheduler.scan_interval_minutes", s.scan_interval_minutes),
            ("scheduler.lookback_hours", s.lookback_hours),
            ("scheduler.retention_days", s.retention_days),
            ("scheduler.health_interval_minutes", s.health_interval_minutes),
            ("llm.timeout_secs", self.llm.timeout_secs),
        ] {
            if value == 0 {
                problems.push(format!("{name} must be greater than zero"));
            }
        }
        if s.max_analyses_per_cycle == 0 {
            problems.push("scheduler.max_analyses_per_cycle must be greater than zero".into());
        }
        if let Err(e) = crate::scheduler::parse_cron_expression(&s.cleanup_schedule) {
            problems.push(format!("scheduler.cleanup_schedule: {e}"));
        }

        if self.llm.model.trim().is_empty() {
            problems.push("llm.model must not be empty".into());
        }
        let t = self.llm.temperature;
        if !(t > 0.0 && t <= 2.0) {
            problems.push(format!("llm.temperature must be in (0, 2], got {t}"));
        }
        if self.llm.retry.backoff_multiplier < 1.0 {
            problems.push("llm.retry.backoff_multiplier must be at least 1.0".into());
        }

        if self.analysis.retrieval_limit == 0 {
            problems.push("analysis.retrieval_limit must be greater than zero".into());
        }
        if self.analysis.max_content_chars == 0 {
            problems.push("analysis.max_content_chars must be greater than zero".into());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                message: problems.join("; "),
            })
        }
    }

    /// Resolve the system instructions: the configured file, or the built-in prompt.
    pub fn load_system_prompt(&self) -> Result<String, ConfigError> {
        match &self.analysis.prompt_path {
            None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
            Some(path) => {
                if !path.is_file() {
                    return Err(ConfigError::PromptNotFound { path: path.clone() });
                }
                std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
                    message: format!("cannot read {}: {e}", path.display()),
                })
            }
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("io", "grc", "dlp-triage")
}

/// Path of the per-user config file, whether or not it exists.
pub fn user_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Dotted config key set by a legacy flat environment variable.
fn legacy_env_key(name: &str) -> Option<&'static str> {
    LEGACY_ENV_KEYS
        .iter()
        .find(|(var, _)| var.eq_ignore_ascii_case(name))
        .map(|(_, key)| *key)
}

/// Build the layered figment without extracting it.
///
/// Priority (highest to lowest):
/// 1. `TRIAGE_` prefixed variables (`TRIAGE_SCHEDULER__SCAN_INTERVAL_MINUTES`)
/// 2. Legacy flat variables (`SCAN_INTERVAL_MINUTES`, `GEMINI_MODEL`, ...)
/// 3. Explicit config file
/// 4. User config (`~/.config/dlp-triage/config.toml` on Linux)
/// 5. Built-in defaults
pub fn figment(explicit: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(TriageConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(user_config));
    }

    if let Some(path) = explicit {
        figment = figment.merge(Toml::file(path));
    }

    let legacy: Vec<&str> = LEGACY_ENV_KEYS.iter().map(|(var, _)| *var).collect();
    figment = figment.merge(
        Env::raw()
            .only(&legacy)
            .map(|key| legacy_env_key(key.as_str()).unwrap_or_default().into()),
    );

    figment.merge(Env::prefixed("TRIAGE_").split("__"))
}

/// Load and validate configuration from all layers.
pub fn load_config(explicit: Option<&Path>) -> Result<TriageConfig, ConfigError> {
    if let Some(path) = explicit
        && !path.is_file()
    {
        return Err(ConfigError::ParseError {
            message: format!("config file not found: {}", path.display()),
        });
    }
    extract(figment(explicit))
}

fn extract(figment: Figment) -> Result<TriageConfig, ConfigError> {
    let config: TriageConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
