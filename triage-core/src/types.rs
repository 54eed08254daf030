//! Core domain types: incidents, model analyses, analyst feedback and the
//! aggregate views the store computes over them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Classification outcome for one incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    TruePositive,
    FalsePositive,
    RequiresReview,
}

impl Verdict {
    pub const ALL: [Verdict; 3] = [
        Verdict::TruePositive,
        Verdict::FalsePositive,
        Verdict::RequiresReview,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::TruePositive => "TRUE_POSITIVE",
            Verdict::FalsePositive => "FALSE_POSITIVE",
            Verdict::RequiresReview => "REQUIRES_REVIEW",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "TRUE_POSITIVE" | "TP" => Ok(Verdict::TruePositive),
            "FALSE_POSITIVE" | "FP" => Ok(Verdict::FalsePositive),
            "REQUIRES_REVIEW" | "REVIEW" => Ok(Verdict::RequiresReview),
            other => Err(format!("unknown verdict '{other}'")),
        }
    }
}

/// Risk level reported alongside a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    #[default]
    #[serde(rename = "N/A")]
    NotApplicable,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Critical => write!(f, "CRITICAL"),
            RiskLevel::High => write!(f, "HIGH"),
            RiskLevel::Medium => write!(f, "MEDIUM"),
            RiskLevel::Low => write!(f, "LOW"),
            RiskLevel::NotApplicable => write!(f, "N/A"),
        }
    }
}

/// Lifecycle status of an incident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    #[default]
    Pending,
    Analyzed,
    Error,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Pending => "pending",
            IncidentStatus::Analyzed => "analyzed",
            IncidentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(IncidentStatus::Pending),
            "analyzed" => Ok(IncidentStatus::Analyzed),
            "error" => Ok(IncidentStatus::Error),
            other => Err(format!("unknown incident status '{other}'")),
        }
    }
}

/// One reported DLP event under triage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Evidence already materialised on disk by the ingestion collaborator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    /// Opaque vendor record, stored verbatim.
    #[serde(default)]
    pub vendor_data: serde_json::Value,
    pub status: IncidentStatus,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    /// A metadata-only pending incident created now.
    pub fn new(incident_id: impl Into<String>, vendor_data: serde_json::Value) -> Self {
        Self {
            incident_id: incident_id.into(),
            file_name: None,
            file_path: None,
            file_type: None,
            file_size: None,
            user_email: None,
            vendor_data,
            status: IncidentStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Attach an evidence file; name and type are derived from the path.
    pub fn with_file(mut self, path: impl Into<PathBuf>, size: Option<u64>) -> Self {
        let path = path.into();
        self.file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.file_type = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());
        self.file_size = size;
        self.file_path = Some(path);
        self
    }

    pub fn with_user(mut self, user_email: impl Into<String>) -> Self {
        self.user_email = Some(user_email.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn has_file(&self) -> bool {
        self.file_path.is_some()
    }
}

/// An analysis about to be written. The store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAnalysis {
    pub incident_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub reasoning: String,
    pub raw_response: String,
    pub processing_time_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// One persisted model verdict for one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub id: i64,
    pub incident_id: String,
    pub verdict: Verdict,
    pub confidence: f64,
    pub reasoning: String,
    /// Full model output, kept for audit and replay.
    pub raw_response: String,
    pub processing_time_secs: f64,
    pub created_at: DateTime<Utc>,
}

/// How instructive a feedback item is for future prompts.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct RelevanceScore(f64);

impl RelevanceScore {
    pub const HIGH: RelevanceScore = RelevanceScore(1.0);
    pub const MEDIUM: RelevanceScore = RelevanceScore(0.7);
    pub const LOW: RelevanceScore = RelevanceScore(0.3);

    /// Any finite value in `[0, 1]`.
    pub fn new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..=1.0).contains(&value)).then_some(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for RelevanceScore {
    fn default() -> Self {
        Self::HIGH
    }
}

impl TryFrom<f64> for RelevanceScore {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| format!("relevance score {value} is outside [0, 1]"))
    }
}

impl From<RelevanceScore> for f64 {
    fn from(score: RelevanceScore) -> Self {
        score.0
    }
}

impl FromStr for RelevanceScore {
    type Err = String;

    /// Accepts the named tiers (`high`, `medium`, `low`) or a number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "1" => Ok(Self::HIGH),
            "medium" | "2" => Ok(Self::MEDIUM),
            "low" | "3" => Ok(Self::LOW),
            other => other
                .parse::<f64>()
                .map_err(|_| format!("invalid relevance '{other}'"))
                .and_then(RelevanceScore::try_from),
        }
    }
}

/// Feedback about to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFeedback {
    pub incident_id: String,
    pub analysis_id: i64,
    pub original_verdict: Verdict,
    pub corrected_verdict: Verdict,
    pub analyst_comment: String,
    pub relevance_score: RelevanceScore,
    pub created_at: DateTime<Utc>,
}

/// One analyst confirmation or correction of a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: i64,
    pub incident_id: String,
    pub analysis_id: i64,
    pub original_verdict: Verdict,
    pub corrected_verdict: Verdict,
    pub analyst_comment: String,
    pub relevance_score: RelevanceScore,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    /// Whether the analyst disagreed with the model.
    pub fn is_correction(&self) -> bool {
        self.original_verdict != self.corrected_verdict
    }
}

/// Feedback joined with the context needed to render it into a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedFeedback {
    pub feedback: Feedback,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_reasoning: Option<String>,
}

/// Store-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub incidents_by_status: BTreeMap<String, u64>,
    pub total_analyses: u64,
    pub total_feedback: u64,
    /// Share of feedback where the analyst confirmed the model, in `[0, 1]`.
    pub accuracy: f64,
    pub mean_relevance: f64,
}

impl AggregateStats {
    pub fn count_for(&self, status: IncidentStatus) -> u64 {
        self.incidents_by_status
            .get(status.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn total_incidents(&self) -> u64 {
        self.incidents_by_status.values().sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub total_feedback: u64,
    pub corrections: u64,
}

/// Rows removed by one retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCounts {
    pub incidents: usize,
    pub analyses: usize,
    pub feedback: usize,
}

impl std::fmt::Display for PurgeCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} incidents, {} analyses, {} feedback",
            self.incidents, self.analyses, self.feedback
        )
    }
}
