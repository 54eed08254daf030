//! Evidence boundary: incident ingestion, content extraction and vendor
//! metadata rendering.
//!
//! The pipeline only reads what an external collaborator has already
//! materialised on disk. It never authenticates against the vendor and never
//! inspects raw bytes of non-text formats.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::types::Incident;

/// Name of the vendor record inside each incident directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Extensions read directly as UTF-8 text.
pub const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "js", "json", "xml", "csv", "log", "yaml", "yml", "sql",
];

/// Plain text extracted from one evidence file.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceContent {
    pub file_name: String,
    /// Extracted text, or an `[unreadable: reason]` placeholder.
    pub text: String,
}

impl EvidenceContent {
    pub fn new(file_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            text: text.into(),
        }
    }

    pub fn is_unreadable(&self) -> bool {
        self.text.starts_with("[unreadable:")
    }
}

/// Maps an evidence file to text, whatever its format.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    /// Never fails: problems become an `[unreadable: reason]` placeholder.
    async fn extract(&self, path: &Path) -> EvidenceContent;
}

/// Reads text-like files and describes everything else with a placeholder.
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor;

fn format_label(extension: &str) -> String {
    match extension {
        "pdf" => "pdf document".to_string(),
        "doc" | "docx" => "word document".to_string(),
        "xls" | "xlsx" => "spreadsheet".to_string(),
        "png" | "jpg" | "jpeg" | "gif" | "bmp" => "image".to_string(),
        "" => "binary file".to_string(),
        other => format!("binary .{other} file"),
    }
}

#[async_trait]
impl ContentExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> EvidenceContent {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        if !TEXT_EXTENSIONS.contains(&extension.as_str()) {
            let text = format!(
                "[unreadable: {} {file_name} requires external extraction]",
                format_label(&extension)
            );
            return EvidenceContent { file_name, text };
        }

        match tokio::fs::read(path).await {
            Ok(bytes) => {
                debug!(file = %file_name, bytes = bytes.len(), "Evidence text extracted");
                let text = String::from_utf8_lossy(&bytes).into_owned();
                EvidenceContent { file_name, text }
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to read evidence file");
                let text = format!("[unreadable: cannot read {file_name}: {e}]");
                EvidenceContent { file_name, text }
            }
        }
    }
}

/// Key fields of the vendor record, as shown to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentMetadata {
    pub source: String,
    pub user: String,
    pub policy: String,
    pub severity: String,
    pub risk_score: String,
    pub action: String,
    pub destination: String,
    pub file: String,
}

const UNKNOWN: &str = "unknown";

/// Scalar at the first path that has one, rendered as text.
fn text_at(value: &Value, paths: &[&[&str]]) -> Option<String> {
    paths.iter().find_map(|path| {
        let leaf = path.iter().try_fold(value, |node, key| node.get(key))?;
        match leaf {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    })
}

impl IncidentMetadata {
    /// Pull the rendered fields out of a nested vendor record.
    /// Anything missing renders as `unknown`.
    pub fn from_vendor(vendor: &Value) -> Self {
        let get = |paths: &[&[&str]]| text_at(vendor, paths).unwrap_or_else(|| UNKNOWN.to_string());
        Self {
            source: get(&[
                &["event_details", "start_event", "source", "location"],
                &["source", "location"],
            ]),
            user: get(&[&["user", "email"], &["user", "id"]]),
            policy: get(&[&["policy", "name"]]),
            severity: get(&[&["policy", "severity"], &["severity"]]),
            risk_score: text_at(vendor, &[&["risk_score"]])
                .map(|score| format!("{score}/10"))
                .unwrap_or_else(|| UNKNOWN.to_string()),
            action: get(&[&["event_details", "start_event", "action", "kind"]]),
            destination: get(&[
                &["event_details", "end_event", "destination", "location"],
                &["event_details", "start_event", "destination", "location"],
                &["destination", "location"],
            ]),
            file: get(&[
                &["event_details", "start_event", "source", "file", "name"],
                &["file", "name"],
            ]),
        }
    }

    /// Labelled fields in display order.
    pub fn fields(&self) -> [(&'static str, &str); 8] {
        [
            ("Source", self.source.as_str()),
            ("User", self.user.as_str()),
            ("Policy", self.policy.as_str()),
            ("Severity", self.severity.as_str()),
            ("Risk score", self.risk_score.as_str()),
            ("Action", self.action.as_str()),
            ("Destination", self.destination.as_str()),
            ("File", self.file.as_str()),
        ]
    }

    pub fn user_if_known(&self) -> Option<&str> {
        (self.user != UNKNOWN).then_some(self.user.as_str())
    }
}

/// Delivers new incidents from the evidence collaborator.
#[async_trait]
pub trait IncidentSource: Send + Sync {
    /// Incidents delivered at or after `since`.
    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<Incident>, SourceError>;

    fn describe(&self) -> String;
}

/// Reads `<root>/<incident_id>/metadata.json` plus at most one evidence file.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn load_incident(&self, dir: &Path, incident_id: &str) -> Result<Incident, SourceError> {
        let metadata_error = |message: String| SourceError::Metadata {
            incident_id: incident_id.to_string(),
            message,
        };

        let raw = tokio::fs::read_to_string(dir.join(METADATA_FILE))
            .await
            .map_err(|e| metadata_error(e.to_string()))?;
        let vendor: Value =
            serde_json::from_str(&raw).map_err(|e| metadata_error(e.to_string()))?;

        let mut evidence: Vec<(PathBuf, u64)> = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| metadata_error(e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| metadata_error(e.to_string()))?
        {
            let path = entry.path();
            if path.file_name().is_some_and(|n| n == METADATA_FILE) {
                continue;
            }
            if let Ok(meta) = entry.metadata().await
                && meta.is_file()
            {
                evidence.push((path, meta.len()));
            }
        }
        evidence.sort();

        let mut incident = Incident::new(incident_id, vendor);
        if let Some(user) = IncidentMetadata::from_vendor(&incident.vendor_data).user_if_known() {
            incident = incident.with_user(user);
        }
        if let Some((path, size)) = evidence.into_iter().next() {
            incident = incident.with_file(path, Some(size));
        }
        Ok(incident)
    }
}

#[async_trait]
impl IncidentSource for DirectorySource {
    async fn fetch_recent(&self, since: DateTime<Utc>) -> Result<Vec<Incident>, SourceError> {
        let unavailable = |e: std::io::Error| SourceError::Unavailable {
            path: self.root.clone(),
            message: e.to_string(),
        };

        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(unavailable)?;
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let path = entry.path();
            let Ok(meta) = tokio::fs::metadata(path.join(METADATA_FILE)).await else {
                continue;
            };
            let delivered: DateTime<Utc> = match meta.modified() {
                Ok(time) => time.into(),
                Err(_) => Utc::now(),
            };
            if delivered >= since {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut incidents = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let Some(incident_id) = dir.file_name().map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };
            match self.load_incident(&dir, &incident_id).await {
                Ok(incident) => incidents.push(incident),
                Err(e) => warn!(incident_id = %incident_id, error = %e, "Skipping incident"),
            }
        }

        info!(root = %self.root.display(), found = incidents.len(), "Evidence directory scanned");
        Ok(incidents)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}
