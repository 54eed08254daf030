//! Prompt composition.
//!
//! A prompt is an ordered list of named sections joined once at the end:
//! instructions, prior corrections (only when there are any), incident
//! metadata, evidence, and the closing directive.

use crate::evidence::{EvidenceContent, IncidentMetadata};
use crate::types::RetrievedFeedback;

/// Default character budget for evidentiary content.
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 50_000;

pub const SECTION_INSTRUCTIONS: &str = "instructions";
pub const SECTION_PRIOR_CORRECTIONS: &str = "prior_corrections";
pub const SECTION_METADATA: &str = "incident_metadata";
pub const SECTION_EVIDENCE: &str = "evidence";
pub const SECTION_DIRECTIVE: &str = "directive";

pub const PRIOR_CORRECTIONS_HEADING: &str = "PRIOR ANALYST CORRECTIONS";
pub const NO_FILE_MARKER: &str =
    "NO ATTACHED FILE - classify from metadata only.";

const RULE: &str =
    "================================================================================";

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSection {
    pub name: &'static str,
    pub body: String,
}

/// Ordered prompt sections.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, name: &'static str, body: impl Into<String>) -> Self {
        self.sections.push(PromptSection {
            name,
            body: body.into(),
        });
        self
    }

    pub fn section_names(&self) -> Vec<&'static str> {
        self.sections.iter().map(|s| s.name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.body.as_str())
    }

    pub fn build(&self) -> String {
        self.sections
            .iter()
            .map(|s| s.body.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Keep at most `max_chars` leading characters.
/// Returns the kept prefix and whether anything was dropped.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

/// Builds model requests from instructions, feedback context and one incident.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    max_content_chars: usize,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self {
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
        }
    }
}

impl PromptComposer {
    pub fn new(max_content_chars: usize) -> Self {
        Self { max_content_chars }
    }

    pub fn compose(
        &self,
        system_instructions: &str,
        retrieved: &[RetrievedFeedback],
        metadata: &IncidentMetadata,
        content: Option<&EvidenceContent>,
    ) -> String {
        self.sections(system_instructions, retrieved, metadata, content)
            .build()
    }

    pub fn sections(
        &self,
        system_instructions: &str,
        retrieved: &[RetrievedFeedback],
        metadata: &IncidentMetadata,
        content: Option<&EvidenceContent>,
    ) -> PromptBuilder {
        let mut builder = PromptBuilder::new().section(SECTION_INSTRUCTIONS, system_instructions);
        if !retrieved.is_empty() {
            builder = builder.section(SECTION_PRIOR_CORRECTIONS, render_corrections(retrieved));
        }
        builder
            .section(SECTION_METADATA, render_metadata(metadata))
            .section(SECTION_EVIDENCE, self.render_evidence(content))
            .section(
                SECTION_DIRECTIVE,
                "Produce your analysis now as a single JSON object matching the response schema.",
            )
    }

    fn render_evidence(&self, content: Option<&EvidenceContent>) -> String {
        let Some(content) = content else {
            return NO_FILE_MARKER.to_string();
        };
        let (kept, truncated) = truncate_chars(&content.text, self.max_content_chars);
        let mut out = format!("FILE CONTENT: {}\n{RULE}\n{kept}\n{RULE}", content.file_name);
        if truncated {
            out.push_str(&format!(
                "\n[content truncated to the first {} characters]",
                self.max_content_chars
            ));
        }
        out
    }
}

fn render_corrections(retrieved: &[RetrievedFeedback]) -> String {
    let mut out = format!(
        "{RULE}\n{PRIOR_CORRECTIONS_HEADING}\n{RULE}\n\
         Analysts reviewed these earlier verdicts of yours. Learn from them and \
         do not repeat a classification error they corrected.\n"
    );
    for (idx, item) in retrieved.iter().enumerate() {
        let fb = &item.feedback;
        let file = match (&item.file_name, &item.file_type) {
            (Some(name), Some(kind)) => format!("{name} ({kind})"),
            (Some(name), None) => name.clone(),
            _ => format!("incident {} (no file)", fb.incident_id),
        };
        out.push_str(&format!("\n### Case {}: {file}\n", idx + 1));
        out.push_str(&format!("Your original verdict: {}\n", fb.original_verdict));
        out.push_str(&format!("Correct verdict: {}\n", fb.corrected_verdict));
        out.push_str(&format!("Analyst comment: {}\n", fb.analyst_comment));
        if let Some(reasoning) = item.original_reasoning.as_deref().filter(|r| !r.is_empty()) {
            out.push_str(&format!("Your original reasoning: {reasoning}\n"));
        }
        if fb.is_correction() {
            out.push_str("Do not repeat this classification error.\n");
        } else {
            out.push_str("The analyst confirmed this classification.\n");
        }
    }
    out
}

fn render_metadata(metadata: &IncidentMetadata) -> String {
    let mut out = format!("{RULE}\nINCIDENT METADATA\n{RULE}\n");
    for (label, value) in metadata.fields() {
        out.push_str(&format!("{label}: {value}\n"));
    }
    out
}
