//! Core data models used throughout the pipeline.
//!
//! These types describe the inputs (sources), the LLM-derived events, the
//! document written once per extraction run, and the rows pushed to the
//! remote table.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Business domain an input source belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Finance,
    Support,
    Operations,
    Product,
    Security,
    Hr,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Finance => "finance",
            Domain::Support => "support",
            Domain::Operations => "operations",
            Domain::Product => "product",
            Domain::Security => "security",
            Domain::Hr => "hr",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Domain {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "finance" => Ok(Domain::Finance),
            "support" => Ok(Domain::Support),
            "operations" => Ok(Domain::Operations),
            "product" => Ok(Domain::Product),
            "security" => Ok(Domain::Security),
            "hr" => Ok(Domain::Hr),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown domain '{}'",
                other
            ))),
        }
    }
}

/// File format of an input source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Csv,
    Xlsx,
    Json,
    Docx,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Csv => "csv",
            SourceType::Xlsx => "xlsx",
            SourceType::Json => "json",
            SourceType::Docx => "docx",
        }
    }

    /// Maps a file extension (case-insensitive) to a source type.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(SourceType::Csv),
            "xlsx" | "xlsm" | "xls" => Some(SourceType::Xlsx),
            "json" => Some(SourceType::Json),
            "docx" => Some(SourceType::Docx),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(SourceType::Csv),
            "xlsx" => Ok(SourceType::Xlsx),
            "json" => Ok(SourceType::Json),
            "docx" => Ok(SourceType::Docx),
            other => Err(PipelineError::UnsupportedType {
                path: String::new(),
                detail: format!("unknown type hint '{}'", other),
            }),
        }
    }
}

/// One raw input file feeding an extraction run.
///
/// Comes either from `[[pipeline.sources]]` in the config file or from
/// Drive discovery. `key` must be unique within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSource {
    pub key: String,
    pub domain: Domain,
    pub path: PathBuf,
    /// Explicit type hint; when absent the extension decides.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,
}

impl InputSource {
    /// Resolves the effective source type: explicit hint first, then extension.
    pub fn resolved_type(&self) -> Result<SourceType, PipelineError> {
        if let Some(t) = self.source_type {
            return Ok(t);
        }
        SourceType::from_extension(&self.path).ok_or_else(|| PipelineError::UnsupportedType {
            path: self.path.display().to_string(),
            detail: "no type hint and unrecognised extension".to_string(),
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A normalized event, as written to the extraction output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub source_key: String,
    pub domain: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorInfo {
    pub provider: String,
    pub model: String,
    pub pipeline: String,
}

/// Per-source summary recorded in [`ExtractionResult::source_runs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRun {
    pub source_key: String,
    pub domain: String,
    pub file_name: String,
    pub generated_event_count: usize,
    pub evidence_type: String,
}

/// The document written once per extraction run (full overwrite).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub generated_at: String,
    pub generator: GeneratorInfo,
    #[serde(default)]
    pub source_runs: Vec<SourceRun>,
    pub event_count: usize,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A row in the remote events table. `event_id` is the conflict key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub event_id: String,
    pub source_key: String,
    pub domain: String,
    pub title: String,
    pub summary: String,
    pub evidence: Vec<String>,
    pub created_at: String,
}

impl EventRow {
    pub fn from_event(event: &Event, created_at: &str) -> Self {
        Self {
            event_id: event.event_id.clone(),
            source_key: event.source_key.clone(),
            domain: event.domain.clone(),
            title: event.title.clone(),
            summary: event.summary.clone(),
            evidence: event.evidence.clone(),
            created_at: created_at.to_string(),
        }
    }
}

/// Returns `base`, or `base_2`, `base_3`, ... when `base` is already in
/// `seen`. The returned value is recorded in `seen`.
pub fn make_unique(base: String, seen: &mut HashSet<String>) -> String {
    if seen.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}_{}", base, n);
        if seen.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}
