//! Evidence digests: one bounded, LLM-ready summary per input file.
//!
//! [`build_evidence_digest`] dispatches on the source type:
//!
//! | Type | Digest | Bound |
//! |------|--------|-------|
//! | `csv`, `xlsx` | [`EvidenceDigest::TabularDatasetFactsSheet`] | 200 facts-sheet lines |
//! | `json` | [`EvidenceDigest::OpsItAlertStream`] | 30 breaches, 25 pressure samples |
//! | `docx` | [`EvidenceDigest::DocxReport`] | 14,000 characters |

use anyhow::{Context, Result};
use serde::Serialize;

use crate::alerts::{analyze_alert_stream, AlertAnalytics};
use crate::extract::docx_excerpt;
use crate::facts::{build_facts_sheet, ColumnMapping};
use crate::models::{InputSource, SourceType};
use crate::table::{load_csv, load_xlsx};

/// Maximum characters of DOCX text passed to the model.
pub const MAX_EXCERPT_CHARS: usize = 14_000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularSchema {
    pub columns: Vec<String>,
    pub mapped: ColumnMapping,
}

/// Serialized with a `type` tag, e.g. `{"type": "docx_report", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvidenceDigest {
    TabularDatasetFactsSheet {
        format: String,
        row_count: usize,
        schema: TabularSchema,
        facts_sheet_line_count: usize,
        facts_sheet: String,
        note: String,
    },
    DocxReport {
        excerpt: String,
        note: String,
    },
    OpsItAlertStream {
        analytics: AlertAnalytics,
        note: String,
    },
}

impl EvidenceDigest {
    /// The serialized `type` tag.
    pub fn evidence_type(&self) -> &'static str {
        match self {
            EvidenceDigest::TabularDatasetFactsSheet { .. } => "tabular_dataset_facts_sheet",
            EvidenceDigest::DocxReport { .. } => "docx_report",
            EvidenceDigest::OpsItAlertStream { .. } => "ops_it_alert_stream",
        }
    }
}

/// Builds the digest for one input source.
///
/// # Errors
///
/// Fails with [`crate::error::PipelineError::UnsupportedType`] when the type
/// cannot be resolved, and with an I/O or parse error (with context) when the
/// file is missing or malformed.
pub fn build_evidence_digest(source: &InputSource) -> Result<EvidenceDigest> {
    let source_type = source.resolved_type()?;
    let path = &source.path;
    match source_type {
        SourceType::Csv | SourceType::Xlsx => {
            let table = if source_type == SourceType::Csv {
                load_csv(path)?
            } else {
                load_xlsx(path)?
            };
            let sheet = build_facts_sheet(&source.key, &table);
            Ok(EvidenceDigest::TabularDatasetFactsSheet {
                format: source_type.to_string(),
                row_count: table.len(),
                schema: TabularSchema {
                    columns: table.columns.clone(),
                    mapped: sheet.mapping.clone(),
                },
                facts_sheet_line_count: sheet.lines.len(),
                facts_sheet: sheet.text(),
                note: "Deterministic facts sheet: statistics computed over every row; \
                       only the highest-signal rows are listed."
                    .to_string(),
            })
        }
        SourceType::Json => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read JSON file: {}", path.display()))?;
            let analytics = analyze_alert_stream(&text)
                .with_context(|| format!("Failed to analyse alert stream {}", path.display()))?;
            Ok(EvidenceDigest::OpsItAlertStream {
                analytics,
                note: "Aggregated alert stream: counts, explicit threshold breaches and \
                       high-pressure samples in encounter order."
                    .to_string(),
            })
        }
        SourceType::Docx => {
            let excerpt = docx_excerpt(path, MAX_EXCERPT_CHARS)?;
            Ok(EvidenceDigest::DocxReport {
                excerpt,
                note: format!("Report text, truncated to {} characters.", MAX_EXCERPT_CHARS),
            })
        }
    }
}
