//! Event extraction orchestration.
//!
//! For each input source, in order: build its evidence digest, ask the model
//! for events against a fixed schema, normalize what comes back, and
//! accumulate. The full [`ExtractionResult`] is written once at the end
//! (overwrite, never merge). The first failing source aborts the run.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::digest::build_evidence_digest;
use crate::llm::{extraction_system_prompt, parse_events_payload, ChatModel};
use crate::models::{
    make_unique, Event, ExtractionResult, GeneratorInfo, InputSource, SourceRun,
};
use crate::progress::{ProgressEvent, ProgressReporter};

/// Pipeline label recorded in `generator.pipeline`.
pub const PIPELINE_NAME: &str = "evidence-digest-extraction";

#[derive(Debug, Clone)]
pub struct ExtractionOptions {
    pub input_files: Vec<InputSource>,
    pub output_file: PathBuf,
    /// Upper bound per source; values below 4 are raised to 4.
    pub max_events_per_source: usize,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    pub output_file: PathBuf,
    pub event_count: usize,
    pub output: ExtractionResult,
}

/// Runs extraction over every source and writes the result document.
pub async fn run_event_extraction(
    options: &ExtractionOptions,
    model: &dyn ChatModel,
    progress: &dyn ProgressReporter,
) -> Result<ExtractionOutcome> {
    if options.input_files.is_empty() {
        bail!("no input sources to extract from");
    }
    let max_events = options.max_events_per_source.max(4);
    let system = extraction_system_prompt(max_events);
    let total = options.input_files.len() as u64;

    let mut events: Vec<Event> = Vec::new();
    let mut source_runs: Vec<SourceRun> = Vec::new();
    let mut seen_ids: HashSet<String> = HashSet::new();

    for (i, source) in options.input_files.iter().enumerate() {
        progress.report(ProgressEvent::Extracting {
            source_key: source.key.clone(),
            n: i as u64 + 1,
            total,
        });

        let digest = build_evidence_digest(source)
            .with_context(|| format!("Failed to build evidence digest for '{}'", source.key))?;
        let user = serde_json::json!({
            "source_key": source.key,
            "expected_domain": source.domain,
            "evidence_digest": digest,
        })
        .to_string();

        let content = model
            .complete_json(&system, &user)
            .await
            .with_context(|| format!("LLM extraction failed for source '{}'", source.key))?;
        let raw = parse_events_payload(&content);
        let normalized = normalize_events(&raw, source, max_events, &mut seen_ids);

        tracing::info!(
            source_key = %source.key,
            evidence_type = digest.evidence_type(),
            returned = raw.len(),
            kept = normalized.len(),
            "extracted events"
        );
        progress.report(ProgressEvent::Extracted {
            source_key: source.key.clone(),
            events: normalized.len() as u64,
        });

        source_runs.push(SourceRun {
            source_key: source.key.clone(),
            domain: source.domain.to_string(),
            file_name: source.file_name(),
            generated_event_count: normalized.len(),
            evidence_type: digest.evidence_type().to_string(),
        });
        events.extend(normalized);
    }

    let output = ExtractionResult {
        generated_at: Utc::now().to_rfc3339(),
        generator: GeneratorInfo {
            provider: model.provider().to_string(),
            model: model.model().to_string(),
            pipeline: PIPELINE_NAME.to_string(),
        },
        source_runs,
        event_count: events.len(),
        events,
    };
    write_extraction_result(&options.output_file, &output)?;

    Ok(ExtractionOutcome {
        output_file: options.output_file.clone(),
        event_count: output.event_count,
        output,
    })
}

/// Writes the result as pretty JSON, creating parent directories.
pub fn write_extraction_result(path: &Path, result: &ExtractionResult) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(result)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write extraction output: {}", path.display()))?;
    Ok(())
}

pub fn read_extraction_result(path: &Path) -> Result<ExtractionResult> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read extraction output: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse extraction output: {}", path.display()))
}

/// Shape accepted from the model. Every field is optional and loosely typed;
/// entries that are not JSON objects are dropped.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEvent {
    event_id: Option<Value>,
    source_key: Option<Value>,
    domain: Option<Value>,
    title: Option<Value>,
    summary: Option<Value>,
    evidence: Option<Value>,
}

fn scalar_text(v: &Option<Value>) -> Option<String> {
    let s = match v.as_ref()? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Normalizes raw model events for one source.
///
/// Lowercases `domain` (defaulting to the source's), fills `event_id` with
/// `<source_key>_ev_<NNN>` when absent, coerces `evidence` to a string list,
/// keeps ids unique across the run via `seen_ids`, and keeps at most
/// `max_events` entries.
pub fn normalize_events(
    raw: &[Value],
    source: &InputSource,
    max_events: usize,
    seen_ids: &mut HashSet<String>,
) -> Vec<Event> {
    let mut out = Vec::new();
    for value in raw {
        if out.len() >= max_events {
            tracing::warn!(
                source_key = %source.key,
                dropped = raw.len() - max_events,
                "model returned more events than allowed"
            );
            break;
        }
        if !value.is_object() {
            continue;
        }
        let Ok(ev) = serde_json::from_value::<RawEvent>(value.clone()) else {
            continue;
        };

        let index = out.len() + 1;
        let base_id = scalar_text(&ev.event_id)
            .unwrap_or_else(|| format!("{}_ev_{:03}", source.key, index));
        let event_id = make_unique(base_id, seen_ids);

        let evidence = match ev.evidence {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) if !s.trim().is_empty() => Some(s),
                    Value::Null => None,
                    Value::String(_) => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            _ => Vec::new(),
        };

        out.push(Event {
            event_id,
            source_key: scalar_text(&ev.source_key).unwrap_or_else(|| source.key.clone()),
            domain: scalar_text(&ev.domain)
                .unwrap_or_else(|| source.domain.to_string())
                .to_lowercase(),
            title: scalar_text(&ev.title).unwrap_or_else(|| "Untitled event".to_string()),
            summary: scalar_text(&ev.summary).unwrap_or_default(),
            evidence,
        });
    }
    out
}
