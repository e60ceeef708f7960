//! Event push: upsert extracted events into a remote table.
//!
//! Rows are sent in sequential batches through a [`RowSink`]. The shipped
//! sink, [`PostgrestSink`], targets any PostgREST-compatible endpoint:
//!
//! ```text
//! POST {base}/rest/v1/{table}?on_conflict=event_id
//! Prefer: resolution=merge-duplicates,return=minimal
//! ```
//!
//! Upsert on `event_id` makes pushes idempotent: pushing the same document
//! twice overwrites rows instead of duplicating them.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::PushConfig;
use crate::error::PipelineError;
use crate::extractor::read_extraction_result;
use crate::http::{send_with_retry, RetryPolicy};
use crate::models::EventRow;
use crate::progress::{ProgressEvent, ProgressReporter};

/// Destination for event rows. Implementations must upsert on `event_id`.
#[async_trait]
pub trait RowSink: Send + Sync {
    async fn upsert(&self, table: &str, rows: &[EventRow]) -> Result<()>;
}

pub struct PostgrestSink {
    client: reqwest::Client,
    base_url: String,
    service_key: String,
    retry: RetryPolicy,
}

impl PostgrestSink {
    /// # Errors
    ///
    /// [`PipelineError::MissingConfig`] when the URL or key is empty.
    pub fn new(base_url: &str, service_key: &str, config: &PushConfig) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(PipelineError::MissingConfig("SUPABASE_URL".to_string()).into());
        }
        if service_key.trim().is_empty() {
            return Err(
                PipelineError::MissingConfig("SUPABASE_SERVICE_ROLE_KEY".to_string()).into(),
            );
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            service_key: service_key.trim().to_string(),
            retry: RetryPolicy::new(config.max_retries),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl RowSink for PostgrestSink {
    async fn upsert(&self, table: &str, rows: &[EventRow]) -> Result<()> {
        let url = format!("{}/rest/v1/{}?on_conflict=event_id", self.base_url, table);
        send_with_retry("upsert", self.retry, || {
            self.client
                .post(&url)
                .header("apikey", &self.service_key)
                .bearer_auth(&self.service_key)
                .header("Prefer", "resolution=merge-duplicates,return=minimal")
                .json(rows)
        })
        .await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PushOptions {
    pub input_file: PathBuf,
    pub table: String,
    pub batch_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushReport {
    pub input_file: PathBuf,
    pub table: String,
    pub pushed_count: usize,
    pub batches: usize,
}

/// Reads an extraction document and upserts its events batch by batch.
///
/// A document with no events is a successful no-op. A failing batch aborts
/// the rest; the error says how much was already committed.
pub async fn run_event_push(
    options: &PushOptions,
    sink: &dyn RowSink,
    progress: &dyn ProgressReporter,
) -> Result<PushReport> {
    let doc = read_extraction_result(&options.input_file)?;
    let mut report = PushReport {
        input_file: options.input_file.clone(),
        table: options.table.clone(),
        pushed_count: 0,
        batches: 0,
    };
    if doc.events.is_empty() {
        tracing::info!(file = %options.input_file.display(), "no events to push");
        return Ok(report);
    }

    let created_at = created_at_from(&doc.generated_at);
    let rows: Vec<EventRow> = doc
        .events
        .iter()
        .map(|e| EventRow::from_event(e, &created_at))
        .collect();

    let batch_size = options.batch_size.max(1);
    let total = rows.len().div_ceil(batch_size);

    for (i, chunk) in rows.chunks(batch_size).enumerate() {
        sink.upsert(&options.table, chunk).await.with_context(|| {
            format!(
                "Upsert of batch {}/{} into '{}' failed ({} batches, {} rows already committed)",
                i + 1,
                total,
                options.table,
                report.batches,
                report.pushed_count
            )
        })?;
        report.batches += 1;
        report.pushed_count += chunk.len();
        tracing::debug!(batch = i + 1, rows = chunk.len(), "batch upserted");
        progress.report(ProgressEvent::BatchPushed {
            table: options.table.clone(),
            n: report.batches as u64,
            total: total as u64,
            pushed: report.pushed_count as u64,
        });
    }

    tracing::info!(
        table = %options.table,
        pushed = report.pushed_count,
        batches = report.batches,
        "push complete"
    );
    Ok(report)
}

/// `generated_at` normalized to UTC RFC 3339, or now when it does not parse.
fn created_at_from(generated_at: &str) -> String {
    DateTime::parse_from_rfc3339(generated_at.trim())
        .map(|d| d.with_timezone(&Utc).to_rfc3339())
        .unwrap_or_else(|_| Utc::now().to_rfc3339())
}
