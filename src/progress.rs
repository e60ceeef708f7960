//! Extraction and push progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable for scripts. The
//! push path reports once per committed batch, which is also the per-batch
//! callback hook for library callers.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// A source's digest is being built and sent to the model.
    Extracting {
        source_key: String,
        n: u64,
        total: u64,
    },
    /// A source finished with this many normalized events.
    Extracted { source_key: String, events: u64 },
    /// Batch `n` of `total` was upserted; `pushed` rows committed so far.
    BatchPushed {
        table: String,
        n: u64,
        total: u64,
        pushed: u64,
    },
}

/// Receives progress events from the extractor and pusher.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "push events  batch 2 / 5  (400 rows)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Extracting {
                source_key,
                n,
                total,
            } => format!("extract  {} / {}  {}\n", n, total, source_key),
            ProgressEvent::Extracted { source_key, events } => {
                format!("extract  {}  {} events\n", source_key, format_number(*events))
            }
            ProgressEvent::BatchPushed {
                table,
                n,
                total,
                pushed,
            } => format!(
                "push {}  batch {} / {}  ({} rows)\n",
                table,
                n,
                total,
                format_number(*pushed)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Extracting {
                source_key,
                n,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "extracting",
                "source_key": source_key,
                "n": n,
                "total": total
            }),
            ProgressEvent::Extracted { source_key, events } => serde_json::json!({
                "event": "progress",
                "phase": "extracted",
                "source_key": source_key,
                "events": events
            }),
            ProgressEvent::BatchPushed {
                table,
                n,
                total,
                pushed,
            } => serde_json::json!({
                "event": "progress",
                "phase": "pushing",
                "table": table,
                "n": n,
                "total": total,
                "pushed": pushed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
