//! Analytics over ops/IT alert streams (JSON evidence).
//!
//! Input is `{"items": [...]}` (a bare array is accepted too). Each item may
//! carry `severity`, `service`, `region` and a timestamp either at the top
//! level or inside `payload`, plus `payload.metrics` and `payload.thresholds`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::PipelineError;

const TOP_SERVICES: usize = 10;
const MAX_THRESHOLD_BREACHES: usize = 30;
const MAX_PRESSURE_SAMPLES: usize = 25;

/// Built-in high-pressure rules: `(metric, limit)`, breached when `value > limit`.
const PRESSURE_RULES: &[(&str, f64)] = &[
    ("error_rate_pct", 1.5),
    ("p95_latency_ms", 1200.0),
    ("dns_latency_ms", 65.0),
];

const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts", "time", "created_at", "occurred_at"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CountEntry {
    pub key: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertCounts {
    pub by_severity: Vec<CountEntry>,
    pub by_service: Vec<CountEntry>,
    pub by_region: Vec<CountEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: String,
    pub end: String,
}

/// One item that tripped at least one built-in pressure rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PressureSample {
    pub index: usize,
    pub timestamp: Option<String>,
    pub service: Option<String>,
    pub region: Option<String>,
    pub reasons: Vec<String>,
}

/// A metric at or above its own `<metric>_warn` threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdBreach {
    pub index: usize,
    pub timestamp: Option<String>,
    pub service: Option<String>,
    pub metric: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertAnalytics {
    pub item_count: usize,
    pub time_range: Option<TimeRange>,
    pub counts: AlertCounts,
    pub high_pressure_samples: Vec<PressureSample>,
    pub explicit_threshold_breaches: Vec<ThresholdBreach>,
}

/// Parses and analyses an alert-stream document.
pub fn analyze_alert_stream(text: &str) -> Result<AlertAnalytics, PipelineError> {
    let doc: Value = serde_json::from_str(text)
        .map_err(|e| PipelineError::InvalidInput(format!("alert stream is not JSON: {}", e)))?;
    let items: &[Value] = match &doc {
        Value::Array(items) => items.as_slice(),
        Value::Object(obj) => match obj.get("items") {
            Some(Value::Array(items)) => items.as_slice(),
            Some(_) => {
                return Err(PipelineError::InvalidInput(
                    "alert stream 'items' is not an array".to_string(),
                ))
            }
            None => &[],
        },
        _ => {
            return Err(PipelineError::InvalidInput(
                "alert stream must be an object or array".to_string(),
            ))
        }
    };
    Ok(analyze_items(items))
}

pub fn analyze_items(items: &[Value]) -> AlertAnalytics {
    let mut severity = Counter::default();
    let mut service = Counter::default();
    let mut region = Counter::default();
    let mut start: Option<String> = None;
    let mut end: Option<String> = None;
    let mut samples = Vec::new();
    let mut breaches = Vec::new();

    for (index, item) in items.iter().enumerate() {
        let ts = timestamp_of(item);
        let svc = text_field(item, "service");
        let reg = text_field(item, "region");

        severity.add(
            text_field(item, "severity")
                .map(|s| s.to_ascii_lowercase())
                .unwrap_or_else(|| "unknown".to_string()),
        );
        service.add(svc.clone().unwrap_or_else(|| "unknown".to_string()));
        region.add(reg.clone().unwrap_or_else(|| "unknown".to_string()));

        if let Some(ts) = &ts {
            if start.as_ref().map_or(true, |s| ts < s) {
                start = Some(ts.clone());
            }
            if end.as_ref().map_or(true, |e| ts > e) {
                end = Some(ts.clone());
            }
        }

        let payload = item.get("payload").and_then(Value::as_object);
        let metrics = payload.and_then(|p| p.get("metrics")).and_then(Value::as_object);
        let thresholds = payload
            .and_then(|p| p.get("thresholds"))
            .and_then(Value::as_object);

        if let Some(metrics) = metrics {
            if samples.len() < MAX_PRESSURE_SAMPLES {
                let reasons = pressure_reasons(metrics);
                if !reasons.is_empty() {
                    samples.push(PressureSample {
                        index,
                        timestamp: ts.clone(),
                        service: svc.clone(),
                        region: reg.clone(),
                        reasons,
                    });
                }
            }
            if let Some(thresholds) = thresholds {
                for (metric, raw) in metrics {
                    if breaches.len() >= MAX_THRESHOLD_BREACHES {
                        break;
                    }
                    let (Some(value), Some(threshold)) = (
                        as_number(raw),
                        thresholds.get(&format!("{}_warn", metric)).and_then(as_number),
                    ) else {
                        continue;
                    };
                    if value >= threshold {
                        breaches.push(ThresholdBreach {
                            index,
                            timestamp: ts.clone(),
                            service: svc.clone(),
                            metric: metric.clone(),
                            value,
                            threshold,
                        });
                    }
                }
            }
        }
    }

    AlertAnalytics {
        item_count: items.len(),
        time_range: match (start, end) {
            (Some(start), Some(end)) => Some(TimeRange { start, end }),
            _ => None,
        },
        counts: AlertCounts {
            by_severity: severity.ranked(None),
            by_service: service.ranked(Some(TOP_SERVICES)),
            by_region: region.ranked(None),
        },
        high_pressure_samples: samples,
        explicit_threshold_breaches: breaches,
    }
}

fn pressure_reasons(metrics: &Map<String, Value>) -> Vec<String> {
    PRESSURE_RULES
        .iter()
        .filter_map(|(name, limit)| {
            let value = metrics.get(*name).and_then(as_number)?;
            (value > *limit).then(|| format!("{}={} > {}", name, value, limit))
        })
        .collect()
}

/// Numbers, or strings holding numbers.
fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Looks `key` up on the item, then on `item.payload`.
fn text_field(item: &Value, key: &str) -> Option<String> {
    let direct = item.get(key);
    let nested = || item.get("payload").and_then(|p| p.get(key));
    match direct.or_else(nested)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_of(item: &Value) -> Option<String> {
    TIMESTAMP_KEYS.iter().find_map(|k| text_field(item, k))
}

#[derive(Default)]
struct Counter {
    order: Vec<String>,
    counts: HashMap<String, usize>,
}

impl Counter {
    fn add(&mut self, key: String) {
        match self.counts.get_mut(&key) {
            Some(n) => *n += 1,
            None => {
                self.counts.insert(key.clone(), 1);
                self.order.push(key);
            }
        }
    }

    /// Descending by count, first-seen order on ties.
    fn ranked(&self, limit: Option<usize>) -> Vec<CountEntry> {
        let mut out: Vec<CountEntry> = self
            .order
            .iter()
            .map(|k| CountEntry {
                key: k.clone(),
                count: self.counts[k],
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        out
    }
}
