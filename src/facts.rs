//! Facts-sheet construction for tabular evidence.
//!
//! Turns an arbitrary header + rows table into a short, line-oriented report
//! the LLM is prompted against. Columns are inferred from alias lists, then
//! five fixed analyses run over them:
//!
//! | Section | Analysis | Kept |
//! |---------|----------|------|
//! | `## Top spikes` | per-row z-score of volume | 20 |
//! | `## Top topic surges` | first-half vs second-half volume per topic | 15 |
//! | `## Worst sentiment windows` | lowest sentiment values | 20 |
//! | `## SLA breaches` | values at or above `max(floor, p90)` | 25 |
//! | `## Region breakdown` | volume (or row count) per region | 10 |
//!
//! The whole sheet never exceeds [`MAX_FACTS_LINES`] lines; section order and
//! the `key=value` field layout are what the extraction prompt expects.

use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::table::{parse_number, Table};

/// Hard cap on facts-sheet length, including headers.
pub const MAX_FACTS_LINES: usize = 200;

const TOP_SPIKES: usize = 20;
const TOP_SURGES: usize = 15;
const WORST_SENTIMENT: usize = 20;
const TOP_SLA_BREACHES: usize = 25;
const TOP_REGIONS: usize = 10;
const MAX_HIGHLIGHT_ROWS: usize = 25;
const MAX_HIGHLIGHT_CHARS: usize = 300;

pub const TIMESTAMP_ALIASES: &[&str] = &[
    "timestamp", "ts", "time", "date", "datetime", "created_at", "event_time", "period",
    "week", "month", "day",
];
pub const TOPIC_ALIASES: &[&str] = &[
    "topic", "issue_type", "category", "issue", "theme", "reason", "subject", "product",
    "service", "type",
];
pub const VOLUME_ALIASES: &[&str] = &[
    "volume", "count", "tickets", "ticket_count", "events", "requests", "orders",
    "quantity", "qty", "amount", "total",
];
pub const SENTIMENT_ALIASES: &[&str] = &[
    "sentiment", "sentiment_score", "csat", "nps", "satisfaction", "score",
];
pub const SLA_ALIASES: &[&str] = &[
    "sla", "latency_ms", "latency", "response_time", "resolution_time", "resolution_hours",
    "first_response_time", "handle_time", "duration",
];
pub const REGION_ALIASES: &[&str] = &["region", "geo", "country", "market", "location", "site"];

/// Lowercases and strips everything that is not an ASCII letter or digit.
pub fn normalize_column_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Picks the column matching one of `aliases`.
///
/// Exact normalized equality is tried for every alias before any substring
/// match, so an exact hit always wins. Within a pass, the first alias wins,
/// then the first column.
pub fn pick_column(columns: &[String], aliases: &[&str]) -> Option<String> {
    let normalized: Vec<String> = columns.iter().map(|c| normalize_column_name(c)).collect();
    let aliases: Vec<String> = aliases.iter().map(|a| normalize_column_name(a)).collect();

    for alias in &aliases {
        if alias.is_empty() {
            continue;
        }
        if let Some(i) = normalized.iter().position(|c| c == alias) {
            return Some(columns[i].clone());
        }
    }

    for alias in &aliases {
        if alias.is_empty() {
            continue;
        }
        let hit = normalized.iter().position(|c| {
            !c.is_empty() && (c.contains(alias.as_str()) || alias.contains(c.as_str()))
        });
        if let Some(i) = hit {
            return Some(columns[i].clone());
        }
    }
    None
}

/// Which raw column (if any) serves each concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ColumnMapping {
    pub timestamp: Option<String>,
    pub topic: Option<String>,
    pub volume: Option<String>,
    pub sentiment: Option<String>,
    pub sla: Option<String>,
    pub region: Option<String>,
}

impl ColumnMapping {
    pub fn infer(columns: &[String]) -> Self {
        Self {
            timestamp: pick_column(columns, TIMESTAMP_ALIASES),
            topic: pick_column(columns, TOPIC_ALIASES),
            volume: pick_column(columns, VOLUME_ALIASES),
            sentiment: pick_column(columns, SENTIMENT_ALIASES),
            sla: pick_column(columns, SLA_ALIASES),
            region: pick_column(columns, REGION_ALIASES),
        }
    }

    fn summary_line(&self) -> String {
        let show = |c: &Option<String>| c.clone().unwrap_or_else(|| "-".to_string());
        format!(
            "mapped: timestamp={} topic={} volume={} sentiment={} sla={} region={}",
            show(&self.timestamp),
            show(&self.topic),
            show(&self.volume),
            show(&self.sentiment),
            show(&self.sla),
            show(&self.region)
        )
    }
}

/// Column indices resolved against a concrete table.
struct Resolved {
    timestamp: Option<usize>,
    topic: Option<usize>,
    volume: Option<usize>,
    sentiment: Option<usize>,
    sla: Option<usize>,
    region: Option<usize>,
}

impl Resolved {
    fn new(table: &Table, mapping: &ColumnMapping) -> Self {
        let idx = |c: &Option<String>| c.as_deref().and_then(|n| table.column_index(n));
        Self {
            timestamp: idx(&mapping.timestamp),
            topic: idx(&mapping.topic),
            volume: idx(&mapping.volume),
            sentiment: idx(&mapping.sentiment),
            sla: idx(&mapping.sla),
            region: idx(&mapping.region),
        }
    }

    fn text(table: &Table, row: usize, col: Option<usize>) -> Option<String> {
        let col = col?;
        let v = table.cell(row, col).trim();
        if v.is_empty() {
            None
        } else {
            Some(v.to_string())
        }
    }

    fn number(table: &Table, row: usize, col: Option<usize>) -> Option<f64> {
        col.and_then(|c| parse_number(table.cell(row, c)))
    }

    /// Volume for aggregation: the parsed value, or 1 per row without a volume column.
    fn weight(&self, table: &Table, row: usize) -> f64 {
        match self.volume {
            Some(c) => parse_number(table.cell(row, c)).unwrap_or(0.0),
            None => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spike {
    /// 1-based data row number.
    pub row: usize,
    pub timestamp: Option<String>,
    pub topic: Option<String>,
    pub volume: f64,
    pub z_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// Mean, population standard deviation, min and max. `None` for no values.
pub fn volume_stats(values: &[f64]) -> Option<VolumeStats> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(VolumeStats {
        mean,
        std_dev: variance.sqrt(),
        min,
        max,
    })
}

/// Ranks rows by volume z-score (descending, ties by raw volume), keeping `limit`.
pub fn top_spikes(table: &Table, mapping: &ColumnMapping, limit: usize) -> Vec<Spike> {
    let cols = Resolved::new(table, mapping);
    if cols.volume.is_none() {
        return Vec::new();
    }
    let points: Vec<(usize, f64)> = (0..table.len())
        .filter_map(|r| Resolved::number(table, r, cols.volume).map(|v| (r, v)))
        .collect();
    let values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
    let Some(stats) = volume_stats(&values) else {
        return Vec::new();
    };

    let mut spikes: Vec<Spike> = points
        .into_iter()
        .map(|(r, v)| Spike {
            row: r + 1,
            timestamp: Resolved::text(table, r, cols.timestamp),
            topic: Resolved::text(table, r, cols.topic),
            volume: v,
            z_score: if stats.std_dev == 0.0 {
                0.0
            } else {
                (v - stats.mean) / stats.std_dev
            },
        })
        .collect();
    spikes.sort_by(|a, b| {
        b.z_score
            .total_cmp(&a.z_score)
            .then(b.volume.total_cmp(&a.volume))
    });
    spikes.truncate(limit);
    spikes
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicSurge {
    pub topic: String,
    pub first_half: f64,
    pub second_half: f64,
    pub surge_pct: f64,
}

/// `(second - first) / max(1, first) * 100`.
pub fn surge_pct(first_half: f64, second_half: f64) -> f64 {
    (second_half - first_half) / first_half.max(1.0) * 100.0
}

/// Compares per-topic volume between the first and second half of the rows.
///
/// Rows at 0-based index `0..=floor(n/2)` form the first half, so the
/// boundary row goes to the first half.
pub fn topic_surges(table: &Table, mapping: &ColumnMapping, limit: usize) -> Vec<TopicSurge> {
    let cols = Resolved::new(table, mapping);
    if cols.topic.is_none() {
        return Vec::new();
    }
    let mid = table.len() / 2;
    let mut order: Vec<String> = Vec::new();
    let mut halves: HashMap<String, (f64, f64)> = HashMap::new();

    for r in 0..table.len() {
        let Some(topic) = Resolved::text(table, r, cols.topic) else {
            continue;
        };
        let weight = cols.weight(table, r);
        let entry = halves.entry(topic.clone()).or_insert_with(|| {
            order.push(topic.clone());
            (0.0, 0.0)
        });
        if r <= mid {
            entry.0 += weight;
        } else {
            entry.1 += weight;
        }
    }

    let mut surges: Vec<TopicSurge> = order
        .into_iter()
        .map(|topic| {
            let (first, second) = halves[&topic];
            TopicSurge {
                surge_pct: surge_pct(first, second),
                topic,
                first_half: first,
                second_half: second,
            }
        })
        .collect();
    surges.sort_by(|a, b| b.surge_pct.total_cmp(&a.surge_pct));
    surges.truncate(limit);
    surges
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowValue {
    /// 1-based data row number.
    pub row: usize,
    pub timestamp: Option<String>,
    pub topic: Option<String>,
    pub value: f64,
}

fn numeric_rows(table: &Table, cols: &Resolved, col: Option<usize>) -> Vec<RowValue> {
    (0..table.len())
        .filter_map(|r| {
            Resolved::number(table, r, col).map(|value| RowValue {
                row: r + 1,
                timestamp: Resolved::text(table, r, cols.timestamp),
                topic: Resolved::text(table, r, cols.topic),
                value,
            })
        })
        .collect()
}

/// The `limit` most negative sentiment rows, ascending.
pub fn worst_sentiment(table: &Table, mapping: &ColumnMapping, limit: usize) -> Vec<RowValue> {
    let cols = Resolved::new(table, mapping);
    let mut rows = numeric_rows(table, &cols, cols.sentiment);
    rows.sort_by(|a, b| a.value.total_cmp(&b.value));
    rows.truncate(limit);
    rows
}

/// Nearest-rank percentile on an ascending slice: index `floor((n-1)*p)`.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let last = sorted.len() - 1;
    let idx = ((last as f64) * p).floor().max(0.0) as usize;
    Some(sorted[idx.min(last)])
}

/// Static floor for an SLA column: 2000 for latency/millisecond columns, 60 otherwise.
pub fn sla_floor(column: &str) -> f64 {
    let norm = normalize_column_name(column);
    if norm.contains("latency") || norm.contains("ms") {
        2000.0
    } else {
        60.0
    }
}

/// `max(floor, p90(values))`.
pub fn sla_threshold(column: &str, values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let floor = sla_floor(column);
    match percentile(&sorted, 0.9) {
        Some(p90) => floor.max(p90),
        None => floor,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlaReport {
    pub column: String,
    pub threshold: f64,
    pub breaches: Vec<RowValue>,
}

/// Rows at or above the SLA threshold, highest first.
pub fn sla_breaches(table: &Table, mapping: &ColumnMapping, limit: usize) -> Option<SlaReport> {
    let column = mapping.sla.clone()?;
    let cols = Resolved::new(table, mapping);
    let rows = numeric_rows(table, &cols, cols.sla);
    let values: Vec<f64> = rows.iter().map(|r| r.value).collect();
    let threshold = sla_threshold(&column, &values);
    let mut breaches: Vec<RowValue> = rows.into_iter().filter(|r| r.value >= threshold).collect();
    breaches.sort_by(|a, b| b.value.total_cmp(&a.value));
    breaches.truncate(limit);
    Some(SlaReport {
        column,
        threshold,
        breaches,
    })
}

/// Volume (or row count) per region, descending.
pub fn region_breakdown(table: &Table, mapping: &ColumnMapping, limit: usize) -> Vec<(String, f64)> {
    let cols = Resolved::new(table, mapping);
    if cols.region.is_none() {
        return Vec::new();
    }
    let mut order: Vec<String> = Vec::new();
    let mut totals: HashMap<String, f64> = HashMap::new();
    for r in 0..table.len() {
        let Some(region) = Resolved::text(table, r, cols.region) else {
            continue;
        };
        let weight = cols.weight(table, r);
        *totals.entry(region.clone()).or_insert_with(|| {
            order.push(region.clone());
            0.0
        }) += weight;
    }
    let mut out: Vec<(String, f64)> = order
        .into_iter()
        .map(|r| {
            let total = totals[&r];
            (r, total)
        })
        .collect();
    out.sort_by(|a, b| b.1.total_cmp(&a.1));
    out.truncate(limit);
    out
}

/// A rendered facts sheet plus the column mapping it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct FactsSheet {
    pub mapping: ColumnMapping,
    pub lines: Vec<String>,
}

impl FactsSheet {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Builds the facts sheet for one table.
pub fn build_facts_sheet(key: &str, table: &Table) -> FactsSheet {
    let mapping = ColumnMapping::infer(&table.columns);
    let cols = Resolved::new(table, &mapping);
    let mut lines: Vec<String> = Vec::new();
    let mut cited: HashSet<usize> = HashSet::new();

    lines.push(format!("# Facts Sheet: {}", key));
    lines.push(format!("rows: {}", table.len()));
    lines.push(format!("columns: {}", table.columns.join(", ")));
    lines.push(mapping.summary_line());
    let volumes: Vec<f64> = (0..table.len())
        .filter_map(|r| Resolved::number(table, r, cols.volume))
        .collect();
    if let Some(stats) = volume_stats(&volumes) {
        lines.push(format!(
            "volume_stats: mean={} std={} min={} max={}",
            fmt_num(stats.mean),
            fmt_num(stats.std_dev),
            fmt_num(stats.min),
            fmt_num(stats.max)
        ));
    }

    lines.push("## Top spikes".to_string());
    let spikes = top_spikes(table, &mapping, TOP_SPIKES);
    if spikes.is_empty() {
        lines.push("- none (no numeric volume column)".to_string());
    }
    for s in &spikes {
        cited.insert(s.row);
        lines.push(format!(
            "- spike row={}{}{} volume={} z={:.2}",
            s.row,
            field("ts", &s.timestamp),
            field("topic", &s.topic),
            fmt_num(s.volume),
            s.z_score
        ));
    }

    lines.push("## Top topic surges".to_string());
    let surges = topic_surges(table, &mapping, TOP_SURGES);
    if surges.is_empty() {
        lines.push("- none (no topic column)".to_string());
    }
    for s in &surges {
        lines.push(format!(
            "- surge topic={} first_half={} second_half={} surge_pct={:.1}",
            s.topic,
            fmt_num(s.first_half),
            fmt_num(s.second_half),
            s.surge_pct
        ));
    }

    lines.push("## Worst sentiment windows".to_string());
    let sentiment = worst_sentiment(table, &mapping, WORST_SENTIMENT);
    if sentiment.is_empty() {
        lines.push("- none (no numeric sentiment column)".to_string());
    }
    for s in &sentiment {
        cited.insert(s.row);
        lines.push(format!(
            "- sentiment row={}{}{} value={}",
            s.row,
            field("ts", &s.timestamp),
            field("topic", &s.topic),
            fmt_num(s.value)
        ));
    }

    lines.push("## SLA breaches".to_string());
    match sla_breaches(table, &mapping, TOP_SLA_BREACHES) {
        Some(report) => {
            lines.push(format!(
                "- threshold column={} value={} breaches={}",
                report.column,
                fmt_num(report.threshold),
                report.breaches.len()
            ));
            for b in &report.breaches {
                cited.insert(b.row);
                lines.push(format!(
                    "- breach row={}{}{} value={}",
                    b.row,
                    field("ts", &b.timestamp),
                    field("topic", &b.topic),
                    fmt_num(b.value)
                ));
            }
        }
        None => lines.push("- none (no SLA column)".to_string()),
    }

    lines.push("## Region breakdown".to_string());
    let regions = region_breakdown(table, &mapping, TOP_REGIONS);
    if regions.is_empty() {
        lines.push("- none (no region column)".to_string());
    }
    for (region, total) in &regions {
        lines.push(format!("- region={} volume={}", region, fmt_num(*total)));
    }

    // Leftover budget goes to rows the analyses did not already cite.
    let remaining = MAX_FACTS_LINES.saturating_sub(lines.len() + 1);
    if remaining > 0 && !table.is_empty() {
        let highlights: Vec<String> = (0..table.len())
            .filter(|r| !cited.contains(&(r + 1)))
            .take(remaining.min(MAX_HIGHLIGHT_ROWS))
            .map(|r| render_row(table, r))
            .collect();
        if !highlights.is_empty() {
            lines.push("## Additional row highlights".to_string());
            lines.extend(highlights);
        }
    }

    lines.truncate(MAX_FACTS_LINES);
    FactsSheet { mapping, lines }
}

fn render_row(table: &Table, row: usize) -> String {
    let cells: Vec<String> = table
        .columns
        .iter()
        .enumerate()
        .filter(|(c, _)| !table.cell(row, *c).trim().is_empty())
        .map(|(c, name)| format!("{}={}", name, table.cell(row, c).trim()))
        .collect();
    let line = format!("- row={} {}", row + 1, cells.join("; "));
    if line.chars().count() > MAX_HIGHLIGHT_CHARS {
        line.chars().take(MAX_HIGHLIGHT_CHARS).collect()
    } else {
        line
    }
}

fn field(name: &str, value: &Option<String>) -> String {
    match value {
        Some(v) => format!(" {}={}", name, v),
        None => String::new(),
    }
}

/// Integers print bare, everything else with two decimals.
pub fn fmt_num(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.2}", v)
    }
}
