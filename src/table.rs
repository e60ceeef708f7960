//! Tabular input loading (CSV and XLSX).
//!
//! Both formats are reduced to the same shape: one header row and a list of
//! string rows padded to the header width. Numeric interpretation happens
//! later, per column, in [`crate::facts`].

use anyhow::{Context, Result};
use std::path::Path;

use crate::error::PipelineError;

/// A header row plus data rows, all cells as text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Cell text, or `""` when the row is short.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(|s| s.as_str())
            .unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn from_records(mut records: Vec<Vec<String>>) -> Self {
        if records.is_empty() {
            return Table::default();
        }
        let columns: Vec<String> = records
            .remove(0)
            .into_iter()
            .map(|c| c.trim().to_string())
            .collect();
        let width = columns.len();
        let rows = records
            .into_iter()
            .map(|mut r| {
                r.resize(width.max(r.len()), String::new());
                r.truncate(width);
                r
            })
            .collect();
        Table { columns, rows }
    }
}

pub fn load_csv(path: &Path) -> Result<Table> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;
    Ok(parse_csv(&text))
}

/// Parses RFC 4180-style CSV: quoted fields, doubled quotes, embedded
/// newlines, CRLF line endings and a leading BOM. Blank lines are skipped.
pub fn parse_csv(text: &str) -> Table {
    let text = text.trim_start_matches('\u{feff}');
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        push_record(&mut records, record);
    }

    Table::from_records(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    if record.iter().all(|f| f.trim().is_empty()) {
        return;
    }
    records.push(record);
}

/// Loads the first worksheet of a workbook.
pub fn load_xlsx(path: &Path) -> Result<Table> {
    use calamine::{open_workbook_auto, Reader};

    let mut workbook = open_workbook_auto(path)
        .map_err(|e| PipelineError::InvalidInput(format!("{}: {}", path.display(), e)))?;
    let first = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| PipelineError::InvalidInput(format!("{}: no sheets", path.display())))?;
    let range = workbook
        .worksheet_range(&first)
        .map_err(|e| PipelineError::InvalidInput(format!("{}: {}", path.display(), e)))?;

    let records: Vec<Vec<String>> = range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect::<Vec<_>>())
        .filter(|r: &Vec<String>| r.iter().any(|c| !c.trim().is_empty()))
        .collect();
    Ok(Table::from_records(records))
}

fn cell_to_string(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(n) => n.to_string(),
        Data::Float(f) => format!("{}", f),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("#ERR({:?})", e),
        Data::DateTime(dt) => format!("{}", dt),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

/// Lenient numeric parse: tolerates thousands separators, `%`, `$` and
/// surrounding whitespace. Non-finite results are rejected.
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '%' | '$' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}
