use crate::error::{MetricsError, Result};
use crate::schema::{MetricRecord, Period, PeriodAxis, Unit};
use crate::utils::{is_contiguous, normalize_date};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Number of identity columns ahead of the period columns:
/// `uid, group, category, type, name, unit`.
pub const IDENTITY_COLUMNS: usize = 6;

/// Rows with fewer fields than this carry no period data and are dropped.
pub const MIN_ROW_FIELDS: usize = IDENTITY_COLUMNS + 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMetrics {
    pub period_axis: PeriodAxis,
    pub records: Vec<MetricRecord>,
    /// 1-based line numbers of rows dropped for having too few fields.
    pub dropped_rows: Vec<usize>,
    /// Non-blank header cells that did not normalize to a month.
    pub skipped_headers: Vec<String>,
}

/// Splits one CSV line on commas that are outside double quotes.
///
/// Quote characters are kept in the field text; numeric cells rely on them
/// (`"$1,234"`) and identity fields are unquoted separately.
pub fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);

    fields
}

/// Strips surrounding quotes and collapses doubled quotes.
pub fn unquote(field: &str) -> String {
    let trimmed = field.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}

/// Parses the raw CSV export into the period axis and one record per data row.
///
/// Only structural problems (no header, too few identity columns) are errors.
/// Short rows are dropped and reported, cell contents are kept as raw text.
pub fn parse_metrics_csv(csv_text: &str) -> Result<ParsedMetrics> {
    let text = csv_text.strip_prefix('\u{feff}').unwrap_or(csv_text);
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

    let header_line = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| MetricsError::MalformedInput("input has no header row".to_string()))?;

    let header = split_csv_line(header_line);
    if header.len() < IDENTITY_COLUMNS {
        return Err(MetricsError::MalformedInput(format!(
            "header has {} columns, expected at least {} identity columns",
            header.len(),
            IDENTITY_COLUMNS
        )));
    }

    let (columns, period_axis, skipped_headers) = build_period_columns(&header);

    let mut records = Vec::new();
    let mut dropped_rows = Vec::new();

    for (idx, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        // +2: 1-based, and the header occupies line 1
        let line_number = idx + 2;

        let fields = split_csv_line(line);
        if fields.len() < MIN_ROW_FIELDS {
            debug!(
                "Dropping line {}: {} fields, need at least {}",
                line_number,
                fields.len(),
                MIN_ROW_FIELDS
            );
            dropped_rows.push(line_number);
            continue;
        }

        let values: Vec<String> = columns
            .iter()
            .map_while(|&col| fields.get(col).cloned())
            .collect();

        records.push(MetricRecord {
            uid: unquote(&fields[0]),
            group: unquote(&fields[1]),
            category: unquote(&fields[2]),
            metric_type: unquote(&fields[3]),
            name: unquote(&fields[4]),
            unit: Unit::from_label(&unquote(&fields[5])),
            values,
        });
    }

    debug!(
        "Parsed {} records over {} periods ({} rows dropped)",
        records.len(),
        period_axis.len(),
        dropped_rows.len()
    );

    Ok(ParsedMetrics {
        period_axis,
        records,
        dropped_rows,
        skipped_headers,
    })
}

/// Maps header columns 6.. onto periods. Blank headers are ignored; headers
/// that do not normalize to a month are reported and left out of the axis.
fn build_period_columns(header: &[String]) -> (Vec<usize>, PeriodAxis, Vec<String>) {
    let mut columns = Vec::new();
    let mut axis = Vec::new();
    let mut skipped = Vec::new();

    for (col, cell) in header.iter().enumerate().skip(IDENTITY_COLUMNS) {
        let normalized = normalize_date(&unquote(cell));
        if normalized.is_empty() {
            continue;
        }
        match normalized.parse::<Period>() {
            Ok(period) => {
                columns.push(col);
                axis.push(period);
            }
            Err(_) => {
                warn!(
                    "Ignoring column {}: header '{}' is not a recognized date",
                    col + 1,
                    normalized
                );
                skipped.push(normalized);
            }
        }
    }

    if axis.windows(2).any(|w| w[0] > w[1]) {
        warn!("Period headers are not in chronological order");
    } else if !is_contiguous(&axis) {
        debug!("Period axis has gaps between months");
    }

    (columns, axis, skipped)
}

/// Reads a metrics export from disk and parses it.
pub fn read_metrics_file(path: impl AsRef<Path>) -> Result<ParsedMetrics> {
    let text = std::fs::read_to_string(path.as_ref())?;
    parse_metrics_csv(&text)
}
