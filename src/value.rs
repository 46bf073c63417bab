//! Cell value parsing for the loosely formatted numbers found in metric exports:
//! `"$1,234"`, `$1,234 `, `(394)` for negatives, `85%`, blanks.

use crate::schema::Unit;
use serde::{Deserialize, Serialize};

/// The outcome of parsing one raw cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Number(f64),
    /// Non-blank text that is not a number. Carries the trimmed original.
    Invalid(String),
    /// Blank cell, or no cell at all in a truncated row.
    Missing,
}

impl CellValue {
    /// The lenient reading used across the dashboard: anything that is not a
    /// number counts as zero.
    pub fn or_zero(&self) -> f64 {
        self.as_number().unwrap_or(0.0)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Parses a raw cell into a number, falling back to `0` for blank or
/// unparseable input.
pub fn parse_value(raw: &str) -> f64 {
    parse_cell(raw).or_zero()
}

/// Parses a raw cell, keeping track of why a cell did not yield a number.
///
/// Rules, in order:
/// 1. blank -> `Missing`
/// 2. wrapped in double quotes -> the quotes are stripped and the interior parsed
/// 3. wrapped in parentheses -> accounting negative of the interior
/// 4. otherwise `$`, `,`, `%` and whitespace are stripped and the rest parsed
///
/// Parentheses are checked before currency so that `($394)` reads as `-394`.
pub fn parse_cell(raw: &str) -> CellValue {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return CellValue::Missing;
    }

    if let Some(inner) = strip_wrapping(trimmed, '"', '"') {
        return match parse_cell(inner) {
            CellValue::Invalid(_) => CellValue::Invalid(trimmed.to_string()),
            other => other,
        };
    }

    match parse_magnitude(trimmed) {
        Some(n) => CellValue::Number(n),
        None => CellValue::Invalid(trimmed.to_string()),
    }
}

fn parse_magnitude(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '%') && !c.is_whitespace())
        .collect();

    if let Some(inner) = strip_wrapping(&cleaned, '(', ')') {
        return parse_magnitude(inner).map(|n| -n);
    }

    let n: f64 = cleaned.parse().ok()?;
    if n.is_finite() {
        Some(n)
    } else {
        None
    }
}

fn strip_wrapping(text: &str, open: char, close: char) -> Option<&str> {
    if text.len() >= 2 && text.starts_with(open) && text.ends_with(close) {
        Some(&text[open.len_utf8()..text.len() - close.len_utf8()])
    } else {
        None
    }
}

/// Renders a value for display next to its unit, e.g. `$1,234`, `12.5%`.
pub fn format_value(value: f64, unit: Unit) -> String {
    match unit {
        Unit::Currency => {
            let rounded = value.round();
            let body = group_thousands(rounded.abs() as u64);
            if rounded < 0.0 {
                format!("(${})", body)
            } else {
                format!("${}", body)
            }
        }
        Unit::Percentage => format!("{}%", trim_decimal(value)),
        Unit::Ratio => format!("{:.2}", value),
        Unit::Number => trim_decimal(value),
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

fn trim_decimal(value: f64) -> String {
    let text = if value.fract() == 0.0 {
        format!("{}", value)
    } else {
        let s = format!("{:.2}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    };
    if text == "-0" {
        "0".to_string()
    } else {
        text
    }
}
