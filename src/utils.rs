use crate::error::{MetricsError, Result};
use crate::schema::Period;
use chrono::{Datelike, Days, NaiveDate};

/// Day zero of spreadsheet serial dates (serial 25569 is 1970-01-01).
const SERIAL_DATE_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Normalizes a period header cell to `YYYY-MM`.
///
/// Accepts `M/D/YYYY` text and spreadsheet serial dates (integers above 1000).
/// Anything else is returned trimmed but otherwise unchanged.
pub fn normalize_date(raw: &str) -> String {
    let trimmed = raw.trim();

    if let Some((year, month)) = parse_month_day_year(trimmed) {
        return format!("{:04}-{:02}", year, month);
    }

    if let Some(date) = parse_serial_date(trimmed) {
        return format!("{:04}-{:02}", date.year(), date.month());
    }

    trimmed.to_string()
}

/// Like [`normalize_date`], but only succeeds for headers that end up as a
/// canonical month key.
pub fn normalize_period(raw: &str) -> Option<Period> {
    normalize_date(raw).parse().ok()
}

fn parse_month_day_year(text: &str) -> Option<(i32, u32)> {
    let mut parts = text.split('/');
    let month = parts.next()?;
    let day = parts.next()?;
    let year = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    let is_digits = |s: &str, min: usize, max: usize| {
        (min..=max).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
    };
    if !is_digits(month, 1, 2) || !is_digits(day, 1, 2) || !is_digits(year, 4, 4) {
        return None;
    }

    let month: u32 = month.parse().ok()?;
    let year: i32 = year.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some((year, month))
}

fn parse_serial_date(text: &str) -> Option<NaiveDate> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let serial: u64 = text.parse().ok()?;
    if serial <= 1000 {
        return None;
    }
    let (y, m, d) = SERIAL_DATE_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(serial))
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let next_month = if month == 12 { 1 } else { month + 1 };
    let next_year = if month == 12 { year + 1 } else { year };

    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.checked_sub_days(Days::new(1))
}

pub fn validate_fiscal_year_end_month(month: u32) -> Result<()> {
    if !(1..=12).contains(&month) {
        return Err(MetricsError::InvalidFiscalYearEndMonth(month));
    }
    Ok(())
}

pub fn months_between(start: Period, end: Period) -> i32 {
    let year_diff = end.year - start.year;
    let month_diff = end.month as i32 - start.month as i32;
    year_diff * 12 + month_diff
}

/// True when every period is exactly one month after its predecessor.
pub fn is_contiguous(axis: &[Period]) -> bool {
    axis.windows(2).all(|w| months_between(w[0], w[1]) == 1)
}

/// Returns the 0-based index of the month within the fiscal year.
///
/// # Examples
/// - If FY ends in Dec (12): Jan=0, Feb=1, ..., Dec=11
/// - If FY ends in June (6): July=0, Aug=1, ..., June=11
pub fn get_fiscal_month_index(calendar_month: u32, fiscal_year_end_month: u32) -> usize {
    let fy_start_month = if fiscal_year_end_month == 12 {
        1
    } else {
        fiscal_year_end_month + 1
    };

    if calendar_month >= fy_start_month {
        (calendar_month - fy_start_month) as usize
    } else {
        (calendar_month + 12 - fy_start_month) as usize
    }
}

/// The fiscal year a month belongs to, named after the calendar year in which
/// that fiscal year ends.
pub fn fiscal_year_for_period(period: Period, fiscal_year_end_month: u32) -> i32 {
    if period.month <= fiscal_year_end_month {
        period.year
    } else {
        period.year + 1
    }
}

/// Fiscal quarter (1-4) of a month.
pub fn fiscal_quarter_for_period(period: Period, fiscal_year_end_month: u32) -> u32 {
    (get_fiscal_month_index(period.month, fiscal_year_end_month) / 3) as u32 + 1
}

pub fn month_abbrev(month: u32) -> &'static str {
    const NAMES: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    NAMES
        .get(month.wrapping_sub(1) as usize)
        .copied()
        .unwrap_or("???")
}

/// Quotes a CSV field when it contains a comma or a quote.
pub fn csv_field(text: &str) -> String {
    if text.contains(',') || text.contains('"') {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}
