use crate::error::{MetricsError, Result};
use crate::utils::last_day_of_month;
use crate::value::{parse_cell, CellValue};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unit tag carried in column 5 of every metric row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Unit {
    #[serde(rename = "$")]
    #[schemars(description = "Monetary amount in dollars. Rolled up values are reported in thousands.")]
    Currency,

    #[serde(rename = "%")]
    #[schemars(description = "Percentage value, averaged across a period.")]
    Percentage,

    #[serde(rename = "ratio")]
    #[schemars(description = "Dimensionless ratio, averaged across a period.")]
    Ratio,

    #[serde(rename = "number")]
    #[schemars(description = "Plain count or quantity (headcount, units, incidents).")]
    Number,
}

impl Unit {
    /// Maps the raw unit cell onto a tag. Anything that is not `$`, `%` or
    /// `ratio` is treated as a plain number.
    pub fn from_label(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "$" => Unit::Currency,
            "%" => Unit::Percentage,
            _ if trimmed.eq_ignore_ascii_case("ratio") => Unit::Ratio,
            _ => Unit::Number,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Unit::Currency => "$",
            Unit::Percentage => "%",
            Unit::Ratio => "ratio",
            Unit::Number => "number",
        }
    }

    pub fn is_currency(&self) -> bool {
        matches!(self, Unit::Currency)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A calendar month, the granularity of the period axis.
///
/// Ordering is chronological: year first, then month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(MetricsError::DateError(format!(
                "Month {} out of range in period {}-{}",
                month, year, month
            )));
        }
        Ok(Self { year, month })
    }

    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Last calendar day of the month.
    pub fn end_date(&self) -> Option<NaiveDate> {
        last_day_of_month(self.year, self.month)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = MetricsError;

    /// Accepts only canonical `YYYY-MM` keys.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            MetricsError::DateError(format!("Invalid period key '{}'. Expected YYYY-MM", s))
        };

        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4
            || month.len() != 2
            || !year.bytes().all(|b| b.is_ascii_digit())
            || !month.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }

        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Period::new(year, month)
    }
}

impl Serialize for Period {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Ordered month keys derived once per CSV load.
pub type PeriodAxis = Vec<Period>;

/// The 4-level classification path of a metric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MetricPath {
    pub group: String,
    pub category: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub name: String,
}

impl fmt::Display for MetricPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} > {} > {} > {}",
            self.group, self.category, self.metric_type, self.name
        )
    }
}

/// One data row of the source CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub uid: String,
    pub group: String,
    pub category: String,
    #[serde(rename = "type")]
    pub metric_type: String,
    pub name: String,
    pub unit: Unit,
    /// Raw cell text, one per period column. Shorter than the axis only when
    /// the source row was truncated.
    pub values: Vec<String>,
}

impl MetricRecord {
    pub fn path(&self) -> MetricPath {
        MetricPath {
            group: self.group.clone(),
            category: self.category.clone(),
            metric_type: self.metric_type.clone(),
            name: self.name.clone(),
        }
    }

    /// Parses every cell, padding with `Missing` up to `axis_len`.
    pub fn cells(&self, axis_len: usize) -> Vec<CellValue> {
        (0..axis_len)
            .map(|idx| match self.values.get(idx) {
                Some(raw) => parse_cell(raw),
                None => CellValue::Missing,
            })
            .collect()
    }

    /// Lenient numeric view: invalid and missing cells become zero.
    pub fn numeric_series(&self, axis_len: usize) -> Vec<f64> {
        self.cells(axis_len).iter().map(CellValue::or_zero).collect()
    }

    pub fn is_truncated(&self, axis_len: usize) -> bool {
        self.values.len() < axis_len
    }
}

/// How monthly values roll up into a coarser period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum AggregationPolicy {
    #[schemars(description = "Flow metric: the rollup is the arithmetic sum of the months.")]
    Sum,

    #[schemars(description = "Rate metric: the rollup is the arithmetic mean of the months.")]
    Average,

    #[serde(alias = "end_of_period", alias = "snapshot")]
    #[schemars(description = "Point-in-time balance: the rollup is the latest month in the period.")]
    EndOfPeriod,
}

impl AggregationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPolicy::Sum => "sum",
            AggregationPolicy::Average => "average",
            AggregationPolicy::EndOfPeriod => "end-of-period",
        }
    }

    /// Reduces a chronologically ordered list of values. `None` for an empty list.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        match self {
            AggregationPolicy::Sum => Some(values.iter().sum()),
            AggregationPolicy::Average => Some(values.iter().sum::<f64>() / values.len() as f64),
            AggregationPolicy::EndOfPeriod => values.last().copied(),
        }
    }
}

impl fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationPolicy {
    type Err = MetricsError;

    /// Accepts exactly the names the serde representation does, so override
    /// maps and config files agree on spelling.
    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| MetricsError::InvalidPolicy(s.to_string()))
    }
}

/// Where a metric's policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Override,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[schemars(description = "One group per month, labelled like 'Mar 2025'.")]
    Month,

    #[default]
    #[schemars(description = "Fiscal quarters, labelled like 'Q1 2025'.")]
    Quarter,

    #[schemars(description = "Fiscal years, labelled like 'FY2025'.")]
    Year,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InvalidCellPolicy {
    #[default]
    #[schemars(description = "Unparseable or missing cells count as 0.")]
    ZeroFill,

    #[schemars(description = "Unparseable or missing cells are left out of the rollup.")]
    Skip,
}

fn default_fiscal_year_end_month() -> u32 {
    12
}

fn default_currency_divisor() -> f64 {
    1000.0
}

fn default_round_currency() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricsConfig {
    #[serde(default)]
    #[schemars(description = "Span that monthly values are rolled up into.")]
    pub granularity: Granularity,

    #[serde(default = "default_fiscal_year_end_month")]
    #[schemars(
        description = "The month when the fiscal year ends (1 = January, 12 = December). Quarters and years are counted from the month after."
    )]
    pub fiscal_year_end_month: u32,

    #[serde(default)]
    #[schemars(
        description = "Explicit aggregation policy per metric uid. Always wins over the name-based classifier."
    )]
    pub policy_overrides: BTreeMap<String, AggregationPolicy>,

    #[serde(default)]
    #[schemars(
        description = "If true, every metric must have an entry in policy_overrides; the classifier is never used to decide a rollup."
    )]
    pub require_explicit_policies: bool,

    #[serde(default)]
    #[schemars(description = "How unparseable or missing cells take part in a rollup.")]
    pub invalid_cells: InvalidCellPolicy,

    #[serde(default = "default_currency_divisor")]
    #[schemars(description = "Currency rollups are divided by this (1000 reports in thousands).")]
    pub currency_divisor: f64,

    #[serde(default = "default_round_currency")]
    #[schemars(description = "Round scaled currency rollups to the nearest integer.")]
    pub round_currency: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            granularity: Granularity::default(),
            fiscal_year_end_month: default_fiscal_year_end_month(),
            policy_overrides: BTreeMap::new(),
            require_explicit_policies: false,
            invalid_cells: InvalidCellPolicy::default(),
            currency_divisor: default_currency_divisor(),
            round_currency: default_round_currency(),
        }
    }
}

impl MetricsConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: MetricsConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        crate::utils::validate_fiscal_year_end_month(self.fiscal_year_end_month)?;
        if !self.currency_divisor.is_finite() || self.currency_divisor <= 0.0 {
            return Err(MetricsError::InvalidCurrencyDivisor(self.currency_divisor));
        }
        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MetricsConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_generation() {
        let schema_json = MetricsConfig::schema_as_json().unwrap();
        assert!(schema_json.contains("granularity"));
        assert!(schema_json.contains("policy_overrides"));
        assert!(schema_json.contains("fiscal_year_end_month"));
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config = MetricsConfig::from_json("{}").unwrap();
        assert_eq!(config.granularity, Granularity::Quarter);
        assert_eq!(config.fiscal_year_end_month, 12);
        assert_eq!(config.currency_divisor, 1000.0);
        assert!(config.round_currency);
        assert!(config.policy_overrides.is_empty());
    }

    #[test]
    fn test_config_rejects_bad_fiscal_month() {
        let err = MetricsConfig::from_json(r#"{"fiscal_year_end_month": 13}"#).unwrap_err();
        assert!(matches!(err, MetricsError::InvalidFiscalYearEndMonth(13)));
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("sum".parse::<AggregationPolicy>().unwrap(), AggregationPolicy::Sum);
        assert_eq!(
            "end_of_period".parse::<AggregationPolicy>().unwrap(),
            AggregationPolicy::EndOfPeriod
        );
        for name in ["median", "avg", "mean", "Sum"] {
            assert!(matches!(
                name.parse::<AggregationPolicy>(),
                Err(MetricsError::InvalidPolicy(_))
            ));
        }

        let policy: AggregationPolicy = serde_json::from_str("\"end-of-period\"").unwrap();
        assert_eq!(policy, AggregationPolicy::EndOfPeriod);
    }

    #[test]
    fn test_config_and_override_maps_accept_the_same_names() {
        for name in ["sum", "average", "end-of-period", "snapshot", "avg"] {
            let json = format!(r#"{{"8": "{}"}}"#, name);
            let from_overrides = crate::overrides::PolicyOverrides::from_json(&json).ok();
            let from_config =
                MetricsConfig::from_json(&format!(r#"{{"policy_overrides": {}}}"#, json))
                    .ok()
                    .and_then(|config| config.policy_overrides.get("8").copied());
            assert_eq!(
                from_overrides.and_then(|o| o.get("8")),
                from_config,
                "policy name {:?}",
                name
            );
        }
    }

    #[test]
    fn test_policy_reduce() {
        let values = [10.0, 20.0, 30.0];
        assert_eq!(AggregationPolicy::Sum.reduce(&values), Some(60.0));
        assert_eq!(AggregationPolicy::Average.reduce(&values), Some(20.0));
        assert_eq!(AggregationPolicy::EndOfPeriod.reduce(&values), Some(30.0));
        assert_eq!(AggregationPolicy::Sum.reduce(&[]), None);
    }

    #[test]
    fn test_period_parse_and_order() {
        let march: Period = "2025-03".parse().unwrap();
        assert_eq!(march, Period { year: 2025, month: 3 });
        assert_eq!(march.to_string(), "2025-03");
        assert!(Period { year: 2024, month: 12 } < march);
        assert!("2025-3".parse::<Period>().is_err());
        assert!("2025-13".parse::<Period>().is_err());
        assert!("Total".parse::<Period>().is_err());
    }

    #[test]
    fn test_unit_from_label() {
        assert_eq!(Unit::from_label("$"), Unit::Currency);
        assert_eq!(Unit::from_label(" % "), Unit::Percentage);
        assert_eq!(Unit::from_label("Ratio"), Unit::Ratio);
        assert_eq!(Unit::from_label("#"), Unit::Number);
        assert_eq!(serde_json::to_string(&Unit::Currency).unwrap(), "\"$\"");
    }

    #[test]
    fn test_record_cells_pad_truncated_rows() {
        let record = MetricRecord {
            uid: "1".to_string(),
            group: "Financial".to_string(),
            category: "Income".to_string(),
            metric_type: "Revenue".to_string(),
            name: "Net Sales".to_string(),
            unit: Unit::Currency,
            values: vec!["\"$1,000\"".to_string(), "n/a".to_string()],
        };

        assert!(record.is_truncated(3));
        assert_eq!(
            record.cells(3),
            vec![
                CellValue::Number(1000.0),
                CellValue::Invalid("n/a".to_string()),
                CellValue::Missing,
            ]
        );
        assert_eq!(record.numeric_series(3), vec![1000.0, 0.0, 0.0]);
    }
}
