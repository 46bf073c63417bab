//! Name-based guess of how a metric should roll up.
//!
//! This is a fallback. Explicit per-uid policies in the config always win, and
//! [`suggest_policies`] exists so the guesses can be reviewed and pinned.

use crate::schema::{AggregationPolicy, MetricRecord, Unit};
use std::collections::BTreeMap;

/// Names that describe a balance or level at a point in time.
const POINT_IN_TIME_KEYWORDS: &[&str] = &[
    "balance",
    "cash",
    "inventory",
    "assets",
    "liabilities",
    "equity",
    "employees",
    "headcount",
    "staff",
    "outstanding",
    "turnover",
    "followers",
    "customers",
    "ratio",
    "rate",
    "compliance",
    "uptime",
    "satisfaction",
    "incidents",
    "findings",
    "consumption",
    "generated",
];

/// Names or categories that describe activity over a period.
const FLOW_KEYWORDS: &[&str] = &["income", "revenue", "expense", "cost", "cash flow"];

/// Picks an aggregation policy from a metric's name, unit and category.
/// The first matching rule wins:
///
/// 1. percentages, ratios and rate-like names average
/// 2. balance-like names take the end-of-period value
/// 3. income/expense-like names or categories sum
/// 4. otherwise currency sums and everything else takes end-of-period
pub fn classify(name: &str, unit: Unit, category: &str) -> AggregationPolicy {
    let name = name.to_lowercase();
    let category = category.to_lowercase();

    if matches!(unit, Unit::Percentage | Unit::Ratio)
        || name.contains("rate")
        || name.contains("ratio")
    {
        return AggregationPolicy::Average;
    }

    if contains_any(&name, POINT_IN_TIME_KEYWORDS) {
        return AggregationPolicy::EndOfPeriod;
    }

    if contains_any(&category, FLOW_KEYWORDS) || contains_any(&name, FLOW_KEYWORDS) {
        return AggregationPolicy::Sum;
    }

    if unit.is_currency() {
        AggregationPolicy::Sum
    } else {
        AggregationPolicy::EndOfPeriod
    }
}

pub fn classify_record(record: &MetricRecord) -> AggregationPolicy {
    classify(&record.name, record.unit, &record.category)
}

/// Heuristic policy for every record, keyed by uid. Meant to be reviewed and
/// stored as explicit `policy_overrides`.
pub fn suggest_policies(records: &[MetricRecord]) -> BTreeMap<String, AggregationPolicy> {
    records
        .iter()
        .map(|r| (r.uid.clone(), classify_record(r)))
        .collect()
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}
