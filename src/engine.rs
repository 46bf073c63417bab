use crate::classifier::classify_record;
use crate::error::Result;
use crate::overrides::{PolicyOverrides, PolicyResolver, ResolvedPolicies};
use crate::schema::{
    AggregationPolicy, Granularity, InvalidCellPolicy, MetricRecord, MetricsConfig, Period,
    PolicySource, Unit,
};
use crate::utils::{csv_field, fiscal_quarter_for_period, fiscal_year_for_period, month_abbrev};
use crate::value::CellValue;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Label of a rollup bucket plus the numeric key it sorts by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub label: String,
    pub year: i32,
    /// Position within the year: month (1-12), quarter (1-4) or 0 for a year.
    pub index: u32,
}

impl GroupKey {
    pub fn new(label: impl Into<String>, year: i32, index: u32) -> Self {
        Self {
            label: label.into(),
            year,
            index,
        }
    }
}

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.year, self.index, &self.label).cmp(&(other.year, other.index, &other.label))
    }
}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Assigns each month to a rollup bucket.
pub trait PeriodGrouping {
    fn group_key(&self, period: Period) -> GroupKey;
}

impl<F> PeriodGrouping for F
where
    F: Fn(Period) -> GroupKey,
{
    fn group_key(&self, period: Period) -> GroupKey {
        self(period)
    }
}

/// Calendar-or-fiscal grouping by month, quarter or year.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grouping {
    pub granularity: Granularity,
    pub fiscal_year_end_month: u32,
}

impl Grouping {
    pub fn new(granularity: Granularity, fiscal_year_end_month: u32) -> Self {
        Self {
            granularity,
            fiscal_year_end_month,
        }
    }

    pub fn monthly() -> Self {
        Self::new(Granularity::Month, 12)
    }

    pub fn quarterly() -> Self {
        Self::new(Granularity::Quarter, 12)
    }
}

impl PeriodGrouping for Grouping {
    fn group_key(&self, period: Period) -> GroupKey {
        match self.granularity {
            Granularity::Month => GroupKey::new(
                format!("{} {}", month_abbrev(period.month), period.year),
                period.year,
                period.month,
            ),
            Granularity::Quarter => {
                let year = fiscal_year_for_period(period, self.fiscal_year_end_month);
                let quarter = fiscal_quarter_for_period(period, self.fiscal_year_end_month);
                GroupKey::new(format!("Q{} {}", quarter, year), year, quarter)
            }
            Granularity::Year => {
                let year = fiscal_year_for_period(period, self.fiscal_year_end_month);
                GroupKey::new(format!("FY{}", year), year, 0)
            }
        }
    }
}

/// A cell that could not be read as a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidCell {
    pub uid: String,
    pub period: Period,
    pub raw: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateTable {
    /// Group labels in chronological order.
    pub groups: Vec<String>,
    /// Metric uids in source order.
    pub metrics: Vec<String>,
    pub table: BTreeMap<String, BTreeMap<String, f64>>,
    pub policy_used: BTreeMap<String, AggregationPolicy>,
    pub policy_sources: BTreeMap<String, PolicySource>,
    pub invalid_cells: Vec<InvalidCell>,
}

impl AggregateTable {
    pub fn get(&self, group: &str, uid: &str) -> Option<f64> {
        self.table.get(group)?.get(uid).copied()
    }

    pub fn row(&self, group: &str) -> Option<&BTreeMap<String, f64>> {
        self.table.get(group)
    }

    /// One metric across all groups, in chronological order.
    pub fn series(&self, uid: &str) -> Vec<(&str, Option<f64>)> {
        self.groups
            .iter()
            .map(|group| (group.as_str(), self.get(group, uid)))
            .collect()
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::from("UID,Policy");
        for group in &self.groups {
            output.push(',');
            output.push_str(&csv_field(group));
        }
        output.push('\n');

        for uid in &self.metrics {
            let policy = self
                .policy_used
                .get(uid)
                .map(AggregationPolicy::as_str)
                .unwrap_or("");
            output.push_str(&format!("{},{}", csv_field(uid), policy));
            for group in &self.groups {
                match self.get(group, uid) {
                    Some(value) => output.push_str(&format!(",{}", value)),
                    None => output.push(','),
                }
            }
            output.push('\n');
        }

        output
    }
}

pub struct Aggregator {
    invalid_cells: InvalidCellPolicy,
    currency_divisor: f64,
    round_currency: bool,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self {
            invalid_cells: InvalidCellPolicy::ZeroFill,
            currency_divisor: 1000.0,
            round_currency: true,
        }
    }
}

impl Aggregator {
    pub fn new(
        invalid_cells: InvalidCellPolicy,
        currency_divisor: f64,
        round_currency: bool,
    ) -> Self {
        Self {
            invalid_cells,
            currency_divisor,
            round_currency,
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            config.invalid_cells,
            config.currency_divisor,
            config.round_currency,
        ))
    }

    /// Rolls every record up into the buckets produced by `grouping`.
    ///
    /// Records without an entry in `policies` fall back to the classifier.
    /// Inputs are not modified.
    pub fn aggregate<G: PeriodGrouping + ?Sized>(
        &self,
        records: &[MetricRecord],
        period_axis: &[Period],
        policies: &ResolvedPolicies,
        grouping: &G,
    ) -> AggregateTable {
        let keys: Vec<GroupKey> = period_axis.iter().map(|p| grouping.group_key(*p)).collect();

        // visit months chronologically even if the header was out of order
        let mut order: Vec<usize> = (0..period_axis.len()).collect();
        order.sort_by_key(|&i| period_axis[i]);

        let mut sorted_keys = keys.clone();
        sorted_keys.sort();
        sorted_keys.dedup();

        let mut output = AggregateTable {
            groups: sorted_keys.iter().map(|k| k.label.clone()).collect(),
            table: sorted_keys
                .iter()
                .map(|k| (k.label.clone(), BTreeMap::new()))
                .collect(),
            ..AggregateTable::default()
        };

        for record in records {
            let (policy, source) = match policies.get(&record.uid) {
                Some(policy) => (
                    policy,
                    policies
                        .sources
                        .get(&record.uid)
                        .copied()
                        .unwrap_or(PolicySource::Override),
                ),
                None => (classify_record(record), PolicySource::Heuristic),
            };

            if output.policy_used.contains_key(&record.uid) {
                // a repeated uid replaces the earlier row entirely
                warn!(
                    "Metric uid '{}' appears more than once; keeping the last row",
                    record.uid
                );
                for row in output.table.values_mut() {
                    row.remove(&record.uid);
                }
            }

            let cells = record.cells(period_axis.len());
            let mut buckets: BTreeMap<&GroupKey, Vec<f64>> = BTreeMap::new();

            for &idx in &order {
                let bucket = buckets.entry(&keys[idx]).or_default();
                match &cells[idx] {
                    CellValue::Number(n) => bucket.push(*n),
                    CellValue::Invalid(raw) => {
                        warn!(
                            "Metric {} has unparseable value '{}' for {}",
                            record.uid, raw, period_axis[idx]
                        );
                        output.invalid_cells.push(InvalidCell {
                            uid: record.uid.clone(),
                            period: period_axis[idx],
                            raw: raw.clone(),
                        });
                        if self.invalid_cells == InvalidCellPolicy::ZeroFill {
                            bucket.push(0.0);
                        }
                    }
                    CellValue::Missing => {
                        if self.invalid_cells == InvalidCellPolicy::ZeroFill {
                            bucket.push(0.0);
                        }
                    }
                }
            }

            for (key, values) in buckets {
                if let Some(reduced) = policy.reduce(&values) {
                    let value = self.scale(reduced, record.unit);
                    output
                        .table
                        .entry(key.label.clone())
                        .or_default()
                        .insert(record.uid.clone(), value);
                }
            }

            if !output.policy_used.contains_key(&record.uid) {
                output.metrics.push(record.uid.clone());
            }
            output.policy_used.insert(record.uid.clone(), policy);
            output.policy_sources.insert(record.uid.clone(), source);
        }

        debug!(
            "Aggregated {} metrics into {} groups",
            output.metrics.len(),
            output.groups.len()
        );

        output
    }

    /// Currency is reported in thousands.
    fn scale(&self, value: f64, unit: Unit) -> f64 {
        if !unit.is_currency() {
            return value;
        }
        let scaled = value / self.currency_divisor;
        let scaled = if self.round_currency {
            scaled.round()
        } else {
            scaled
        };
        // avoid -0 in output
        scaled + 0.0
    }
}

/// Lenient rollup with default settings: overrides win, the classifier fills
/// in the rest, bad cells count as zero, currency in thousands.
pub fn aggregate<G: PeriodGrouping + ?Sized>(
    records: &[MetricRecord],
    period_axis: &[Period],
    overrides: Option<&PolicyOverrides>,
    grouping: &G,
) -> AggregateTable {
    let empty = PolicyOverrides::new();
    let resolver = PolicyResolver::new(overrides.unwrap_or(&empty));

    let mut policies = ResolvedPolicies::default();
    for record in records {
        let (policy, source) = resolver.resolve(record);
        policies.policies.insert(record.uid.clone(), policy);
        policies.sources.insert(record.uid.clone(), source);
    }

    Aggregator::default().aggregate(records, period_axis, &policies, grouping)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(year: i32, month: u32) -> Period {
        Period { year, month }
    }

    fn record(uid: &str, name: &str, unit: Unit, values: &[&str]) -> MetricRecord {
        MetricRecord {
            uid: uid.to_string(),
            group: "Operations".to_string(),
            category: "Plant".to_string(),
            metric_type: "Actual".to_string(),
            name: name.to_string(),
            unit,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn q1_axis() -> Vec<Period> {
        vec![p(2025, 1), p(2025, 2), p(2025, 3)]
    }

    fn pinned(uid: &str, policy: AggregationPolicy) -> PolicyOverrides {
        let mut overrides = PolicyOverrides::new();
        overrides.insert(uid, policy);
        overrides
    }

    #[test]
    fn test_policy_reductions_over_a_quarter() {
        let records = vec![record("1", "Output", Unit::Number, &["10", "20", "30"])];
        let axis = q1_axis();

        for (policy, expected) in [
            (AggregationPolicy::Average, 20.0),
            (AggregationPolicy::Sum, 60.0),
            (AggregationPolicy::EndOfPeriod, 30.0),
        ] {
            let overrides = pinned("1", policy);
            let result = aggregate(&records, &axis, Some(&overrides), &Grouping::quarterly());
            assert_eq!(result.groups, vec!["Q1 2025"]);
            assert_eq!(result.get("Q1 2025", "1"), Some(expected), "{}", policy);
        }
    }

    #[test]
    fn test_currency_reported_in_thousands() {
        let records = vec![record(
            "1",
            "Net Sales",
            Unit::Currency,
            &["\"$1,200\"", "$2,300 ", "($400)"],
        )];
        let result = aggregate(&records, &q1_axis(), None, &Grouping::quarterly());

        assert_eq!(result.policy_used["1"], AggregationPolicy::Sum);
        assert_eq!(result.get("Q1 2025", "1"), Some(3.0));
    }

    #[test]
    fn test_groups_sort_chronologically() {
        let axis = vec![
            p(2024, 10),
            p(2024, 11),
            p(2024, 12),
            p(2025, 1),
            p(2025, 4),
            p(2025, 10),
        ];
        let records = vec![record("1", "Output", Unit::Number, &["1", "2", "3", "4", "5", "6"])];

        let quarterly = aggregate(&records, &axis, None, &Grouping::quarterly());
        assert_eq!(quarterly.groups, vec!["Q4 2024", "Q1 2025", "Q2 2025", "Q4 2025"]);

        let monthly = aggregate(&records, &axis, None, &Grouping::monthly());
        assert_eq!(
            monthly.groups,
            vec!["Oct 2024", "Nov 2024", "Dec 2024", "Jan 2025", "Apr 2025", "Oct 2025"]
        );
        assert_eq!(monthly.get("Apr 2025", "1"), Some(5.0));
        assert_eq!(
            quarterly.series("1"),
            vec![
                ("Q4 2024", Some(3.0)),
                ("Q1 2025", Some(4.0)),
                ("Q2 2025", Some(5.0)),
                ("Q4 2025", Some(6.0)),
            ]
        );
    }

    #[test]
    fn test_fiscal_year_grouping() {
        let axis = vec![p(2024, 6), p(2024, 7), p(2025, 6)];
        let records = vec![record("1", "Output", Unit::Number, &["1", "2", "3"])];
        let overrides = pinned("1", AggregationPolicy::Sum);

        let yearly = aggregate(
            &records,
            &axis,
            Some(&overrides),
            &Grouping::new(Granularity::Year, 6),
        );
        assert_eq!(yearly.groups, vec!["FY2024", "FY2025"]);
        assert_eq!(yearly.get("FY2024", "1"), Some(1.0));
        assert_eq!(yearly.get("FY2025", "1"), Some(5.0));
    }

    #[test]
    fn test_end_of_period_uses_latest_month_even_if_header_unordered() {
        let axis = vec![p(2025, 3), p(2025, 1), p(2025, 2)];
        let records = vec![record("1", "Headcount", Unit::Number, &["30", "10", "20"])];

        let result = aggregate(&records, &axis, None, &Grouping::quarterly());
        assert_eq!(result.policy_used["1"], AggregationPolicy::EndOfPeriod);
        assert_eq!(result.get("Q1 2025", "1"), Some(30.0));
    }

    #[test]
    fn test_invalid_cells_zero_fill_vs_skip() {
        let records = vec![record("1", "Scrap Rate", Unit::Percentage, &["10", "n/a", "30"])];
        let axis = q1_axis();
        let policies = ResolvedPolicies::default();

        let lenient =
            Aggregator::default().aggregate(&records, &axis, &policies, &Grouping::quarterly());
        assert_eq!(lenient.get("Q1 2025", "1"), Some(40.0 / 3.0));
        assert_eq!(lenient.invalid_cells.len(), 1);
        assert_eq!(lenient.invalid_cells[0].raw, "n/a");
        assert_eq!(lenient.invalid_cells[0].period, p(2025, 2));

        let skipping = Aggregator::new(InvalidCellPolicy::Skip, 1000.0, true);
        let strict = skipping.aggregate(&records, &axis, &policies, &Grouping::quarterly());
        assert_eq!(strict.get("Q1 2025", "1"), Some(20.0));
    }

    #[test]
    fn test_truncated_row_missing_cells() {
        let records = vec![record("1", "Output", Unit::Number, &["10"])];
        let axis = vec![p(2025, 1), p(2025, 4)];
        let overrides = pinned("1", AggregationPolicy::Sum);
        let mut policies = ResolvedPolicies::default();
        policies.policies.extend(overrides.as_map().clone());

        let filled =
            Aggregator::default().aggregate(&records, &axis, &policies, &Grouping::quarterly());
        assert_eq!(filled.get("Q2 2025", "1"), Some(0.0));
        assert!(filled.invalid_cells.is_empty());

        let skipped = Aggregator::new(InvalidCellPolicy::Skip, 1000.0, true)
            .aggregate(&records, &axis, &policies, &Grouping::quarterly());
        assert_eq!(skipped.get("Q1 2025", "1"), Some(10.0));
        assert_eq!(skipped.get("Q2 2025", "1"), None);
        assert!(skipped.row("Q2 2025").unwrap().is_empty());
    }

    #[test]
    fn test_custom_grouping_closure() {
        let half_year = |period: Period| {
            let half = if period.month <= 6 { 1 } else { 2 };
            GroupKey::new(format!("H{} {}", half, period.year), period.year, half)
        };
        let axis = vec![p(2025, 5), p(2025, 6), p(2025, 7)];
        let records = vec![record("1", "Output", Unit::Number, &["1", "2", "3"])];
        let overrides = pinned("1", AggregationPolicy::Sum);

        let result = aggregate(&records, &axis, Some(&overrides), &half_year);
        assert_eq!(result.groups, vec!["H1 2025", "H2 2025"]);
        assert_eq!(result.get("H1 2025", "1"), Some(3.0));
    }

    #[test]
    fn test_aggregate_is_repeatable_and_leaves_input_alone() {
        let records = vec![
            record("1", "Net Sales", Unit::Currency, &["$1,000", "$2,000", "$3,000"]),
            record("2", "Headcount", Unit::Number, &["5", "6", "7"]),
        ];
        let snapshot = records.clone();
        let axis = q1_axis();

        let first = aggregate(&records, &axis, None, &Grouping::quarterly());
        let second = aggregate(&records, &axis, None, &Grouping::quarterly());
        assert_eq!(first, second);
        assert_eq!(records, snapshot);
        assert_eq!(first.metrics, vec!["1", "2"]);
    }

    #[test]
    fn test_to_csv() {
        let records = vec![record("1", "Output", Unit::Number, &["1", "2", "3"])];
        let overrides = pinned("1", AggregationPolicy::Sum);
        let result = aggregate(&records, &q1_axis(), Some(&overrides), &Grouping::monthly());

        assert_eq!(
            result.to_csv(),
            "UID,Policy,Jan 2025,Feb 2025,Mar 2025\n1,sum,1,2,3\n"
        );
    }

    #[test]
    fn test_to_csv_quotes_commas_in_uids_and_labels() {
        let parsed = crate::ingestion::parse_metrics_csv(
            "uid,g,c,t,n,u,1/1/2025,2/1/2025\n\"A,1\",Ops,Plant,Actual,Output,#,1,2\n",
        )
        .unwrap();
        assert_eq!(parsed.records[0].uid, "A,1");

        let labelled = |period: Period| {
            GroupKey::new(
                format!("{}, {}", month_abbrev(period.month), period.year),
                period.year,
                period.month,
            )
        };
        let csv = aggregate(&parsed.records, &parsed.period_axis, None, &labelled).to_csv();

        let lines: Vec<Vec<String>> = csv
            .lines()
            .map(|line| {
                crate::ingestion::split_csv_line(line)
                    .iter()
                    .map(|f| crate::ingestion::unquote(f))
                    .collect()
            })
            .collect();
        assert_eq!(lines[0], vec!["UID", "Policy", "Jan, 2025", "Feb, 2025"]);
        assert_eq!(lines[1], vec!["A,1", "end-of-period", "1", "2"]);
    }

    #[test]
    fn test_repeated_uid_keeps_only_the_last_row() {
        let records = vec![
            record("1", "Output", Unit::Number, &["10", "20", "30"]),
            record("1", "Headcount", Unit::Number, &["5"]),
        ];
        let mut policies = ResolvedPolicies::default();
        policies.policies.insert("1".to_string(), AggregationPolicy::Sum);
        let axis = vec![p(2025, 1), p(2025, 4), p(2025, 7)];

        let result = Aggregator::new(InvalidCellPolicy::Skip, 1000.0, true).aggregate(
            &records,
            &axis,
            &policies,
            &Grouping::quarterly(),
        );
        assert_eq!(result.metrics, vec!["1"]);
        assert_eq!(result.get("Q1 2025", "1"), Some(5.0));
        assert_eq!(result.get("Q2 2025", "1"), None);
        assert_eq!(result.get("Q3 2025", "1"), None);
    }

    #[test]
    fn test_negative_currency_rounding_has_no_negative_zero() {
        let records = vec![record("1", "Net Sales", Unit::Currency, &["(400)"])];
        let result = aggregate(&records, &[p(2025, 1)], None, &Grouping::monthly());
        let value = result.get("Jan 2025", "1").unwrap();
        assert_eq!(value, 0.0);
        assert!(value.is_sign_positive());
    }
}
