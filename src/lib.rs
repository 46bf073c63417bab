//! # Ops Metrics Builder
//!
//! A library for turning the monthly operational/financial metrics export used
//! by the dashboard into a normalized model and period rollups.
//!
//! ## Core Concepts
//!
//! - **Metric Record**: one CSV row, `uid, group, category, type, name, unit`
//!   followed by one raw cell per month
//! - **Period Axis**: the `YYYY-MM` keys recognized in the header, whether the
//!   header holds `M/D/YYYY` text or spreadsheet serial dates
//! - **Catalog**: the flat record list plus a Group > Category > Type > Name tree
//! - **Aggregation Policy**: `sum` for flows, `average` for rates,
//!   `end-of-period` for balances. Set explicitly per uid, or guessed from the
//!   metric's name and unit
//! - **Lenient Parsing**: short rows are dropped and bad cells read as zero by
//!   default; both are reported rather than raised
//!
//! ## Example
//!
//! ```rust,ignore
//! use ops_metrics_builder::*;
//!
//! let csv = "uid,Group,Category,Type,Name,Unit,1/1/2025,2/1/2025,3/1/2025\n\
//!            1,Financial,Income,Revenue,Net Sales,$,\"$1,000\",\"$2,000\",\"$3,000\"\n";
//!
//! let config = MetricsConfig::from_json(r#"{"granularity": "quarter"}"#).unwrap();
//! let output = MetricsPipeline::run(csv, &config).unwrap();
//!
//! assert_eq!(output.aggregate.get("Q1 2025", "1"), Some(6.0));
//! ```

pub mod catalog;
pub mod classifier;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod overrides;
pub mod schema;
pub mod utils;
pub mod value;

pub use catalog::{CatalogTree, MetricCatalog, MetricLeaf, ShadowedMetric};
pub use classifier::{classify, classify_record, suggest_policies};
pub use engine::{
    aggregate, AggregateTable, Aggregator, GroupKey, Grouping, InvalidCell, PeriodGrouping,
};
pub use error::{MetricsError, Result};
pub use ingestion::{parse_metrics_csv, read_metrics_file, split_csv_line, ParsedMetrics};
pub use overrides::{PolicyOverrides, PolicyResolver, ResolvedPolicies};
pub use schema::*;
pub use utils::{normalize_date, normalize_period};
pub use value::{format_value, parse_cell, parse_value, CellValue};

use log::{debug, info};
use serde::Serialize;
use std::path::Path;

/// Everything one request needs from a loaded CSV.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub period_axis: PeriodAxis,
    pub catalog: MetricCatalog,
    pub aggregate: AggregateTable,
    pub dropped_rows: Vec<usize>,
    pub skipped_headers: Vec<String>,
}

pub struct MetricsPipeline;

impl MetricsPipeline {
    pub fn run(csv_text: &str, config: &MetricsConfig) -> Result<PipelineOutput> {
        Self::run_with_overrides(csv_text, config, &PolicyOverrides::new())
    }

    /// Like [`MetricsPipeline::run`], with per-request overrides layered on top
    /// of the configured ones.
    pub fn run_with_overrides(
        csv_text: &str,
        config: &MetricsConfig,
        request_overrides: &PolicyOverrides,
    ) -> Result<PipelineOutput> {
        config.validate()?;

        let parsed = parse_metrics_csv(csv_text)?;
        info!(
            "Loaded {} metrics over {} periods ({} rows dropped)",
            parsed.records.len(),
            parsed.period_axis.len(),
            parsed.dropped_rows.len()
        );

        let overrides =
            PolicyOverrides::from(config.policy_overrides.clone()).merged_with(request_overrides);
        debug!("{} explicit aggregation policies", overrides.len());

        let policies = PolicyResolver::new(&overrides)
            .require_explicit(config.require_explicit_policies)
            .resolve_all(&parsed.records)?;

        let grouping = Grouping::new(config.granularity, config.fiscal_year_end_month);
        let aggregate = Aggregator::from_config(config)?.aggregate(
            &parsed.records,
            &parsed.period_axis,
            &policies,
            &grouping,
        );

        let ParsedMetrics {
            period_axis,
            records,
            dropped_rows,
            skipped_headers,
        } = parsed;
        let catalog = MetricCatalog::build(records).with_period_axis(period_axis.clone());

        Ok(PipelineOutput {
            period_axis,
            catalog,
            aggregate,
            dropped_rows,
            skipped_headers,
        })
    }

    pub fn run_file(path: impl AsRef<Path>, config: &MetricsConfig) -> Result<PipelineOutput> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::run(&text, config)
    }
}

/// Parses a CSV export straight into a catalog.
pub fn build_catalog(csv_text: &str) -> Result<MetricCatalog> {
    let parsed = parse_metrics_csv(csv_text)?;
    Ok(MetricCatalog::build(parsed.records).with_period_axis(parsed.period_axis))
}
