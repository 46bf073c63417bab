use crate::schema::{MetricPath, MetricRecord, PeriodAxis, Unit};
use crate::utils::csv_field;
use crate::value::{format_value, parse_cell};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Leaf of the Group > Category > Type > Name tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricLeaf {
    pub uid: String,
    pub unit: Unit,
    pub values: Vec<String>,
}

pub type NameLevel = BTreeMap<String, MetricLeaf>;
pub type TypeLevel = BTreeMap<String, NameLevel>;
pub type CategoryLevel = BTreeMap<String, TypeLevel>;
pub type CatalogTree = BTreeMap<String, CategoryLevel>;

/// A record that lost its tree slot to a later record with the same path.
/// It is still present in the flat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowedMetric {
    pub path: MetricPath,
    pub shadowed_uid: String,
    pub winning_uid: String,
}

/// Flat list plus hierarchical view over one loaded CSV. Built once, never
/// mutated afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct MetricCatalog {
    pub period_axis: PeriodAxis,
    pub records: Vec<MetricRecord>,
    pub tree: CatalogTree,
    pub shadowed: Vec<ShadowedMetric>,
    pub duplicate_uids: Vec<String>,
    #[serde(skip)]
    uid_index: HashMap<String, usize>,
}

impl MetricCatalog {
    /// Builds the catalog from records in source order.
    ///
    /// When two records share a full path the later one owns the tree leaf and
    /// the collision is listed in `shadowed`.
    pub fn build(records: Vec<MetricRecord>) -> Self {
        let mut uid_index = HashMap::with_capacity(records.len());
        let mut duplicate_uids = Vec::new();
        let mut by_path: BTreeMap<MetricPath, usize> = BTreeMap::new();
        let mut shadowed = Vec::new();

        for (idx, record) in records.iter().enumerate() {
            // later rows win, matching the aggregate table
            if uid_index.insert(record.uid.clone(), idx).is_some() {
                warn!("Duplicate metric uid '{}'", record.uid);
                duplicate_uids.push(record.uid.clone());
            }

            if let Some(previous) = by_path.insert(record.path(), idx) {
                let shadowed_uid = records[previous].uid.clone();
                warn!(
                    "Metric {} shadows {} at {}",
                    record.uid,
                    shadowed_uid,
                    record.path()
                );
                shadowed.push(ShadowedMetric {
                    path: record.path(),
                    shadowed_uid,
                    winning_uid: record.uid.clone(),
                });
            }
        }

        let mut tree = CatalogTree::new();
        for (path, idx) in by_path {
            let record = &records[idx];
            tree.entry(path.group)
                .or_default()
                .entry(path.category)
                .or_default()
                .entry(path.metric_type)
                .or_default()
                .insert(
                    path.name,
                    MetricLeaf {
                        uid: record.uid.clone(),
                        unit: record.unit,
                        values: record.values.clone(),
                    },
                );
        }

        Self {
            period_axis: PeriodAxis::new(),
            records,
            tree,
            shadowed,
            duplicate_uids,
            uid_index,
        }
    }

    /// Attaches the period axis the record values are aligned with.
    pub fn with_period_axis(mut self, period_axis: PeriodAxis) -> Self {
        self.period_axis = period_axis;
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    pub fn get(&self, uid: &str) -> Option<&MetricRecord> {
        self.uid_index.get(uid).map(|&idx| &self.records[idx])
    }

    pub fn find(
        &self,
        group: &str,
        category: &str,
        metric_type: &str,
        name: &str,
    ) -> Option<&MetricLeaf> {
        self.tree
            .get(group)?
            .get(category)?
            .get(metric_type)?
            .get(name)
    }

    pub fn groups(&self) -> Vec<&str> {
        self.tree.keys().map(String::as_str).collect()
    }

    pub fn categories(&self, group: &str) -> Vec<&str> {
        self.tree
            .get(group)
            .map(|categories| categories.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Records of one group in source order, including shadowed ones.
    pub fn records_in_group(&self, group: &str) -> Vec<&MetricRecord> {
        self.records.iter().filter(|r| r.group == group).collect()
    }

    /// Lenient numeric values for a metric, aligned with the period axis.
    pub fn numeric_series(&self, uid: &str) -> Option<Vec<f64>> {
        let record = self.get(uid)?;
        let len = self.period_axis.len().max(record.values.len());
        Some(record.numeric_series(len))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_csv(&self) -> String {
        let mut output = String::new();
        output.push_str("UID,Group,Category,Type,Name,Unit\n");

        for record in &self.records {
            output.push_str(&format!(
                "{},{},{},{},{},{}\n",
                csv_field(&record.uid),
                csv_field(&record.group),
                csv_field(&record.category),
                csv_field(&record.metric_type),
                csv_field(&record.name),
                record.unit
            ));
        }

        output
    }

    /// Outline of the catalog with each metric's latest value, used as
    /// context for natural-language analysis.
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        output.push_str("# Metric Catalog\n\n");
        if let (Some(first), Some(last)) = (self.period_axis.first(), self.period_axis.last()) {
            output.push_str(&format!(
                "**Periods:** {} to {} ({} months)\n\n",
                first,
                last,
                self.period_axis.len()
            ));
            if let Some(end) = last.end_date() {
                output.push_str(&format!("**Data through:** {}\n\n", end));
            }
        }

        for (group, categories) in &self.tree {
            output.push_str(&format!("## {}\n\n", group));
            for (category, types) in categories {
                output.push_str(&format!("### {}\n\n", category));
                for (metric_type, names) in types {
                    for (name, leaf) in names {
                        let latest = leaf
                            .values
                            .iter()
                            .rev()
                            .find_map(|raw| parse_cell(raw).as_number())
                            .map(|v| format_value(v, leaf.unit))
                            .unwrap_or_else(|| "n/a".to_string());
                        output.push_str(&format!(
                            "- {} / {} [{}]: latest {}\n",
                            metric_type, name, leaf.uid, latest
                        ));
                    }
                }
                output.push('\n');
            }
        }

        output
    }
}
