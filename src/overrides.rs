use crate::classifier::classify_record;
use crate::error::{MetricsError, Result};
use crate::schema::{AggregationPolicy, MetricRecord, PolicySource};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Caller-supplied aggregation policies keyed by metric uid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyOverrides(BTreeMap<String, AggregationPolicy>);

impl PolicyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object such as `{"8": "average", "12": "end-of-period"}`.
    /// Unknown policy names are reported by value.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> = serde_json::from_str(json)?;
        raw.into_iter()
            .map(|(uid, policy)| Ok((uid, policy.parse::<AggregationPolicy>()?)))
            .collect::<Result<BTreeMap<_, _>>>()
            .map(Self)
    }

    pub fn insert(&mut self, uid: impl Into<String>, policy: AggregationPolicy) {
        self.0.insert(uid.into(), policy);
    }

    pub fn get(&self, uid: &str) -> Option<AggregationPolicy> {
        self.0.get(uid).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, AggregationPolicy> {
        &self.0
    }

    /// Overlays `other` on top of `self`; entries in `other` win.
    pub fn merged_with(&self, other: &PolicyOverrides) -> PolicyOverrides {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(k, v)| (k.clone(), *v)));
        PolicyOverrides(merged)
    }
}

impl From<BTreeMap<String, AggregationPolicy>> for PolicyOverrides {
    fn from(map: BTreeMap<String, AggregationPolicy>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, AggregationPolicy)> for PolicyOverrides {
    fn from_iter<I: IntoIterator<Item = (String, AggregationPolicy)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Policies chosen for a set of records, with where each one came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPolicies {
    pub policies: BTreeMap<String, AggregationPolicy>,
    pub sources: BTreeMap<String, PolicySource>,
}

impl ResolvedPolicies {
    pub fn get(&self, uid: &str) -> Option<AggregationPolicy> {
        self.policies.get(uid).copied()
    }
}

pub struct PolicyResolver<'a> {
    overrides: &'a PolicyOverrides,
    require_explicit: bool,
}

impl<'a> PolicyResolver<'a> {
    pub fn new(overrides: &'a PolicyOverrides) -> Self {
        Self {
            overrides,
            require_explicit: false,
        }
    }

    /// Refuse to fall back to the classifier.
    pub fn require_explicit(mut self, require: bool) -> Self {
        self.require_explicit = require;
        self
    }

    pub fn resolve(&self, record: &MetricRecord) -> (AggregationPolicy, PolicySource) {
        match self.overrides.get(&record.uid) {
            Some(policy) => (policy, PolicySource::Override),
            None => (classify_record(record), PolicySource::Heuristic),
        }
    }

    pub fn resolve_all(&self, records: &[MetricRecord]) -> Result<ResolvedPolicies> {
        let mut resolved = ResolvedPolicies::default();
        let mut unresolved = Vec::new();

        for record in records {
            let (policy, source) = self.resolve(record);
            if source == PolicySource::Heuristic && self.require_explicit {
                unresolved.push(record.uid.clone());
                continue;
            }
            debug!(
                "Metric {} ({}) rolls up by {} [{:?}]",
                record.uid, record.name, policy, source
            );
            resolved.policies.insert(record.uid.clone(), policy);
            resolved.sources.insert(record.uid.clone(), source);
        }

        if !unresolved.is_empty() {
            return Err(MetricsError::UnresolvedPolicies(unresolved));
        }

        let known: BTreeSet<&str> = records.iter().map(|r| r.uid.as_str()).collect();
        for uid in self.overrides.as_map().keys() {
            if !known.contains(uid.as_str()) {
                warn!("Policy override for unknown metric uid '{}'", uid);
            }
        }

        Ok(resolved)
    }
}
