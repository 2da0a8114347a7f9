//! Metric catalog
//!
//! Fixed mapping from nvidia-smi query fields to published metric names, plus
//! the derived metrics computed from them. Built once at startup and shared
//! read-only by the probe, the transformer and the publisher.

use crate::error::{DeriveError, FatalError};
use crate::samples::MetricValues;
use std::collections::BTreeMap;

/// Published name of the derived memory usage percentage
pub const MEM_USED_PERCENT: &str = "instance/gpu/memory_used_percent";

/// Default nvidia-smi fields and the metric names they are published under
const DEFAULT_METRICS: &[(&str, &str)] = &[
    ("utilization.gpu", "instance/gpu/utilization"),
    ("utilization.memory", "instance/gpu/memory_utilization"),
    ("memory.total", "instance/gpu/memory_total"),
    ("memory.used", "instance/gpu/memory_used"),
    ("memory.free", "instance/gpu/memory_free"),
    ("temperature.gpu", "instance/gpu/temperature"),
];

/// One sampled metric: tool query field -> published metric name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub query: String,
    pub published: String,
}

/// Percentage computed from two sampled metrics.
///
/// The value is `round(numerator / denominator * 100)` using `f64::round`,
/// i.e. halves round away from zero (round-half-up for the non-negative
/// values nvidia-smi reports).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedMetric {
    pub published: String,
    pub numerator: String,
    pub denominator: String,
}

impl DerivedMetric {
    pub fn percent(published: &str, numerator: &str, denominator: &str) -> Self {
        Self {
            published: published.to_string(),
            numerator: numerator.to_string(),
            denominator: denominator.to_string(),
        }
    }

    /// Compute the value for one device's samples
    pub fn compute(&self, values: &MetricValues) -> Result<f64, DeriveError> {
        let numerator = values
            .get(&self.numerator)
            .ok_or_else(|| DeriveError::MissingKey(self.numerator.clone()))?;
        let denominator = values
            .get(&self.denominator)
            .ok_or_else(|| DeriveError::MissingKey(self.denominator.clone()))?;

        if *denominator == 0.0 {
            return Err(DeriveError::ZeroDenominator(self.denominator.clone()));
        }

        Ok((numerator / denominator * 100.0).round())
    }
}

/// Immutable set of sampled and derived metrics
#[derive(Debug, Clone)]
pub struct MetricCatalog {
    /// Sorted by query field; this is also the column order requested from the tool
    entries: Vec<CatalogEntry>,
    derived: Vec<DerivedMetric>,
}

impl MetricCatalog {
    /// Build a catalog, checking that every derived metric can be computed from it
    pub fn new(
        metrics: BTreeMap<String, String>,
        derived: Vec<DerivedMetric>,
    ) -> Result<Self, FatalError> {
        if metrics.is_empty() {
            return Err(FatalError::Config("metric catalog is empty".into()));
        }

        for metric in &derived {
            for input in [&metric.numerator, &metric.denominator] {
                if !metrics.contains_key(input) {
                    return Err(FatalError::Config(format!(
                        "derived metric {} needs `{}` in the catalog",
                        metric.published, input
                    )));
                }
            }
        }

        // BTreeMap iteration gives the sorted key order the probe relies on
        let entries = metrics
            .into_iter()
            .map(|(query, published)| CatalogEntry { query, published })
            .collect();

        Ok(Self { entries, derived })
    }

    /// Standard GPU catalog with memory_used_percent derived from memory.used / memory.total
    pub fn gpu_default() -> Self {
        let entries = Self::default_metrics()
            .into_iter()
            .map(|(query, published)| CatalogEntry { query, published })
            .collect();

        Self {
            entries,
            derived: vec![DerivedMetric::percent(MEM_USED_PERCENT, "memory.used", "memory.total")],
        }
    }

    /// Default query field -> published name table
    pub fn default_metrics() -> BTreeMap<String, String> {
        DEFAULT_METRICS
            .iter()
            .map(|(query, published)| (query.to_string(), published.to_string()))
            .collect()
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn derived(&self) -> &[DerivedMetric] {
        &self.derived
    }

    /// Query fields in the order the tool is asked to print them
    pub fn query_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.query.as_str())
    }
}
