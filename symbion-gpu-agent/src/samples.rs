//! Per-cycle sample data
//!
//! Everything here is produced fresh by each cycle and dropped after publish.

use std::collections::BTreeMap;
use std::fmt;

/// One physical GPU, identified by model name and PCI bus id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceIdentity {
    pub model: String,
    pub bus_id: String,
}

impl DeviceIdentity {
    pub fn new(model: impl Into<String>, bus_id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            bus_id: bus_id.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.model, self.bus_id)
    }
}

/// Query field -> sampled value
pub type MetricValues = BTreeMap<String, f64>;

/// Raw samples of one probe call
pub type SampleSet = BTreeMap<DeviceIdentity, MetricValues>;

/// Samples of one device after transformation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetrics {
    /// Keyed by query field, exactly as probed
    pub sampled: MetricValues,
    /// Keyed by published name; a derived metric that failed is absent
    pub derived: BTreeMap<String, f64>,
}

/// Samples of one cycle after transformation
pub type TransformedSet = BTreeMap<DeviceIdentity, DeviceMetrics>;
