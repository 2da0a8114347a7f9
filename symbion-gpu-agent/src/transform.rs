//! Derived metric computation
//!
//! A failed derived metric only drops that value for that device; the
//! device's sampled metrics and every other device are kept.

use crate::catalog::MetricCatalog;
use crate::error::DeriveError;
use crate::samples::{DeviceIdentity, DeviceMetrics, SampleSet, TransformedSet};
use tracing::warn;

/// A derived metric that could not be computed this cycle
#[derive(Debug, Clone, PartialEq)]
pub struct DeriveFailure {
    pub device: DeviceIdentity,
    pub metric: String,
    pub error: DeriveError,
}

/// Output of one transformation pass
#[derive(Debug, Default)]
pub struct Transformed {
    pub devices: TransformedSet,
    pub failures: Vec<DeriveFailure>,
}

/// Attach every derived metric of `catalog` to each device of `samples`
pub fn transform(samples: SampleSet, catalog: &MetricCatalog) -> Transformed {
    let mut result = Transformed::default();

    for (device, sampled) in samples {
        let mut metrics = DeviceMetrics {
            sampled,
            ..Default::default()
        };

        for derived in catalog.derived() {
            match derived.compute(&metrics.sampled) {
                Ok(value) => {
                    metrics.derived.insert(derived.published.clone(), value);
                }
                Err(error) => {
                    warn!("Skipping {} for {}: {}", derived.published, device, error);
                    result.failures.push(DeriveFailure {
                        device: device.clone(),
                        metric: derived.published.clone(),
                        error,
                    });
                }
            }
        }

        result.devices.insert(device, metrics);
    }

    result
}
