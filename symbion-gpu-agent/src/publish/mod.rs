//! Publication of GPU samples as Cloud Monitoring time series
//!
//! Handles:
//! - Mapping host identity + transformed samples to one point per (device, metric)
//! - Stamping every point of a batch with the same end time
//! - Submitting the batch in a single call through a `MetricBackend`

mod cloud_monitoring;

pub use cloud_monitoring::CloudMonitoringClient;

use crate::catalog::MetricCatalog;
use crate::error::PublishError;
use crate::metadata::HostIdentity;
use crate::samples::TransformedSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, error, info};

/// One gauge value as submitted to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesPoint {
    /// Fully qualified metric type, e.g. `custom.googleapis.com/instance/gpu/utilization`
    pub metric_type: String,
    /// instance_id, zone, project_id
    pub resource_labels: BTreeMap<String, String>,
    /// gpu_type, gpu_bus_id
    pub metric_labels: BTreeMap<String, String>,
    pub value: f64,
    pub end_time: DateTime<Utc>,
}

/// Destination of published batches
#[async_trait]
pub trait MetricBackend: Send + Sync {
    /// Submit one cycle's points in a single call
    async fn create_time_series(
        &self,
        project_id: &str,
        points: Vec<TimeSeriesPoint>,
    ) -> Result<(), PublishError>;
}

/// Maps samples to points and hands them to the backend
pub struct PublishBatcher<B> {
    backend: B,
    metric_prefix: String,
}

impl<B: MetricBackend> PublishBatcher<B> {
    pub fn new(backend: B, metric_prefix: impl Into<String>) -> Self {
        Self {
            backend,
            metric_prefix: metric_prefix.into(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Build the points for one cycle, all stamped with `now`.
    ///
    /// Sampled metrics follow catalog order, derived metrics come last.
    pub fn build_points(
        &self,
        identity: &HostIdentity,
        devices: &TransformedSet,
        catalog: &MetricCatalog,
        now: DateTime<Utc>,
    ) -> Vec<TimeSeriesPoint> {
        let resource_labels: BTreeMap<String, String> = [
            ("instance_id", &identity.instance_id),
            ("zone", &identity.zone),
            ("project_id", &identity.project_id),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();

        let mut points = Vec::new();

        for (device, metrics) in devices {
            let metric_labels: BTreeMap<String, String> = [
                ("gpu_type".to_string(), device.model.clone()),
                ("gpu_bus_id".to_string(), device.bus_id.clone()),
            ]
            .into_iter()
            .collect();

            let sampled = catalog.entries().iter().filter_map(|entry| {
                metrics
                    .sampled
                    .get(&entry.query)
                    .map(|value| (entry.published.as_str(), *value))
            });
            let derived = catalog.derived().iter().filter_map(|metric| {
                metrics
                    .derived
                    .get(&metric.published)
                    .map(|value| (metric.published.as_str(), *value))
            });

            for (name, value) in sampled.chain(derived) {
                points.push(TimeSeriesPoint {
                    metric_type: format!("{}/{}", self.metric_prefix, name),
                    resource_labels: resource_labels.clone(),
                    metric_labels: metric_labels.clone(),
                    value,
                    end_time: now,
                });
            }
        }

        points
    }

    /// Publish one cycle. Returns the number of points submitted.
    pub async fn publish(
        &self,
        identity: &HostIdentity,
        devices: &TransformedSet,
        catalog: &MetricCatalog,
    ) -> Result<usize, PublishError> {
        let points = self.build_points(identity, devices, catalog, Utc::now());
        let count = points.len();
        debug!("Submitting {} points for {} devices", count, devices.len());

        match self
            .backend
            .create_time_series(&identity.project_id, points)
            .await
        {
            Ok(()) => {
                info!(points = count, "Published GPU metrics");
                Ok(count)
            }
            Err(e) => {
                error!("Encountered an error while publishing {} points: {}", count, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MEM_USED_PERCENT;
    use crate::probe::parse_output;
    use crate::transform::transform;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        calls: Mutex<Vec<(String, Vec<TimeSeriesPoint>)>>,
        fail: bool,
    }

    #[async_trait]
    impl MetricBackend for RecordingBackend {
        async fn create_time_series(
            &self,
            project_id: &str,
            points: Vec<TimeSeriesPoint>,
        ) -> Result<(), PublishError> {
            self.calls.lock().unwrap().push((project_id.to_string(), points));
            if self.fail {
                Err(PublishError::Rejected { status: 503, body: "unavailable".into() })
            } else {
                Ok(())
            }
        }
    }

    fn identity() -> HostIdentity {
        HostIdentity {
            project_id: "1234".into(),
            zone: "europe-west3-c".into(),
            instance_id: "987654321".into(),
        }
    }

    fn a100_cycle(catalog: &MetricCatalog) -> TransformedSet {
        let report = parse_output("A100, 0000:00:04.0, 30720, 40960, 10240, 60, 55, 30", catalog);
        transform(report.samples, catalog).devices
    }

    fn value_of(points: &[TimeSeriesPoint], metric_type: &str) -> Option<f64> {
        points.iter().find(|p| p.metric_type == metric_type).map(|p| p.value)
    }

    #[test]
    fn test_points_for_a100_sample() {
        let catalog = MetricCatalog::gpu_default();
        let batcher = PublishBatcher::new(RecordingBackend::default(), "custom.googleapis.com");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(250_000_000);

        let points = batcher.build_points(&identity(), &a100_cycle(&catalog), &catalog, now);

        // 6 sampled + 1 derived
        assert_eq!(points.len(), 7);
        assert_eq!(
            value_of(&points, "custom.googleapis.com/instance/gpu/memory_used_percent"),
            Some(25.0)
        );
        assert_eq!(
            value_of(&points, "custom.googleapis.com/instance/gpu/utilization"),
            Some(55.0)
        );
        let expected_last = format!("custom.googleapis.com/{}", MEM_USED_PERCENT);
        assert_eq!(points.last().map(|p| &p.metric_type), Some(&expected_last));

        for point in &points {
            assert_eq!(point.end_time, now);
            assert_eq!(point.end_time.timestamp_subsec_nanos(), 250_000_000);
            assert_eq!(point.resource_labels["instance_id"], "987654321");
            assert_eq!(point.resource_labels["zone"], "europe-west3-c");
            assert_eq!(point.resource_labels["project_id"], "1234");
            assert_eq!(point.metric_labels["gpu_type"], "A100");
            assert_eq!(point.metric_labels["gpu_bus_id"], "0000:00:04.0");
        }
    }

    #[test]
    fn test_identical_cycles_differ_only_by_timestamp() {
        let catalog = MetricCatalog::gpu_default();
        let batcher = PublishBatcher::new(RecordingBackend::default(), "custom.googleapis.com");
        let first = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let second = first + chrono::Duration::seconds(10);

        let a = batcher.build_points(&identity(), &a100_cycle(&catalog), &catalog, first);
        let mut b = batcher.build_points(&identity(), &a100_cycle(&catalog), &catalog, second);

        assert_ne!(a, b);
        for point in &mut b {
            point.end_time = first;
        }
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_publish_single_batched_call() {
        let catalog = MetricCatalog::gpu_default();
        let batcher = PublishBatcher::new(RecordingBackend::default(), "custom.googleapis.com");

        let count = batcher.publish(&identity(), &a100_cycle(&catalog), &catalog).await.unwrap();

        let calls = batcher.backend().calls.lock().unwrap();
        assert_eq!(count, 7);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "1234");
        assert_eq!(calls[0].1.len(), 7);
    }

    #[tokio::test]
    async fn test_publish_failure_is_returned() {
        let catalog = MetricCatalog::gpu_default();
        let backend = RecordingBackend { fail: true, ..Default::default() };
        let batcher = PublishBatcher::new(backend, "custom.googleapis.com");

        let result = batcher.publish(&identity(), &a100_cycle(&catalog), &catalog).await;

        assert!(matches!(result, Err(PublishError::Rejected { status: 503, .. })));
        assert_eq!(batcher.backend().calls.lock().unwrap().len(), 1);
    }
}
