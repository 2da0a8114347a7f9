//! Cloud Monitoring v3 REST client
//!
//! `projects.timeSeries.create`, authenticated with the instance's default
//! service account token obtained from the metadata server.

use super::{MetricBackend, TimeSeriesPoint};
use crate::error::PublishError;
use crate::metadata::MetadataClient;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

/// Tokens are refreshed this long before the metadata server says they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTimeSeriesRequest<'a> {
    time_series: Vec<TimeSeries<'a>>,
}

#[derive(Debug, Serialize)]
struct TimeSeries<'a> {
    metric: Metric<'a>,
    resource: MonitoredResource<'a>,
    points: Vec<Point>,
}

#[derive(Debug, Serialize)]
struct Metric<'a> {
    #[serde(rename = "type")]
    metric_type: &'a str,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct MonitoredResource<'a> {
    #[serde(rename = "type")]
    resource_type: &'a str,
    labels: &'a BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct Point {
    interval: TimeInterval,
    value: TypedValue,
}

/// Gauge semantics: end time only
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimeInterval {
    end_time: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TypedValue {
    double_value: f64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Submits batches to `{endpoint}/projects/{project}/timeSeries`
pub struct CloudMonitoringClient {
    http: reqwest::Client,
    endpoint: String,
    resource_type: String,
    metadata: MetadataClient,
    token: Mutex<Option<CachedToken>>,
}

impl CloudMonitoringClient {
    pub fn new(
        endpoint: &str,
        resource_type: &str,
        timeout: Duration,
        metadata: MetadataClient,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("symbion-gpu-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            resource_type: resource_type.to_string(),
            metadata,
            token: Mutex::new(None),
        })
    }

    /// Return a cached token, fetching a new one when it is about to expire
    async fn bearer_token(&self) -> Result<String, PublishError> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.metadata.access_token().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        debug!("Obtained access token valid for {}s", fresh.expires_in);

        *cached = Some(CachedToken {
            value: fresh.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });

        Ok(fresh.access_token)
    }

    /// Drop the cached token so the next call fetches a new one
    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }
}

fn request_body<'a>(resource_type: &'a str, points: &'a [TimeSeriesPoint]) -> CreateTimeSeriesRequest<'a> {
    let time_series = points
        .iter()
        .map(|point| TimeSeries {
            metric: Metric {
                metric_type: &point.metric_type,
                labels: &point.metric_labels,
            },
            resource: MonitoredResource {
                resource_type,
                labels: &point.resource_labels,
            },
            points: vec![Point {
                interval: TimeInterval {
                    end_time: point.end_time.to_rfc3339_opts(SecondsFormat::Nanos, true),
                },
                value: TypedValue {
                    double_value: point.value,
                },
            }],
        })
        .collect();

    CreateTimeSeriesRequest { time_series }
}

#[async_trait]
impl MetricBackend for CloudMonitoringClient {
    async fn create_time_series(
        &self,
        project_id: &str,
        points: Vec<TimeSeriesPoint>,
    ) -> Result<(), PublishError> {
        let token = self.bearer_token().await?;
        let url = format!("{}/projects/{}/timeSeries", self.endpoint, project_id);

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&request_body(&self.resource_type, &points))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
        }

        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}
