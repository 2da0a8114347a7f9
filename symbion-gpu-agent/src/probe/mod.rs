//! GPU sampling through nvidia-smi
//!
//! Handles:
//! - Building the `--query-gpu` command line from the metric catalog
//! - Running the tool with a hard timeout (the child is killed on expiry)
//! - Parsing the CSV output, one device per line, rejecting malformed lines individually

use crate::catalog::MetricCatalog;
use crate::error::{CycleError, ParseError};
use crate::samples::{DeviceIdentity, MetricValues, SampleSet};
use async_trait::async_trait;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, warn};

/// Columns requested ahead of the catalog fields
const IDENTITY_FIELDS: &[&str] = &["gpu_name", "gpu_bus_id"];

/// Header-less CSV without unit suffixes
const OUTPUT_FORMAT: &str = "--format=csv,noheader,nounits";

/// Result of one probe call
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub samples: SampleSet,
    pub rejected: Vec<RejectedLine>,
}

/// A line of tool output that could not be turned into a sample
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedLine {
    /// 1-based line number in the tool output
    pub line_no: usize,
    pub line: String,
    pub error: ParseError,
}

/// Anything able to produce one sample set per call
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn probe(&self, catalog: &MetricCatalog) -> Result<ProbeReport, CycleError>;
}

/// nvidia-smi backed sample source
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Arguments for one query: identity fields first, then catalog fields in sorted order
    pub fn query_args(catalog: &MetricCatalog) -> Vec<String> {
        let fields: Vec<&str> = IDENTITY_FIELDS
            .iter()
            .copied()
            .chain(catalog.query_keys())
            .collect();

        vec![
            format!("--query-gpu={}", fields.join(",")),
            OUTPUT_FORMAT.to_string(),
        ]
    }
}

#[async_trait]
impl SampleSource for NvidiaSmi {
    async fn probe(&self, catalog: &MetricCatalog) -> Result<ProbeReport, CycleError> {
        let args = Self::query_args(catalog);
        debug!("Probing GPUs: {} {}", self.binary, args.join(" "));

        let output = run_tool(&self.binary, &args, self.timeout).await?;

        if !output.status.success() {
            return Err(CycleError::ProbeFailed {
                tool: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = parse_output(&stdout, catalog);

        for rejected in &report.rejected {
            warn!(
                line_no = rejected.line_no,
                "Skipping malformed {} line {:?}: {}", self.binary, rejected.line, rejected.error
            );
        }

        Ok(report)
    }
}

/// Run an external tool, capturing stdout/stderr, bounded by `timeout`.
///
/// The child is spawned with `kill_on_drop`, so expiry of the timeout kills it.
pub async fn run_tool(tool: &str, args: &[String], timeout: Duration) -> Result<Output, CycleError> {
    let child = AsyncCommand::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CycleError::ProbeSpawn {
            tool: tool.to_string(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(CycleError::ProbeSpawn {
            tool: tool.to_string(),
            source,
        }),
        Err(_) => Err(CycleError::ProbeTimeout {
            tool: tool.to_string(),
            timeout,
        }),
    }
}

/// Parse `--format=csv,noheader,nounits` output into samples.
///
/// Columns are matched positionally against the catalog's sorted fields. Blank
/// lines are ignored; malformed lines are returned in `rejected`.
pub fn parse_output(stdout: &str, catalog: &MetricCatalog) -> ProbeReport {
    let keys: Vec<&str> = catalog.query_keys().collect();
    let mut report = ProbeReport::default();

    for (idx, line) in stdout.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        match parse_line(line, &keys) {
            Ok((device, values)) => {
                if report.samples.insert(device.clone(), values).is_some() {
                    warn!("Device {} reported twice, keeping the last line", device);
                }
            }
            Err(error) => report.rejected.push(RejectedLine {
                line_no: idx + 1,
                line: line.to_string(),
                error,
            }),
        }
    }

    report
}

fn parse_line(line: &str, keys: &[&str]) -> Result<(DeviceIdentity, MetricValues), ParseError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let expected = IDENTITY_FIELDS.len() + keys.len();

    if fields.len() != expected {
        return Err(ParseError::ColumnCount {
            expected,
            found: fields.len(),
        });
    }

    let (identity, raw_values) = fields.split_at(IDENTITY_FIELDS.len());
    for (column, value) in IDENTITY_FIELDS.iter().zip(identity) {
        if value.is_empty() {
            return Err(ParseError::EmptyIdentity(column.to_string()));
        }
    }
    let device = DeviceIdentity::new(identity[0], identity[1]);

    let mut values = MetricValues::new();
    for (key, raw) in keys.iter().zip(raw_values) {
        // f64::from_str accepts NaN and inf, which the backend cannot store
        let value = raw
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::NotNumeric {
                column: key.to_string(),
                value: raw.to_string(),
            })?;
        values.insert(key.to_string(), value);
    }

    Ok((device, values))
}
