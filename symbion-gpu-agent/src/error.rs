//! Error taxonomy for the GPU agent
//!
//! Two families:
//! - `FatalError`: startup failures, reported once and mapped to a process exit code
//! - `CycleError` and friends: per-cycle failures, logged and absorbed by the collection loop

use std::time::Duration;
use thiserror::Error;

/// Startup failures. Each kind has its own exit code for operational diagnosis.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("couldn't find the `{tool}` tool, make sure it is installed in one of the directories in $PATH")]
    ToolMissing { tool: String },

    #[error("`{tool}` has encountered an error ({status}): {stderr} {stdout}")]
    ToolExecution {
        tool: String,
        status: String,
        stderr: String,
        stdout: String,
    },

    #[error("`{tool}` didn't detect any GPUs attached to the system")]
    NoDevicesFound { tool: String },

    #[error("couldn't connect to the metadata server at {url} (is this running on a Compute Engine instance?): {source}")]
    MetadataUnreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("metadata server returned an unusable answer for {url}: {reason}")]
    MetadataInvalid { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FatalError {
    /// Process exit code reported for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::ToolMissing { .. } => 1,
            FatalError::ToolExecution { .. } => 2,
            FatalError::NoDevicesFound { .. } => 3,
            FatalError::MetadataUnreachable { .. } | FatalError::MetadataInvalid { .. } => 4,
            FatalError::Config(_) => 5,
        }
    }
}

/// Failures that abort a single collection cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("failed to spawn `{tool}`: {source}")]
    ProbeSpawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{tool}` did not finish within {timeout:?}")]
    ProbeTimeout { tool: String, timeout: Duration },

    #[error("`{tool}` exited with {status}: {stderr}")]
    ProbeFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

/// Why one line of probe output was rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("expected {expected} columns, found {found}")]
    ColumnCount { expected: usize, found: usize },

    #[error("column `{column}` is not numeric: {value:?}")]
    NotNumeric { column: String, value: String },

    #[error("column `{0}` is empty")]
    EmptyIdentity(String),
}

/// Why a derived metric could not be computed for one device
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeriveError {
    #[error("sample is missing `{0}`")]
    MissingKey(String),

    #[error("`{0}` is zero")]
    ZeroDenominator(String),
}

/// Submission failures towards the monitoring backend
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("could not obtain an access token: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("backend rejected the batch ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct() {
        let tool = "nvidia-smi".to_string();
        let codes = [
            FatalError::ToolMissing { tool: tool.clone() }.exit_code(),
            FatalError::ToolExecution {
                tool: tool.clone(),
                status: "exit status: 9".into(),
                stderr: String::new(),
                stdout: String::new(),
            }
            .exit_code(),
            FatalError::NoDevicesFound { tool }.exit_code(),
            FatalError::MetadataInvalid { url: "x".into(), reason: "y".into() }.exit_code(),
            FatalError::Config("bad".into()).exit_code(),
        ];

        let mut unique = codes.to_vec();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}
