//! Startup checks run once before the collection loop
//!
//! The diagnostic tool must be installed, must run cleanly, and must list at
//! least one GPU. Every failure is fatal and maps to its own exit code.

use crate::error::{CycleError, FatalError};
use crate::probe::run_tool;
use std::io::ErrorKind;
use std::time::Duration;
use tracing::{debug, info};

/// Device listing flag of nvidia-smi
const LIST_DEVICES_ARG: &str = "-L";

pub struct StartupValidator {
    tool: String,
    timeout: Duration,
}

impl StartupValidator {
    pub fn new(tool: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tool: tool.into(),
            timeout,
        }
    }

    /// Check the tool is invocable, exits cleanly, and detects at least one device
    pub async fn validate(&self) -> Result<(), FatalError> {
        debug!("Running preflight: {} {}", self.tool, LIST_DEVICES_ARG);

        let output = run_tool(&self.tool, &[LIST_DEVICES_ARG.to_string()], self.timeout)
            .await
            .map_err(|e| self.spawn_failure(e))?;

        if !output.status.success() {
            return Err(FatalError::ToolExecution {
                tool: self.tool.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let devices: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();

        if devices.is_empty() {
            return Err(FatalError::NoDevicesFound {
                tool: self.tool.clone(),
            });
        }

        for device in &devices {
            debug!("Detected {}", device.trim());
        }
        info!("{} detected {} GPU(s)", self.tool, devices.len());

        Ok(())
    }

    fn spawn_failure(&self, error: CycleError) -> FatalError {
        match error {
            CycleError::ProbeSpawn { source, .. } if source.kind() == ErrorKind::NotFound => {
                FatalError::ToolMissing {
                    tool: self.tool.clone(),
                }
            }
            other => FatalError::ToolExecution {
                tool: self.tool.clone(),
                status: "no exit status".into(),
                stderr: other.to_string(),
                stdout: String::new(),
            },
        }
    }
}
