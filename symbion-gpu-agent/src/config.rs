//! Agent configuration
//!
//! Handles:
//! - Tool location and probe timeout
//! - Collection cadence (fixed for the process lifetime)
//! - Metadata server and Cloud Monitoring endpoints
//! - Optional override of the metric catalog

use crate::catalog::{DerivedMetric, MetricCatalog, MEM_USED_PERCENT};
use crate::error::FatalError;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV_VAR: &str = "SYMBION_GPU_AGENT_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub tool: ToolConfig,
    pub collection: CollectionConfig,
    pub metadata: MetadataConfig,
    pub monitoring: MonitoringConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub binary: String,
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub endpoint: String,
    pub metric_prefix: String,
    pub resource_type: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// nvidia-smi query field -> published metric name; replaces the default table
    pub catalog: Option<BTreeMap<String, String>>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
            probe_timeout_secs: 5,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self { interval_secs: 10 }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            base_url: "http://metadata.google.internal/computeMetadata/v1/instance/".to_string(),
            timeout_secs: 5,
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://monitoring.googleapis.com/v3".to_string(),
            metric_prefix: "custom.googleapis.com".to_string(),
            resource_type: "gce_instance".to_string(),
            timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    /// Load config from `$SYMBION_GPU_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;
        Self::load_from(&config_path).await
    }

    /// Load config from `path`, falling back to defaults when the file doesn't exist
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(config)
    }

    /// Get config file path, honouring the env override
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("symbion-gpu-agent");
        path.push("config.toml");
        Ok(path)
    }

    /// Check settings and build the metric catalog
    pub fn validate(&self) -> Result<MetricCatalog, FatalError> {
        let non_zero = [
            ("tool.probe_timeout_secs", self.tool.probe_timeout_secs),
            ("collection.interval_secs", self.collection.interval_secs),
            ("metadata.timeout_secs", self.metadata.timeout_secs),
            ("monitoring.timeout_secs", self.monitoring.timeout_secs),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(FatalError::Config(format!("{name} must be greater than zero")));
            }
        }

        if self.tool.binary.trim().is_empty() {
            return Err(FatalError::Config("tool.binary is empty".into()));
        }

        match &self.metrics.catalog {
            None => Ok(MetricCatalog::gpu_default()),
            Some(metrics) => MetricCatalog::new(
                metrics.clone(),
                vec![DerivedMetric::percent(MEM_USED_PERCENT, "memory.used", "memory.total")],
            ),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.tool.probe_timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.collection.interval_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata.timeout_secs)
    }

    pub fn monitoring_timeout(&self) -> Duration {
        Duration::from_secs(self.monitoring.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.tool.binary, "nvidia-smi");
        assert_eq!(config.interval(), Duration::from_secs(10));
        assert_eq!(config.monitoring.resource_type, "gce_instance");
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::load_from(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.collection.interval_secs, 10);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[collection]
interval_secs = 30

[metrics.catalog]
"memory.total" = "instance/gpu/memory_total"
"memory.used" = "instance/gpu/memory_used"
"power.draw" = "instance/gpu/power_draw"
"#
        )
        .unwrap();

        let config = AgentConfig::load_from(file.path()).await.unwrap();
        assert_eq!(config.interval(), Duration::from_secs(30));
        assert_eq!(config.tool.probe_timeout_secs, 5);

        let catalog = config.validate().unwrap();
        let keys: Vec<&str> = catalog.query_keys().collect();
        assert_eq!(keys, vec!["memory.total", "memory.used", "power.draw"]);
    }

    #[tokio::test]
    async fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[collection]\ninterval_secs = \"often\"").unwrap();

        assert!(AgentConfig::load_from(file.path()).await.is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = AgentConfig::default();
        config.collection.interval_secs = 0;
        assert!(matches!(config.validate(), Err(FatalError::Config(_))));
    }

    #[test]
    fn test_catalog_without_memory_fields_rejected() {
        let mut config = AgentConfig::default();
        config.metrics.catalog = Some(
            [("utilization.gpu".to_string(), "instance/gpu/utilization".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(matches!(config.validate(), Err(FatalError::Config(_))));
    }
}
