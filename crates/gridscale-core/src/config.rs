//! gridscale.toml configuration parser.
//!
//! The same file carries the autoscaler's own settings, the services it may
//! scale, and the cluster resources it manages. [`GridscaleConfig`] also
//! implements [`ConfigStore`] so a static file can stand in for a live
//! config service.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collaborators::ConfigStore;
use crate::types::*;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridscaleConfig {
    #[serde(default)]
    pub autoscaler: AutoscalerSettings,
    #[serde(default)]
    pub services: Vec<ServiceAutoscalingConfig>,
    #[serde(default)]
    pub cluster_resources: BTreeMap<String, ClusterResourceDescriptor>,
}

/// `[autoscaler]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscalerSettings {
    pub cluster: String,
    pub state_root: String,
    pub lock_path: String,
    pub lock_timeout_ms: u64,
    pub lock_ttl_secs: u64,
    pub http_timeout_ms: u64,
    pub interval_secs: u64,
    pub cluster_target_utilization: f64,
}

impl Default for AutoscalerSettings {
    fn default() -> Self {
        Self {
            cluster: "default".to_string(),
            state_root: "/autoscaling".to_string(),
            lock_path: "/autoscaling/autoscaling.lock".to_string(),
            lock_timeout_ms: 1000,
            lock_ttl_secs: 600,
            http_timeout_ms: 2000,
            interval_secs: 300,
            cluster_target_utilization: 0.8,
        }
    }
}

impl AutoscalerSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl GridscaleConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse, fill cluster defaults, and validate.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: GridscaleConfig = toml::from_str(content)?;
        for service in &mut config.services {
            if service.cluster.is_empty() {
                service.cluster = config.autoscaler.cluster.clone();
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.autoscaler;
        if settings.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid("lock_timeout_ms must be positive".into()));
        }
        if settings.http_timeout_ms == 0 {
            return Err(ConfigError::Invalid("http_timeout_ms must be positive".into()));
        }
        if settings.interval_secs == 0 {
            return Err(ConfigError::Invalid("interval_secs must be positive".into()));
        }
        let target = settings.cluster_target_utilization;
        if !(target > 0.0 && target <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "cluster_target_utilization {target} is outside (0, 1]"
            )));
        }

        for service in &self.services {
            let target = service.target();
            let setpoint = service.autoscaling.setpoint;
            if !(setpoint > 0.0 && setpoint <= 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "{target}: setpoint {setpoint} is outside (0, 1]"
                )));
            }
            if let Some(max) = service.max_instances
                && service.min_instances > max
            {
                return Err(ConfigError::Invalid(format!(
                    "{target}: min_instances {} exceeds max_instances {max}",
                    service.min_instances
                )));
            }
        }

        for (identifier, resource) in &self.cluster_resources {
            if resource.min_instances > resource.max_instances {
                return Err(ConfigError::Invalid(format!(
                    "{identifier}: min_instances {} exceeds max_instances {}",
                    resource.min_instances, resource.max_instances
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for GridscaleConfig {
    async fn list_eligible_services(&self, cluster: &str) -> anyhow::Result<Vec<ServiceInstance>> {
        Ok(self
            .services
            .iter()
            .filter(|s| s.cluster == cluster)
            .map(ServiceAutoscalingConfig::target)
            .collect())
    }

    async fn load_service_config(
        &self,
        target: &ServiceInstance,
    ) -> anyhow::Result<ServiceAutoscalingConfig> {
        self.services
            .iter()
            .find(|s| s.service == target.service && s.instance == target.instance)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no config for {target}"))
    }

    async fn list_cluster_resources(
        &self,
    ) -> anyhow::Result<BTreeMap<String, ClusterResourceDescriptor>> {
        Ok(self.cluster_resources.clone())
    }
}
