//! System configuration
//!
//! Loaded once at startup from a YAML file; every section has working
//! defaults so an empty file is a valid configuration. Validation failures
//! are fatal: a control plane with a bad config refuses to run.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use strato_autoscaler::AutoscalingConfig;
use strato_common::{mul_quantity, Error, Result, DEFAULT_MODEL_PORT};
use strato_controller::{ModelServers, ResourceProfile, RolloutConfig};
use strato_gateway::ProxyConfig;

/// Top-level system configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Bind address for the gateway (API + metrics + probes)
    pub api_addr: String,
    /// Name of the Service fronting the control-plane replicas themselves
    pub self_service_name: String,
    /// Honor the development address-override annotations on Models
    pub allow_pod_address_override: bool,
    /// Secret names consumed by pod builders
    pub secret_names: SecretNames,
    /// Per-engine server image maps
    pub model_servers: ModelServers,
    /// Named resource profiles referenced by `spec.resourceProfile`
    pub resource_profiles: BTreeMap<String, ResourceProfile>,
    /// Autoscaler timing
    pub model_autoscaling: AutoscalingSection,
    /// Rollout bounds
    pub model_rollouts: RolloutSection,
    /// Admission proxy tuning
    pub proxy: ProxySection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_addr: format!("0.0.0.0:{}", DEFAULT_MODEL_PORT),
            self_service_name: "strato".to_string(),
            allow_pod_address_override: false,
            secret_names: SecretNames::default(),
            model_servers: ModelServers::default(),
            resource_profiles: BTreeMap::new(),
            model_autoscaling: AutoscalingSection::default(),
            model_rollouts: RolloutSection::default(),
            proxy: ProxySection::default(),
        }
    }
}

/// Secret names consumed by pod builders
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecretNames {
    /// Secret with a `token` key for HuggingFace downloads
    pub huggingface: String,
}

impl Default for SecretNames {
    fn default() -> Self {
        Self {
            huggingface: "huggingface".to_string(),
        }
    }
}

/// Autoscaler timing section
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoscalingSection {
    /// Seconds between autoscaler ticks
    pub interval_seconds: u64,
    /// Averaging window in seconds
    pub time_window_seconds: u64,
    /// ConfigMap persisting per-model averages across restarts
    pub state_config_map_name: String,
    /// Fixed peer metric addresses, bypassing self-endpoint discovery (tests)
    pub fixed_self_metric_addrs: Vec<String>,
}

impl Default for AutoscalingSection {
    fn default() -> Self {
        Self {
            interval_seconds: 10,
            time_window_seconds: 600,
            state_config_map_name: "strato-autoscaler-state".to_string(),
            fixed_self_metric_addrs: Vec::new(),
        }
    }
}

/// Rollout bounds section
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolloutSection {
    /// Extra pods allowed above desired during a rollout (percent, rounded up)
    pub max_surge_percent: u32,
    /// Ready pods that may be missing below desired (percent, rounded up)
    pub max_unavailable_percent: u32,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            max_surge_percent: 25,
            max_unavailable_percent: 25,
        }
    }
}

/// Admission proxy section
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxySection {
    /// Retries after a replica vanishes mid-request
    pub max_retries: u32,
    /// Per-request admission timeout in seconds
    pub request_timeout_seconds: u64,
    /// Largest request body the proxy will buffer
    pub max_body_bytes: usize,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout_seconds: 600,
            max_body_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, or defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("reading config {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::config(format!("parsing config {}: {}", path.display(), e)))
    }

    /// Reject configurations the control plane cannot run with
    pub fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("invalid apiAddr {:?}: {}", self.api_addr, e)))?;

        if self.model_autoscaling.interval_seconds == 0 {
            return Err(Error::config("modelAutoscaling.intervalSeconds must be positive"));
        }
        if self.model_autoscaling.time_window_seconds < self.model_autoscaling.interval_seconds {
            return Err(Error::config(
                "modelAutoscaling.timeWindowSeconds must be at least one interval",
            ));
        }
        if self.model_rollouts.max_surge_percent > 100
            || self.model_rollouts.max_unavailable_percent > 100
        {
            return Err(Error::config("modelRollouts percentages must be <= 100"));
        }

        for (name, profile) in &self.resource_profiles {
            for quantity in profile.requests.values().chain(profile.limits.values()) {
                mul_quantity(quantity, 1).map_err(|e| {
                    Error::config(format!("resourceProfiles.{}: {}", name, e))
                })?;
            }
        }

        Ok(())
    }

    /// The gateway bind address (validated)
    pub fn api_socket_addr(&self) -> SocketAddr {
        self.api_addr
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], DEFAULT_MODEL_PORT)))
    }

    /// Autoscaler view of this configuration
    pub fn autoscaling_config(&self) -> AutoscalingConfig {
        AutoscalingConfig {
            interval: Duration::from_secs(self.model_autoscaling.interval_seconds),
            time_window: Duration::from_secs(self.model_autoscaling.time_window_seconds),
            metrics_port: self.api_socket_addr().port(),
            fixed_self_metric_addrs: self.model_autoscaling.fixed_self_metric_addrs.clone(),
        }
    }

    /// Reconciler view of the rollout bounds
    pub fn rollout_config(&self) -> RolloutConfig {
        RolloutConfig {
            max_surge_percent: self.model_rollouts.max_surge_percent,
            max_unavailable_percent: self.model_rollouts.max_unavailable_percent,
        }
    }

    /// Proxy view of this configuration
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            max_retries: self.proxy.max_retries,
            request_timeout: Duration::from_secs(self.proxy.request_timeout_seconds),
            max_body_bytes: self.proxy.max_body_bytes,
            rewrite_host: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_valid() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.api_addr, "0.0.0.0:8000");
        assert_eq!(cfg.model_autoscaling.interval_seconds, 10);
        assert_eq!(cfg.proxy.max_retries, 3);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let cfg: Config = serde_yaml::from_str(
            r#"
            modelAutoscaling:
              intervalSeconds: 5
            proxy:
              maxRetries: 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.model_autoscaling.interval_seconds, 5);
        assert_eq!(cfg.model_autoscaling.time_window_seconds, 600);
        assert_eq!(cfg.proxy.max_retries, 1);
        assert_eq!(cfg.proxy.request_timeout_seconds, 600);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cfg: Config = serde_yaml::from_str("modelAutoscaling: { intervalSeconds: 0 }").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_shorter_than_interval_is_rejected() {
        let cfg: Config = serde_yaml::from_str(
            "modelAutoscaling: { intervalSeconds: 60, timeWindowSeconds: 30 }",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_api_addr_is_rejected() {
        let cfg: Config = serde_yaml::from_str("apiAddr: not-an-addr").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_profile_quantity_is_rejected() {
        let cfg: Config = serde_yaml::from_str(
            r#"
            resourceProfiles:
              cpu:
                requests:
                  cpu: "notaquantity"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn profiles_parse_with_quantities() {
        let cfg: Config = serde_yaml::from_str(
            r#"
            resourceProfiles:
              nvidia-gpu-l4:
                imageName: gpu
                requests:
                  cpu: "4"
                  memory: 16Gi
                  nvidia.com/gpu: "1"
                nodeSelector:
                  cloud.google.com/gke-accelerator: nvidia-l4
                runtimeClassName: nvidia
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_ok());
        let profile = &cfg.resource_profiles["nvidia-gpu-l4"];
        assert_eq!(profile.image_name.as_deref(), Some("gpu"));
        assert_eq!(profile.requests["memory"].0, "16Gi");
    }

    #[test]
    fn autoscaling_config_derives_window_count() {
        let cfg: Config = serde_yaml::from_str(
            "modelAutoscaling: { intervalSeconds: 10, timeWindowSeconds: 600 }",
        )
        .unwrap();
        assert_eq!(cfg.autoscaling_config().window_count(), 60);
        assert_eq!(cfg.autoscaling_config().metrics_port, 8000);
    }
}
