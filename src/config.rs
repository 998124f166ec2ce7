//! Operator configuration
//!
//! Per-adapter tuning is read from an optional YAML file (durations as
//! `\d+(ms|s|m|h)` strings); everything has a default so the operator runs
//! with no file at all. Global caps live here as constants.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::crd::parse_duration;
use crate::error::{Error, Result};

/// Per-operation deadline for adapter calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Base backoff delay between retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
/// Exponential backoff never exceeds this.
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Proportional jitter applied to each backoff delay.
pub const RETRY_JITTER: f64 = 0.1;

/// Observed-status cache freshness window.
pub const STATUS_CACHE_TTL: Duration = Duration::from_secs(30);
pub const STATUS_CACHE_CAPACITY: usize = 1000;

/// How often continuous-mode replication is re-checked for resync.
pub const AUTO_RESYNC_CHECK_INTERVAL: Duration = Duration::from_secs(120);

pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Resolved tuning for one adapter instance.
#[derive(Clone, Debug)]
pub struct AdapterConfig {
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub health_check_enabled: bool,
    pub health_check_interval: Duration,
    pub metrics_enabled: bool,
    pub custom_settings: BTreeMap<String, String>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            health_check_enabled: true,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            metrics_enabled: true,
            custom_settings: BTreeMap::new(),
        }
    }
}

/// On-disk shape of one adapter section; every field optional.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdapterConfigFile {
    pub timeout: Option<String>,
    pub retry_attempts: Option<u32>,
    pub retry_delay: Option<String>,
    pub health_check_enabled: Option<bool>,
    pub health_check_interval: Option<String>,
    pub metrics_enabled: Option<bool>,
    #[serde(default)]
    pub custom_settings: BTreeMap<String, String>,
}

impl AdapterConfigFile {
    pub fn resolve(&self) -> Result<AdapterConfig> {
        let mut config = AdapterConfig::default();
        if let Some(raw) = &self.timeout {
            config.timeout = parse_config_duration("timeout", raw)?;
        }
        if let Some(n) = self.retry_attempts {
            config.retry_attempts = n;
        }
        if let Some(raw) = &self.retry_delay {
            config.retry_delay = parse_config_duration("retryDelay", raw)?;
        }
        if let Some(b) = self.health_check_enabled {
            config.health_check_enabled = b;
        }
        if let Some(raw) = &self.health_check_interval {
            config.health_check_interval = parse_config_duration("healthCheckInterval", raw)?;
        }
        if let Some(b) = self.metrics_enabled {
            config.metrics_enabled = b;
        }
        config.custom_settings = self.custom_settings.clone();
        Ok(config)
    }
}

fn parse_config_duration(field: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw).ok_or_else(|| {
        Error::ConfigError(format!(
            "{} '{}' is not a valid duration (expected <number><ms|s|m|h>)",
            field, raw
        ))
    })
}

/// Top-level operator configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Keys are backend tags: `ceph`, `trident`, `powerstore`.
    #[serde(default)]
    pub adapters: BTreeMap<String, AdapterConfigFile>,
}

impl OperatorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("cannot parse {}: {}", path.display(), e)))
    }

    pub fn adapter(&self, backend: &str) -> Result<AdapterConfig> {
        match self.adapters.get(backend) {
            Some(file) => file.resolve(),
            None => Ok(AdapterConfig::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_a_file() {
        let config = OperatorConfig::default().adapter("ceph").unwrap();
        assert_eq!(config.timeout, DEFAULT_TIMEOUT);
        assert_eq!(config.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert!(config.health_check_enabled);
    }

    #[test]
    fn yaml_overrides_selected_fields() {
        let yaml = r#"
adapters:
  trident:
    timeout: 45s
    retryAttempts: 5
    customSettings:
      policy: MirrorAllVolumes
"#;
        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();
        let trident = config.adapter("trident").unwrap();
        assert_eq!(trident.timeout, Duration::from_secs(45));
        assert_eq!(trident.retry_attempts, 5);
        assert_eq!(trident.custom_settings["policy"], "MirrorAllVolumes");
        // Untouched adapters keep defaults.
        let ceph = config.adapter("ceph").unwrap();
        assert_eq!(ceph.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
    }

    #[test]
    fn malformed_duration_is_a_configuration_error() {
        let file = AdapterConfigFile {
            timeout: Some("soon".into()),
            ..Default::default()
        };
        let err = file.resolve().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
