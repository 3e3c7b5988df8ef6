//! Orchestrator configuration.
//!
//! Everything is supplied once at construction and never mutated afterwards. Several
//! orchestrators with different configurations can live in one process.
//!
//! ```yaml
//! component: quotes
//! strategies:
//!   strong: { ttl_secs: 5, update_threshold_ratio: 0.3 }
//!   adaptive: { base_ttl_secs: 120, min_ttl_secs: 30, max_ttl_secs: 900 }
//! scheduler:
//!   base_concurrency: 8
//!   batch: { batch_size: 20 }
//! pressure:
//!   memory_threshold: 0.8
//!   memory_critical: 0.9
//! shutdown_timeout_ms: 10000
//! ```

use crate::pressure::PressureConfig;
use crate::scheduler::SchedulerConfig;
use crate::strategy::StrategyConfigs;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_COMPONENT: &str = "smart_cache";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Metrics and log namespace.
    pub component: String,
    pub strategies: StrategyConfigs,
    pub scheduler: SchedulerConfig,
    pub pressure: PressureConfig,
    /// Drain timeout used by [`crate::LifecycleManager::shutdown_default`].
    pub shutdown_timeout_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            component: DEFAULT_COMPONENT.to_string(),
            strategies: StrategyConfigs::default(),
            scheduler: SchedulerConfig::default(),
            pressure: PressureConfig::default(),
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn with_strategies(mut self, strategies: StrategyConfigs) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_pressure(mut self, pressure: PressureConfig) -> Self {
        self.pressure = pressure;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).map_err(|e| parse_error("YAML", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content).map_err(|e| parse_error("JSON", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .map(|s| s.to_ascii_lowercase());
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration_with_context(
                "unable to read configuration file",
                ErrorContext::new()
                    .with_field_path(path.to_string_lossy())
                    .with_details(e.to_string())
                    .with_source("config_loader"),
            )
        })?;
        match extension.as_deref() {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(Error::configuration_with_context(
                "unsupported configuration format",
                ErrorContext::new()
                    .with_field_path(path.to_string_lossy())
                    .with_details(format!(
                        "extension {:?}, expected json, yaml or yml",
                        other.unwrap_or("")
                    ))
                    .with_source("config_loader"),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.component.trim().is_empty() {
            return Err(Error::invalid_config("component", "must not be empty"));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(Error::invalid_config("shutdown_timeout_ms", "must be > 0"));
        }
        self.strategies.validate()?;
        self.scheduler.validate()?;
        self.pressure.validate()
    }
}

fn parse_error(format: &str, err: impl std::fmt::Display) -> Error {
    Error::configuration_with_context(
        format!("unable to parse {} configuration", format),
        ErrorContext::new()
            .with_details(err.to_string())
            .with_source("config_loader"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{AdaptiveConfig, FixedStrategyConfig};

    #[test]
    fn test_defaults_are_valid() {
        let cfg = OrchestratorConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.component, "smart_cache");
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.strategies.strong, FixedStrategyConfig::strong());
    }

    #[test]
    fn test_yaml_partial_overrides() {
        let yaml = r#"
component: quotes
strategies:
  strong: { ttl_secs: 2, update_threshold_ratio: 0.5 }
scheduler:
  base_concurrency: 4
pressure:
  enabled: false
"#;
        let cfg = OrchestratorConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.component, "quotes");
        assert_eq!(cfg.strategies.strong.ttl_secs, 2);
        assert_eq!(cfg.strategies.weak, FixedStrategyConfig::weak());
        assert_eq!(cfg.scheduler.base_concurrency, 4);
        assert_eq!(cfg.scheduler.max_concurrency, 16);
        assert!(!cfg.pressure.enabled);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let yaml = "strategies:\n  volatile: { ttl_secs: 1, update_threshold_ratio: 0.5 }\n";
        let err = OrchestratorConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.is_configuration());
        let ctx = err.context().unwrap();
        assert_eq!(ctx.source.as_deref(), Some("config_loader"));
        assert!(ctx.details.as_deref().unwrap().contains("volatile"));

        let json = r#"{"strategies": {"volatile": {"ttl_secs": 1}}}"#;
        assert!(OrchestratorConfig::from_json_str(json)
            .unwrap_err()
            .is_configuration());
        assert!(OrchestratorConfig::from_yaml_str("component: [")
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_invalid_bounds_fail_validation() {
        let json = r#"{"strategies": {"adaptive": {"base_ttl_secs": 10, "min_ttl_secs": 30, "max_ttl_secs": 60}}}"#;
        let err = OrchestratorConfig::from_json_str(json).unwrap_err();
        assert!(err.is_configuration());

        let cfg = OrchestratorConfig::new().with_strategies(
            StrategyConfigs::new().with_adaptive(AdaptiveConfig::default().with_bounds(60, 30, 90)),
        );
        assert!(cfg.validate().is_err());
        assert!(OrchestratorConfig::new().with_component(" ").validate().is_err());
    }

    #[tokio::test]
    async fn test_from_file_dispatches_on_extension() {
        let dir = std::env::temp_dir().join(format!("smart-cache-config-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let json = dir.join("cache.json");
        tokio::fs::write(&json, r#"{"component": "from-json"}"#).await.unwrap();
        let yml = dir.join("cache.yml");
        tokio::fs::write(&yml, "component: from-yaml\n").await.unwrap();
        let toml = dir.join("cache.toml");
        tokio::fs::write(&toml, "component = 'x'\n").await.unwrap();

        assert_eq!(OrchestratorConfig::from_file(&json).await.unwrap().component, "from-json");
        assert_eq!(OrchestratorConfig::from_file(&yml).await.unwrap().component, "from-yaml");
        assert!(OrchestratorConfig::from_file(&toml).await.unwrap_err().is_configuration());
        assert!(OrchestratorConfig::from_file(dir.join("missing.yaml"))
            .await
            .unwrap_err()
            .is_configuration());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
