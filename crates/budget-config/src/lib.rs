#![deny(warnings)]

//! YAML configuration for the allocation engine and its simulation gateway.

use budget_core::{MetricClass, EPSILON};
use budget_econ::{MetricClassifier, RescaleParams, DEFAULT_ROAS_ELASTICITY};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid yaml: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Endpoints of the server-side simulator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub simulate_path: String,
    pub refresh_path: String,
    pub cleanup_path: String,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            simulate_path: "/impact/simulate".to_string(),
            refresh_path: "/impact/refresh".to_string(),
            cleanup_path: "/impact/cleanup".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    fn join(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn simulate_url(&self) -> String {
        self.join(&self.simulate_path)
    }

    pub fn refresh_url(&self) -> String {
        self.join(&self.refresh_path)
    }

    pub fn cleanup_url(&self) -> String {
        self.join(&self.cleanup_path)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Engine settings. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// No-op, reset and conservation tolerance.
    pub epsilon: f64,
    pub roas_elasticity: f64,
    /// Initial state of the total-budget lock.
    pub locked_by_default: bool,
    /// Aggregate currency when no forecast carries one.
    pub default_currency: String,
    pub gateway: GatewayConfig,
    /// Extra metric names merged over the built-in classification.
    pub metric_classes: BTreeMap<String, MetricClass>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            epsilon: EPSILON,
            roas_elasticity: DEFAULT_ROAS_ELASTICITY,
            locked_by_default: true,
            default_currency: "£".to_string(),
            gateway: GatewayConfig::default(),
            metric_classes: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: EngineConfig = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let cfg = Self::from_yaml_str(&text)?;
        info!(path = %path.as_ref().display(), "engine config loaded");
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "epsilon must be > 0, got {}",
                self.epsilon
            )));
        }
        if !(self.roas_elasticity.is_finite() && self.roas_elasticity >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "roas_elasticity must be >= 0, got {}",
                self.roas_elasticity
            )));
        }
        if self.gateway.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("gateway.base_url is empty".into()));
        }
        Ok(())
    }

    /// Built-in classification with this config's overrides applied.
    pub fn classifier(&self) -> MetricClassifier {
        MetricClassifier::builtin().with_overrides(
            self.metric_classes
                .iter()
                .map(|(name, class)| (name.as_str(), *class)),
        )
    }

    pub fn rescale_params(&self) -> RescaleParams {
        RescaleParams {
            roas_elasticity: self.roas_elasticity,
        }
    }
}
