// src/config.rs
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::locator::DEFAULT_EPSILON;

pub const ENV_SESSION_TIMEOUT_MS: &str = "EXCHANGE_SESSION_TIMEOUT_MS";
pub const ENV_LOCATOR_EPSILON: &str = "EXCHANGE_LOCATOR_EPSILON";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Node-local operational settings. Contract rules live in
/// [`crate::contract`] and are the same for every party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long a flow waits for a counterparty message before aborting.
    pub session_timeout_ms: u64,
    /// Amount tolerance used by the record locator.
    pub locator_epsilon: f64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            session_timeout_ms: 30_000,
            locator_epsilon: DEFAULT_EPSILON,
        }
    }
}

impl NodeConfig {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()
    }

    /// Apply `EXCHANGE_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_SESSION_TIMEOUT_MS) {
            self.session_timeout_ms = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_SESSION_TIMEOUT_MS,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_LOCATOR_EPSILON) {
            self.locator_epsilon = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_LOCATOR_EPSILON,
                value,
            })?;
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "session_timeout_ms",
                value: "0".into(),
            });
        }
        if !self.locator_epsilon.is_finite() || self.locator_epsilon < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "locator_epsilon",
                value: self.locator_epsilon.to_string(),
            });
        }
        Ok(self)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}
