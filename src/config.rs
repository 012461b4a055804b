//! Configuration for the whole sensor → controller → limiter pipeline.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ControllerConfig, LimiterConfig, MonitorConfig};

/// All the knobs of a [Warden](crate::Warden).
///
/// Every field is optional when deserializing; missing ones take their defaults.
///
/// ```toml
/// interval_ms = 500
///
/// [controller]
/// lag_threshold_ms = 50.0
/// max_concurrency = 64
///
/// [limiter]
/// max_queue = 200
/// queue_timeout_ms = 2000
///
/// [monitor]
/// resolution_ms = 10
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Time between control ticks (default: 1000ms).
    pub interval_ms: u64,
    pub controller: ControllerConfig,
    pub limiter: LimiterConfig,
    pub monitor: MonitorConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            controller: ControllerConfig::default(),
            limiter: LimiterConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl WardenConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn interval(&self) -> Duration {
        // A zero period would make `tokio::time::interval` panic.
        Duration::from_millis(self.interval_ms.max(1))
    }
}
