//! Process Configuration
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `SIMULACRUM_` environment variables (`__` separates nested keys, e.g.
//! `SIMULACRUM_MODEL__COMMAND_ADDR`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] figment::Error),
}

/// Complete configuration shared by every process kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulacrumConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub jitter: JitterConfig,
    #[serde(default)]
    pub magnet: MagnetConfig,

    /// Lattice definition for the model authority; the demo lattice is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lattice: Option<PathBuf>,
}

/// Where the model authority listens and what it is called
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub command_addr: String,
    pub broadcast_addr: String,
    pub name: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            command_addr: "127.0.0.1:12312".to_string(),
            broadcast_addr: "127.0.0.1:56789".to_string(),
            name: "SIM".to_string(),
        }
    }
}

/// WebSocket client API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub push_period_ms: u64,
    pub broadcast_period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            push_period_ms: 1000,
            broadcast_period_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn push_period(&self) -> Duration {
        Duration::from_millis(self.push_period_ms.max(1))
    }

    pub fn broadcast_period(&self) -> Duration {
        Duration::from_millis(self.broadcast_period_ms.max(1))
    }
}

/// Random perturbation of the launch position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JitterConfig {
    pub enabled: bool,
    /// Standard deviation in metres
    pub sigma: f64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sigma: 1.2e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnetConfig {
    /// Delay applied by a TRIM before the setpoint reaches the model
    pub settle_ms: u64,
}

impl Default for MagnetConfig {
    fn default() -> Self {
        Self { settle_ms: 200 }
    }
}

impl MagnetConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl SimulacrumConfig {
    /// Load configuration, reading `path` if given
    ///
    /// An explicitly requested file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
        }
        Ok(Self::figment(path).extract()?)
    }

    /// The layered provider stack
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(SimulacrumConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("SIMULACRUM_").split("__"))
    }
}
