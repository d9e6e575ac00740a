//! Engine configuration and its on-disk form.

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::batcher::DEFAULT_BATCH_WINDOW;
use crate::supervisor::{ReconnectPolicy, ServerEndpoint, SupervisorConfig};

/// Environment variable prefix, e.g. `OQTO_SYNC__RECONNECT__MAX_ATTEMPTS`.
pub const ENV_PREFIX: &str = "OQTO_SYNC";

/// Everything [`crate::SyncEngine`] needs to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub supervisor: SupervisorConfig,
    /// Window for the store's event batcher.
    pub batch_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            batch_window: DEFAULT_BATCH_WINDOW,
        }
    }
}

/// Config file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub reconnect: ReconnectSettings,
    pub heartbeat: HeartbeatSettings,
    pub batch: BatchSettings,
    pub discovery: DiscoverySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub timeout_secs: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self { timeout_secs: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub window_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_BATCH_WINDOW.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    pub interval_secs: u64,
    pub servers: Vec<ServerSettings>,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub url: String,
    pub directory: String,
}

impl Settings {
    /// Layer defaults, the TOML file at `path` (if present), then the
    /// environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            supervisor: SupervisorConfig {
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                    max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                    max_attempts: self.reconnect.max_attempts,
                },
                heartbeat_timeout: Duration::from_secs(self.heartbeat.timeout_secs),
                discovery_interval: Duration::from_secs(self.discovery.interval_secs.max(1)),
            },
            batch_window: Duration::from_millis(self.batch.window_ms),
        }
    }

    pub fn endpoints(&self) -> Vec<ServerEndpoint> {
        self.discovery
            .servers
            .iter()
            .map(|server| ServerEndpoint::new(server.url.clone(), server.directory.clone()))
            .collect()
    }
}
