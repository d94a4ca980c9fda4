/*!
 * Configuration management for gatelink.
 *
 * This module loads, layers and exposes the settings used by the protocol
 * bridge: logging, task timeouts, dispatch throttling and the static part of
 * the resource-model configuration (fixed providers, command codes).
 */
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Protocol bridge configuration
    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Gateway name, used in log spans
    #[serde(default = "default_gateway_name")]
    pub gateway_name: String,

    /// Deployment environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (e.g. "info", "gatelink_protocol=debug")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Include the event target in formatted output
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// When a dispatch slot is handed back to the desynchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleasePolicy {
    /// As soon as the task has been handed to the transport
    #[default]
    Dispatch,
    /// Once the dispatched task is executed or aborted
    Completion,
}

/// Dispatch throttling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesynchronizerConfig {
    /// Route dispatch through a desynchronizer
    #[serde(default)]
    pub enabled: bool,

    /// Start with zero credits; nothing is dispatched until unlocked
    #[serde(default)]
    pub locked: bool,

    /// Idle wake-up interval of the dispatch loop, in milliseconds
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,

    /// When a slot is released
    #[serde(default)]
    pub release: ReleasePolicy,
}

/// Protocol bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Default task timeout in milliseconds
    #[serde(default = "default_task_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Dispatch throttling
    #[serde(default)]
    pub desynchronizer: DesynchronizerConfig,

    /// Providers created eagerly at connect time (name -> profile)
    #[serde(default)]
    pub fixed_providers: HashMap<String, String>,

    /// Transport command codes keyed by command name (GET, SET, ...)
    #[serde(default)]
    pub command_codes: HashMap<String, String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            gateway_name: default_gateway_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: true,
        }
    }
}

impl Default for DesynchronizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            locked: false,
            idle_interval_ms: default_idle_interval_ms(),
            release: ReleasePolicy::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_task_timeout_ms(),
            desynchronizer: DesynchronizerConfig::default(),
            fixed_providers: HashMap::new(),
            command_codes: HashMap::new(),
        }
    }
}

fn default_gateway_name() -> String {
    "gatelink".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_idle_interval_ms() -> u64 {
    150
}

fn default_task_timeout_ms() -> u64 {
    5000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut builder = ConfigLib::builder().add_source(defaults);

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                builder = builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            builder = builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!(
            gateway = %config.general.gateway_name,
            fixed_providers = config.bridge.fixed_providers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
