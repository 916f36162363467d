//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod limits;
mod messaging;

pub use limits::{
    FanoutConfig, ReconnectConfig, ReconnectStrategy, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_RECONNECT_DELAY_MS, MIN_RECONNECT_DELAY_MS,
};
pub use messaging::{BrokerConfig, BrokerSettings, TopologyConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "bridge.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "BRIDGE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "BRIDGE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "BRIDGE_LOG";
/// Environment variable selecting the log output format (`json` or `text`).
pub const LOG_FORMAT_ENV_VAR: &str = "BRIDGE_LOG_FORMAT";

use serde::Deserialize;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Missing required configuration value: {0}")]
    Missing(&'static str),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub broker: BrokerConfig,
    /// Exchange and queue names.
    pub topology: TopologyConfig,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
    /// In-process fan-out.
    pub fanout: FanoutConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `bridge.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, e.g. `BRIDGE__BROKER__HOST`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Validated broker settings. Fails if host, username or password is absent.
    pub fn broker(&self) -> Result<BrokerSettings, ConfigError> {
        self.broker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.broker.host.is_none());
        assert_eq!(config.reconnect.delay_ms, DEFAULT_RECONNECT_DELAY_MS);
        assert_eq!(config.fanout.capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(matches!(config.broker(), Err(ConfigError::Missing(_))));
    }

    #[test]
    #[serial]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broker:\n  host: rabbit.internal\n  username: bridge\n  password: pw\n  port: 5673\n\
             topology:\n  started_queue: custom.started\n\
             reconnect:\n  strategy: exponential\n  delay_ms: 100\n  jitter: true\n"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        let broker = config.broker().unwrap();
        assert_eq!(broker.host, "rabbit.internal");
        assert_eq!(broker.port, 5673);
        assert_eq!(config.topology.started_queue, "custom.started");
        assert_eq!(config.topology.completed_queue, "analysis.completed.bridge");
        assert_eq!(config.reconnect.strategy, ReconnectStrategy::Exponential);
        assert!(config.reconnect.jitter);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "broker:\n  host: from-file\n  username: bridge\n  password: pw\n"
        )
        .unwrap();

        std::env::set_var("BRIDGE__BROKER__HOST", "from-env");
        let result = Config::load(file.path().to_str());
        std::env::remove_var("BRIDGE__BROKER__HOST");

        assert_eq!(result.unwrap().broker().unwrap().host, "from-env");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_error() {
        let result = Config::load(Some("/nonexistent/bridge-config.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
