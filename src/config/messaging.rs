//! Broker connection and topology configuration.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigError;

/// Default AMQP port.
pub const DEFAULT_AMQP_PORT: u16 = 5672;
/// Default connect timeout in seconds.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
/// Default AMQP heartbeat in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u16 = 30;

/// Broker section as read from config sources.
///
/// `host`, `username` and `password` have no defaults; use
/// [`BrokerConfig::validate`] to obtain usable [`BrokerSettings`].
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: Option<String>,
    pub port: u16,
    pub vhost: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout_secs: u64,
    pub heartbeat_secs: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_AMQP_PORT,
            vhost: "/".to_string(),
            username: None,
            password: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .finish()
    }
}

impl BrokerConfig {
    /// Check required fields and produce connection settings.
    pub fn validate(&self) -> Result<BrokerSettings, ConfigError> {
        Ok(BrokerSettings {
            host: required(&self.host, "broker.host")?,
            port: self.port,
            vhost: self.vhost.clone(),
            username: required(&self.username, "broker.username")?,
            password: required(&self.password, "broker.password")?,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            heartbeat_secs: self.heartbeat_secs,
        })
    }
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.clone()),
        _ => Err(ConfigError::Missing(field)),
    }
}

/// Validated broker connection settings.
#[derive(Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub heartbeat_secs: u16,
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field("password", &"***")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl BrokerSettings {
    /// Settings for a local broker, mainly for tests.
    pub fn local(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_AMQP_PORT,
            vhost: "/".to_string(),
            username: username.into(),
            password: password.into(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }

    /// `host:port/vhost`, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, display_vhost(&self.vhost))
    }
}

fn display_vhost(vhost: &str) -> String {
    if vhost.starts_with('/') {
        vhost.to_string()
    } else {
        format!("/{}", vhost)
    }
}

/// Exchange and queue names for the inbound bindings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub started_exchange: String,
    pub started_queue: String,
    pub completed_exchange: String,
    pub completed_queue: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            started_exchange: "analysis.started".to_string(),
            started_queue: "analysis.started.bridge".to_string(),
            completed_exchange: "analysis.completed".to_string(),
            completed_queue: "analysis.completed.bridge".to_string(),
        }
    }
}
