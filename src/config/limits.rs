//! Reconnect policy and fan-out capacity.

use std::time::Duration;

use serde::Deserialize;

/// Default delay between reconnect attempts (fixed strategy).
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
/// Floor for any reconnect delay, so a zero setting cannot spin.
pub const MIN_RECONNECT_DELAY_MS: u64 = 10;
/// Default ceiling for the exponential strategy.
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
/// Default per-topic fan-out buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How the delay between reconnect attempts evolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    /// Same delay every time.
    #[default]
    Fixed,
    /// Doubling delay from `delay_ms` up to `max_delay_ms`.
    Exponential,
}

/// Reconnect backoff configuration.
///
/// Retries never stop; only the spacing between them is configurable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub strategy: ReconnectStrategy,
    /// Fixed delay, or the first delay for the exponential strategy.
    pub delay_ms: u64,
    /// Upper bound for the exponential strategy.
    pub max_delay_ms: u64,
    /// Randomize delays to spread out reconnecting workers.
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed,
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay with no jitter.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: ReconnectStrategy::Fixed,
            delay_ms: delay.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Base delay, never below [`MIN_RECONNECT_DELAY_MS`].
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.max(MIN_RECONNECT_DELAY_MS))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms).max(self.delay())
    }
}

/// In-process fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Events buffered per topic before slow subscribers start lagging.
    pub capacity: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults_match_reference_behavior() {
        let config = ReconnectConfig::default();
        assert_eq!(config.strategy, ReconnectStrategy::Fixed);
        assert_eq!(config.delay(), Duration::from_secs(3));
        assert!(!config.jitter);
    }

    #[test]
    fn test_max_delay_never_below_delay() {
        let config = ReconnectConfig {
            delay_ms: 5_000,
            max_delay_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(config.max_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_delay_is_clamped() {
        let config = ReconnectConfig::fixed(Duration::ZERO);
        assert_eq!(config.delay(), Duration::from_millis(MIN_RECONNECT_DELAY_MS));

        let config = ReconnectConfig {
            strategy: ReconnectStrategy::Exponential,
            delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        };
        assert_eq!(config.delay(), Duration::from_millis(MIN_RECONNECT_DELAY_MS));
        assert_eq!(config.max_delay(), Duration::from_millis(MIN_RECONNECT_DELAY_MS));
    }

    #[test]
    fn test_fixed_constructor() {
        let config = ReconnectConfig::fixed(Duration::from_millis(20));
        assert_eq!(config.delay(), Duration::from_millis(20));
        assert_eq!(config.strategy, ReconnectStrategy::Fixed);
    }
}
