//! Reconnect backoff.
//!
//! Uses `backon` builders for both schedules. A schedule is never allowed to
//! run out: once the builder stops yielding delays, a constant schedule at the
//! fixed delay (or the exponential ceiling) is rebuilt, keeping any jitter.

use std::time::Duration;

use backon::{
    BackoffBuilder, ConstantBackoff, ConstantBuilder, ExponentialBackoff, ExponentialBuilder,
};

use crate::config::{ReconnectConfig, ReconnectStrategy};

/// Steps the builders yield before the schedule is rebuilt.
const SCHEDULE_STEPS: usize = 64;

enum Schedule {
    Constant(ConstantBackoff),
    Exponential(ExponentialBackoff),
}

impl Schedule {
    fn next(&mut self) -> Option<Duration> {
        match self {
            Schedule::Constant(schedule) => schedule.next(),
            Schedule::Exponential(schedule) => schedule.next(),
        }
    }
}

/// Delay source for the supervisor's Backoff state.
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    schedule: Schedule,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let schedule = Self::build_schedule(&config);
        Self { config, schedule }
    }

    /// Builder for the fixed strategy.
    pub fn constant_builder(config: &ReconnectConfig) -> ConstantBuilder {
        Self::ceiling_builder(config, config.delay())
    }

    /// Constant schedule at `delay`, jittered when configured.
    fn ceiling_builder(config: &ReconnectConfig, delay: Duration) -> ConstantBuilder {
        let builder = ConstantBuilder::default()
            .with_delay(delay)
            .with_max_times(SCHEDULE_STEPS);
        if config.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Builder for the exponential strategy.
    ///
    /// - Min delay: `delay_ms`
    /// - Max delay: `max_delay_ms`
    /// - Jitter when configured
    pub fn exponential_builder(config: &ReconnectConfig) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(config.delay())
            .with_max_delay(config.max_delay())
            .with_max_times(SCHEDULE_STEPS);
        if config.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    fn build_schedule(config: &ReconnectConfig) -> Schedule {
        match config.strategy {
            ReconnectStrategy::Fixed => Schedule::Constant(Self::constant_builder(config).build()),
            ReconnectStrategy::Exponential => {
                Schedule::Exponential(Self::exponential_builder(config).build())
            }
        }
    }

    /// Delay the schedule settles on once exhausted.
    fn ceiling(&self) -> Duration {
        match self.config.strategy {
            ReconnectStrategy::Fixed => self.config.delay(),
            ReconnectStrategy::Exponential => self.config.max_delay(),
        }
    }

    /// Delay before the next connection attempt.
    pub fn next_delay(&mut self) -> Duration {
        if let Some(delay) = self.schedule.next() {
            return delay;
        }
        let ceiling = self.ceiling();
        self.schedule = Schedule::Constant(Self::ceiling_builder(&self.config, ceiling).build());
        self.schedule.next().unwrap_or(ceiling)
    }

    /// Start the schedule over, after a connection reached Running.
    pub fn reset(&mut self) {
        self.schedule = Self::build_schedule(&self.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_repeats_forever() {
        let mut backoff = ReconnectBackoff::new(ReconnectConfig::default());
        for _ in 0..(SCHEDULE_STEPS * 2) {
            assert_eq!(backoff.next_delay(), Duration::from_secs(3));
        }
    }

    #[test]
    fn test_fixed_jitter_stays_in_range() {
        let config = ReconnectConfig {
            jitter: true,
            ..ReconnectConfig::default()
        };
        let mut backoff = ReconnectBackoff::new(config);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_jitter_survives_schedule_exhaustion() {
        let config = ReconnectConfig {
            jitter: true,
            ..ReconnectConfig::default()
        };
        let mut backoff = ReconnectBackoff::new(config);
        for _ in 0..SCHEDULE_STEPS {
            backoff.next_delay();
        }

        let later: Vec<Duration> = (0..SCHEDULE_STEPS).map(|_| backoff.next_delay()).collect();
        assert!(later
            .iter()
            .all(|d| *d >= Duration::from_secs(3) && *d <= Duration::from_secs(6)));
        assert!(later.iter().any(|d| *d != Duration::from_secs(3)));
    }

    #[test]
    fn test_exponential_ceiling_keeps_jitter() {
        let config = ReconnectConfig {
            strategy: ReconnectStrategy::Exponential,
            delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: true,
        };
        let mut backoff = ReconnectBackoff::new(config);
        for _ in 0..SCHEDULE_STEPS {
            backoff.next_delay();
        }

        let later: Vec<Duration> = (0..SCHEDULE_STEPS).map(|_| backoff.next_delay()).collect();
        assert!(later
            .iter()
            .all(|d| *d >= Duration::from_secs(1) && *d <= Duration::from_secs(2)));
        assert!(later.iter().any(|d| *d != Duration::from_secs(1)));
    }

    #[test]
    fn test_exponential_grows_and_never_runs_out() {
        let config = ReconnectConfig {
            strategy: ReconnectStrategy::Exponential,
            delay_ms: 100,
            max_delay_ms: 1_000,
            jitter: false,
        };
        let mut backoff = ReconnectBackoff::new(config);

        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert_eq!(first, Duration::from_millis(100));
        assert!(second > first);

        for _ in 0..(SCHEDULE_STEPS * 2) {
            assert!(backoff.next_delay() <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let config = ReconnectConfig {
            strategy: ReconnectStrategy::Exponential,
            delay_ms: 100,
            max_delay_ms: 10_000,
            jitter: false,
        };
        let mut backoff = ReconnectBackoff::new(config);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
