//! Reconnect backoff policy.
//!
//! Exponential backoff with a cap and symmetric jitter. Retries are unbounded:
//! the connection manager keeps trying for as long as the client lives, and
//! callers decide when to give up by watching the connection state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff configuration for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    pub initial_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_ms: u64,
    /// Growth factor applied per consecutive failure.
    pub multiplier: f64,
    /// Jitter as a fraction of the computed delay (0.0-1.0).
    pub jitter_fraction: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Creates a config with the given initial and maximum delays.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Builder: set the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Builder: set jitter fraction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt after `consecutive_failures` failures,
    /// without jitter. Zero failures means connect immediately.
    pub fn base_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_ms as f64;
        let exponent = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = base * self.multiplier.powi(exponent);
        let max = self.max_ms as f64;

        Duration::from_millis(delay.min(max) as u64)
    }

    /// Delay before the next attempt, with jitter applied and the cap still
    /// honoured.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let base = self.base_delay(consecutive_failures);
        if base.is_zero() || self.jitter_fraction <= 0.0 {
            return base;
        }

        let millis = base.as_millis() as f64;
        let jittered = millis + rand_jitter(millis * self.jitter_fraction);
        let capped = jittered.clamp(0.0, self.max_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Simple pseudo-random jitter in [-range, range], seeded from the clock.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let fraction = (nanos as f64) / 1_000_000_000.0;
    (fraction * 2.0 - 1.0) * range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_failures_is_immediate() {
        let config = BackoffConfig::default();
        assert_eq!(config.base_delay(0), Duration::ZERO);
        assert_eq!(config.delay(0), Duration::ZERO);
    }

    #[test]
    fn doubles_until_capped() {
        let config = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0);

        assert_eq!(config.base_delay(1), Duration::from_millis(100));
        assert_eq!(config.base_delay(2), Duration::from_millis(200));
        assert_eq!(config.base_delay(3), Duration::from_millis(400));
        assert_eq!(config.base_delay(4), Duration::from_millis(800));
        assert_eq!(config.base_delay(5), Duration::from_secs(1));
        assert_eq!(config.base_delay(500), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = BackoffConfig::new(Duration::from_millis(1000), Duration::from_millis(1050))
            .with_jitter(0.5);

        for failures in 1..20 {
            let delay = config.delay(failures);
            assert!(delay >= Duration::from_millis(500), "delay {delay:?}");
            assert!(delay <= Duration::from_millis(1050), "delay {delay:?}");
        }
    }

    #[test]
    fn builder_clamps_inputs() {
        let config = BackoffConfig::default()
            .with_jitter(4.0)
            .with_multiplier(0.5);
        assert_eq!(config.jitter_fraction, 1.0);
        assert_eq!(config.multiplier, 1.0);
    }

    #[test]
    fn deserializes_partial_table() {
        let config: BackoffConfig = serde_json::from_str(r#"{"max_ms": 5000}"#).unwrap();
        assert_eq!(config.max_ms, 5000);
        assert_eq!(config.initial_ms, 500);
    }
}
