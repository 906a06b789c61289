//! Reconnect backoff for discovery streams.

use std::time::Duration;

use crate::config::DiscoveryConfig;

/// Largest fraction jitter adds to a delay.
const MAX_JITTER: f64 = 0.25;

/// Exponential backoff with up to 25% jitter, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect
    pub initial_delay: Duration,
    /// Ceiling no delay exceeds, jitter included
    pub max_delay: Duration,
    /// Growth factor per failed attempt
    pub multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Build from the discovery configuration.
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            multiplier: config.backoff_multiplier,
            jitter: true,
        }
    }

    /// Disable jitter, for deterministic tests.
    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before reconnect attempt `attempt` (zero based).
    ///
    /// Jitter stretches the exponential delay by up to a quarter; the result
    /// never exceeds `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.max_delay.as_millis() as f64;
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let grown_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        let stretched_ms = if self.jitter {
            grown_ms * (1.0 + rand::random::<f64>() * MAX_JITTER)
        } else {
            grown_ms
        };

        Duration::from_millis(stretched_ms.min(ceiling_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay < Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_jitter_never_passes_ceiling() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        };
        let worst = (0..200).map(|_| policy.delay_for_attempt(20)).max().unwrap();
        assert!(worst <= policy.max_delay, "worst delay {worst:?}");
        assert_eq!(worst, policy.max_delay);
    }
}
