//! Retry and backoff policy.
//!
//! The publisher retries failed Redis operations with exponential backoff;
//! the tailer reopens a failed cursor after a fixed delay. [`RetryConfig`]
//! captures the exponential policy in one place.

use std::time::Duration;

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double the delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate the delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);

        std::cmp::min(delay, self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_factor, 2.0);
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_testing_preset_is_fast() {
        let config = RetryConfig::testing();
        assert!(config.delay_for_attempt(10) <= Duration::from_millis(100));
    }
}
