//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Total attempts allowed, including the first one. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: None,
        }
    }
}

impl From<&RetryConfig> for BackoffConfig {
    fn from(retry: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: retry.base_delay_ms,
            max_delay_ms: retry.max_delay_ms,
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: Some(retry.max_attempts.max(1)),
        }
    }
}

/// Tracks attempts and hands out the delay before the next one.
///
/// The first call to [`next_delay`](Self::next_delay) returns the initial
/// delay; each following call multiplies it. Once the attempt budget is spent
/// `next_delay` returns `None`.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failed attempt and return how long to wait before the next one.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if let Some(max) = self.config.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }

        let exponent = (self.attempt - 1) as i32;
        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter_factor > 0.0 {
            let range = capped * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-range..=range);
            (capped + jitter).max(1.0)
        } else {
            capped.max(1.0)
        };

        Some(Duration::from_millis(delay as u64))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts recorded so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn test_delays_double() {
        let mut backoff = ExponentialBackoff::with_config(no_jitter(None));

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn test_caps_at_max() {
        let config = BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            multiplier: 10.0,
            jitter_factor: 0.0,
            max_attempts: None,
        };
        let mut backoff = ExponentialBackoff::with_config(config);

        for _ in 0..5 {
            let delay = backoff.next_delay().unwrap();
            assert!(delay.as_millis() <= 5_000);
        }
    }

    #[test]
    fn test_attempt_budget() {
        // Three attempts total means two waits between them
        let mut backoff = ExponentialBackoff::with_config(no_jitter(Some(3)));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay().is_some());
    }

    #[test]
    fn test_from_retry_config() {
        let retry = RetryConfig {
            base_delay_ms: 100,
            max_attempts: 3,
            max_delay_ms: 2_000,
        };
        let config = BackoffConfig::from(&retry);
        assert_eq!(config.initial_delay_ms, 100);
        assert_eq!(config.max_attempts, Some(3));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = BackoffConfig {
            jitter_factor: 0.1,
            ..no_jitter(None)
        };
        let mut backoff = ExponentialBackoff::with_config(config);
        let delay = backoff.next_delay().unwrap().as_millis();
        assert!((90..=110).contains(&delay));
    }
}
