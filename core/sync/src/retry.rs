//! Exponential backoff for pass-level retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule for re-running a whole sync pass after a systemic failure.
///
/// Independent of the per-mutation retry count: this only throttles how often
/// the coordinator re-attempts a pass that could not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Number of automatic retries before waiting for an external trigger.
    pub max_attempts: u32,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Create a schedule with the given base delay and attempt cap.
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            ..Self::default()
        }
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (zero-based): `base * multiplier^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // Add random jitter of +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Whether retry number `attempt` (zero-based) is still within budget.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: 5,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = BackoffConfig::new(Duration::from_secs(1), 5);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(16));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = BackoffConfig::new(Duration::from_secs(1), 10)
            .with_max_delay(Duration::from_secs(10))
            .with_multiplier(10.0);

        // 1 * 10^5 = 100000 seconds, but should be capped at 10
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = BackoffConfig::new(Duration::from_millis(1000), 5).with_jitter(true);

        for _ in 0..50 {
            let delay = config.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(750));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_attempt_budget() {
        let config = BackoffConfig::default();
        assert!(config.allows(0));
        assert!(config.allows(4));
        assert!(!config.allows(5));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: BackoffConfig = serde_json::from_str(r#"{"max_attempts": 2}"#).unwrap();
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.base_delay, Duration::from_secs(1));
    }
}
