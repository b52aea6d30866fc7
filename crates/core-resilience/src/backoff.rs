//! Backoff policy for retried transfers
//!
//! When the server answers with a retryable status but no `Retry-After`
//! hint, callers back off exponentially starting from `initial_delay`
//! (one second by default) and capped at `max_delay`.
//!
//! # Example
//!
//! ```
//! use skyhaul_core_resilience::backoff::{BackoffStrategy, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy {
//!     max_attempts: 5,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(30),
//!     backoff: BackoffStrategy::Exponential,
//!     ..Default::default()
//! };
//!
//! assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
//! assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,

    /// Linear increase in delay
    Linear,

    /// Exponential increase in delay (2^n)
    Exponential,

    /// Exponential with random jitter to prevent thundering herd
    #[default]
    ExponentialWithJitter,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Delay before the first retry; also the floor applied when the
    /// server asks for a retry without saying how long to wait
    #[serde(with = "millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Backoff strategy to use
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.3,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate the backoff delay before retry number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.saturating_pow(attempt - 1);
                self.initial_delay.saturating_mul(multiplier)
            }
            BackoffStrategy::Fixed => self.initial_delay,
        };

        let capped_delay = base_delay.min(self.max_delay);

        if matches!(self.backoff, BackoffStrategy::ExponentialWithJitter) && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            let jitter_amount = capped_delay.as_secs_f64() * jitter;
            capped_delay + Duration::from_secs_f64(jitter_amount)
        } else {
            capped_delay
        }
    }

    /// Delay to wait before retry number `attempt`, given the server's hint.
    ///
    /// A server-supplied wait is honoured as-is unless our own backoff is longer.
    pub fn delay_for(&self, attempt: u32, server_hint: Duration) -> Duration {
        server_hint.max(self.calculate_delay(attempt))
    }

    /// True while another attempt is allowed after `attempts_made` attempts
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff,
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_delay() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..no_jitter(BackoffStrategy::Exponential)
        };
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(5));
        // Large attempt numbers must not overflow
        assert_eq!(policy.calculate_delay(200), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(linear.calculate_delay(3), Duration::from_millis(300));

        let fixed = no_jitter(BackoffStrategy::Fixed);
        assert_eq!(fixed.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(fixed.calculate_delay(9), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::ExponentialWithJitter,
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..50 {
            let delay = policy.calculate_delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_default_floor_is_one_second() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(policy.max_attempts, 5);
    }

    #[test]
    fn test_server_hint_respected() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        assert_eq!(
            policy.delay_for(1, Duration::from_secs(30)),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.delay_for(2, Duration::ZERO),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_allows_another() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
        assert!(!RetryPolicy::no_retry().allows_another(1));
    }

    #[test]
    fn test_serde_roundtrip_uses_millis() {
        let policy = no_jitter(BackoffStrategy::Linear);
        let json = serde_json::to_string(&policy).unwrap();
        assert!(json.contains("\"initial_delay\":100"));
        let back: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
