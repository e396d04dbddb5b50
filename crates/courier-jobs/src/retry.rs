//! Backoff policies for released jobs.
//!
//! Delays never decrease as the attempt count grows. Jitter is added on top
//! of the base delay and stays below the next attempt's base delay, and the
//! cap is applied last.

use crate::config::RetryConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Release immediately.
    None,
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff with optional jitter.
    Exponential,
    /// Linear backoff.
    Linear,
}

/// Backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Initial delay in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier (exponential only).
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0); zero disables jitter.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Creates a policy that releases immediately.
    pub fn none() -> Self {
        Self {
            strategy: RetryStrategy::None,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates a fixed delay policy.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = duration_ms(delay);
        Self {
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff policy (1s, 2s, 4s, ... capped at 1h).
    pub fn exponential() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Creates a linear backoff policy.
    pub fn linear(increment: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            initial_delay_ms: duration_ms(increment),
            max_delay_ms: duration_ms(max_delay),
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier. Values below 1.0 are raised to 1.0.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Enables jitter.
    #[must_use]
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Un-jittered, uncapped delay in milliseconds for an attempt number.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    fn base_delay_ms(&self, attempt: u32) -> u64 {
        if attempt == 0 {
            return 0;
        }

        match self.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::Fixed => self.initial_delay_ms,
            RetryStrategy::Exponential => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let delay = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
                if delay.is_finite() && delay < u64::MAX as f64 {
                    delay as u64
                } else {
                    u64::MAX
                }
            }
            RetryStrategy::Linear => self.initial_delay_ms.saturating_mul(u64::from(attempt)),
        }
    }

    /// Calculates the release delay after the given attempt number.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        if base == 0 {
            return Duration::ZERO;
        }

        let jitter = if self.jitter_factor > 0.0 {
            let next = self.base_delay_ms(attempt.saturating_add(1));
            let gap = next.saturating_sub(base);
            let range = ((base as f64 * self.jitter_factor) as u64).min(gap);
            if range > 0 {
                rand::thread_rng().gen_range(0..range)
            } else {
                0
            }
        } else {
            0
        };

        Duration::from_millis(base.saturating_add(jitter).min(self.max_delay_ms))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            strategy: config.strategy,
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier.max(1.0),
            jitter_factor: if config.jitter {
                config.jitter_factor.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_delay() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential().without_jitter();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy::linear(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_delay(Duration::from_secs(10))
            .without_jitter();

        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jittered_delays_never_decrease() {
        let policies = [
            RetryPolicy::exponential().with_jitter(1.0),
            RetryPolicy::linear(Duration::from_millis(500), Duration::from_secs(30)).with_jitter(0.5),
            RetryPolicy::exponential()
                .with_multiplier(1.1)
                .with_jitter(0.9)
                .with_max_delay(Duration::from_secs(20)),
        ];

        for policy in &policies {
            for _ in 0..50 {
                let mut previous = Duration::ZERO;
                for attempt in 1..=15 {
                    let delay = policy.delay_for_attempt(attempt);
                    assert!(delay >= previous, "{policy:?} attempt {attempt}");
                    previous = delay;
                }
            }
        }
    }
}
