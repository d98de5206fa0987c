//! Retry policies.
//!
//! Each registered node carries a [`RetryPolicy`] that decides how many
//! times an errored state is re-created and how long to wait before each
//! attempt. Delay computation dispatches on the strategy tag; jitter
//! variants draw from `rand`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryError {
    #[error("retry count must be greater than or equal to 1, got {0}")]
    InvalidRetryCount(u32),
}

/// Backoff strategy. The base delay grows exponentially, linearly, or not
/// at all; each base has a full-jitter variant (`uniform(0, base)`) and an
/// equal-jitter variant (`base/2 + uniform(0, base/2)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    ExponentialFullJitter,
    ExponentialEqualJitter,
    Linear,
    LinearFullJitter,
    LinearEqualJitter,
    Fixed,
    FixedFullJitter,
    FixedEqualJitter,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exponential => "EXPONENTIAL",
            Self::ExponentialFullJitter => "EXPONENTIAL_FULL_JITTER",
            Self::ExponentialEqualJitter => "EXPONENTIAL_EQUAL_JITTER",
            Self::Linear => "LINEAR",
            Self::LinearFullJitter => "LINEAR_FULL_JITTER",
            Self::LinearEqualJitter => "LINEAR_EQUAL_JITTER",
            Self::Fixed => "FIXED",
            Self::FixedFullJitter => "FIXED_FULL_JITTER",
            Self::FixedEqualJitter => "FIXED_EQUAL_JITTER",
        }
    }
}

/// Retry policy for one registered node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    pub strategy: RetryStrategy,
    /// Backoff factor in milliseconds.
    pub backoff_factor: u64,
    /// Exponent for the exponential strategies.
    pub exponent: u32,
    /// Upper bound on any computed delay, in milliseconds.
    pub max_delay: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            strategy: RetryStrategy::Exponential,
            backoff_factor: 2000,
            exponent: 2,
            max_delay: None,
        }
    }
}

impl RetryPolicy {
    /// Delay in milliseconds before retry number `retry_count` (1-indexed).
    ///
    /// Arithmetic saturates instead of overflowing; the result is clamped
    /// by `max_delay` when set.
    pub fn compute_delay(&self, retry_count: u32) -> Result<u64, RetryError> {
        if retry_count < 1 {
            return Err(RetryError::InvalidRetryCount(retry_count));
        }

        let exponential = || {
            u64::from(self.exponent)
                .saturating_pow(retry_count - 1)
                .saturating_mul(self.backoff_factor)
        };
        let linear = || self.backoff_factor.saturating_mul(u64::from(retry_count));

        let delay = match self.strategy {
            RetryStrategy::Exponential => exponential(),
            RetryStrategy::ExponentialFullJitter => full_jitter(exponential()),
            RetryStrategy::ExponentialEqualJitter => equal_jitter(exponential()),
            RetryStrategy::Linear => linear(),
            RetryStrategy::LinearFullJitter => full_jitter(linear()),
            RetryStrategy::LinearEqualJitter => equal_jitter(linear()),
            RetryStrategy::Fixed => self.backoff_factor,
            RetryStrategy::FixedFullJitter => full_jitter(self.backoff_factor),
            RetryStrategy::FixedEqualJitter => equal_jitter(self.backoff_factor),
        };

        Ok(match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        })
    }
}

fn full_jitter(base: u64) -> u64 {
    rand::thread_rng().gen_range(0..=base)
}

fn equal_jitter(base: u64) -> u64 {
    let half = base / 2;
    half + rand::thread_rng().gen_range(0..=base - half)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            strategy,
            backoff_factor: 1000,
            exponent: 2,
            max_delay: None,
        }
    }

    #[test]
    fn defaults_match_documented_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.strategy, RetryStrategy::Exponential);
        assert_eq!(policy.backoff_factor, 2000);
        assert_eq!(policy.exponent, 2);
        assert_eq!(policy.max_delay, None);
    }

    #[test]
    fn retry_count_below_one_is_rejected() {
        let err = policy(RetryStrategy::Fixed).compute_delay(0).unwrap_err();
        assert_eq!(err, RetryError::InvalidRetryCount(0));
    }

    #[test]
    fn exponential_grows_by_exponent() {
        let policy = policy(RetryStrategy::Exponential);
        assert_eq!(policy.compute_delay(1).unwrap(), 1000);
        assert_eq!(policy.compute_delay(2).unwrap(), 2000);
        assert_eq!(policy.compute_delay(3).unwrap(), 4000);
        assert_eq!(policy.compute_delay(4).unwrap(), 8000);
    }

    #[test]
    fn linear_grows_by_factor() {
        let policy = policy(RetryStrategy::Linear);
        assert_eq!(policy.compute_delay(1).unwrap(), 1000);
        assert_eq!(policy.compute_delay(2).unwrap(), 2000);
        assert_eq!(policy.compute_delay(3).unwrap(), 3000);
    }

    #[test]
    fn fixed_never_grows() {
        let policy = policy(RetryStrategy::Fixed);
        assert_eq!(policy.compute_delay(1).unwrap(), 1000);
        assert_eq!(policy.compute_delay(7).unwrap(), 1000);
    }

    #[test]
    fn full_jitter_stays_within_base() {
        let policy = policy(RetryStrategy::ExponentialFullJitter);
        for _ in 0..50 {
            let delay = policy.compute_delay(3).unwrap();
            assert!(delay <= 4000);
        }
    }

    #[test]
    fn equal_jitter_stays_within_half_to_base() {
        let policy = policy(RetryStrategy::LinearEqualJitter);
        for _ in 0..50 {
            let delay = policy.compute_delay(2).unwrap();
            assert!((1000..=2000).contains(&delay));
        }
    }

    #[test]
    fn max_delay_clamps_every_strategy() {
        for strategy in [
            RetryStrategy::Exponential,
            RetryStrategy::ExponentialFullJitter,
            RetryStrategy::ExponentialEqualJitter,
            RetryStrategy::Linear,
            RetryStrategy::LinearFullJitter,
            RetryStrategy::LinearEqualJitter,
            RetryStrategy::Fixed,
            RetryStrategy::FixedFullJitter,
            RetryStrategy::FixedEqualJitter,
        ] {
            let policy = RetryPolicy {
                max_delay: Some(150),
                ..policy(strategy)
            };
            assert!(policy.compute_delay(6).unwrap() <= 150);
        }
    }

    #[test]
    fn huge_retry_counts_saturate_instead_of_overflowing() {
        let policy = policy(RetryStrategy::Exponential);
        assert_eq!(policy.compute_delay(200).unwrap(), u64::MAX);
    }

    #[test]
    fn strategy_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&RetryStrategy::ExponentialFullJitter).unwrap(),
            "\"EXPONENTIAL_FULL_JITTER\""
        );
        let parsed: RetryStrategy = serde_json::from_str("\"FIXED_EQUAL_JITTER\"").unwrap();
        assert_eq!(parsed, RetryStrategy::FixedEqualJitter);
    }
}
