//! Retry policy: maps error class to a retry decision with full-jitter
//! exponential backoff (spec.md §4.10). Generalizes the teacher's fixed
//! exponential-backoff retry loop (`resilience/retry.rs`) from a single
//! multiplier/delay pair applied uniformly to every error, to a policy
//! keyed on the closed [`ErrorClass`] set with randomized delay.

use rand::Rng;
use roboppi_common::ErrorClass;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// spec.md §4.10: retryable classes (transient, rate-limit, network,
/// service) retry iff `attempt_index < max_attempts - 1`, with delay
/// drawn uniformly from `[0, min(max_delay, base_delay * 2^attempt_index))`
/// (full-jitter). Non-retryable classes, including fatal, never retry.
pub fn decide(
    config: &RetryConfig,
    class: ErrorClass,
    attempt_index: u32,
    max_attempts: u32,
) -> RetryDecision {
    if !class.is_retryable() {
        return RetryDecision::GiveUp;
    }
    if attempt_index + 1 >= max_attempts {
        return RetryDecision::GiveUp;
    }

    let exp = config.base_delay.saturating_mul(1u32.checked_shl(attempt_index).unwrap_or(u32::MAX));
    let bound = exp.min(config.max_delay);
    let jittered = if bound.is_zero() {
        Duration::ZERO
    } else {
        let millis = rand::thread_rng().gen_range(0..=bound.as_millis().max(1) as u64);
        Duration::from_millis(millis)
    };
    RetryDecision::Retry { delay: jittered }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn non_retryable_gives_up_immediately() {
        let decision = decide(&RetryConfig::default(), ErrorClass::NonRetryable, 0, 5);
        assert_eq!(decision, RetryDecision::GiveUp);
    }

    #[test]
    fn fatal_gives_up_immediately() {
        let decision = decide(&RetryConfig::default(), ErrorClass::Fatal, 0, 5);
        assert_eq!(decision, RetryDecision::GiveUp);
    }

    #[test]
    fn retryable_gives_up_once_attempts_exhausted() {
        let decision = decide(&RetryConfig::default(), ErrorClass::RetryableNetwork, 4, 5);
        assert_eq!(decision, RetryDecision::GiveUp);
    }

    #[test]
    fn retryable_retries_within_budget() {
        let decision = decide(&RetryConfig::default(), ErrorClass::RetryableTransient, 0, 5);
        match decision {
            RetryDecision::Retry { delay } => assert!(delay <= Duration::from_millis(200)),
            RetryDecision::GiveUp => panic!("expected a retry decision"),
        }
    }

    #[test]
    fn delay_is_bounded_by_max_delay() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(2),
        };
        let decision = decide(&config, ErrorClass::RetryableService, 10, 20);
        match decision {
            RetryDecision::Retry { delay } => assert!(delay <= Duration::from_secs(2)),
            RetryDecision::GiveUp => panic!("expected a retry decision"),
        }
    }
}
