//! Retry policy for backend operations.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::{BackoffStrategy, PerformanceConfig};
use crate::error::{ErrorClass, HsmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. At least one.
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retryable: HashSet<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(5),
            },
            retryable: Self::default_classes(),
        }
    }
}

impl RetryPolicy {
    fn default_classes() -> HashSet<ErrorClass> {
        [ErrorClass::Connection, ErrorClass::Timeout, ErrorClass::VendorOperation]
            .into_iter()
            .collect()
    }

    /// `retryAttempts` counts retries after the first attempt.
    pub fn from_config(perf: &PerformanceConfig) -> Self {
        let base = Duration::from_millis(perf.retry_backoff.base_delay_ms);
        let backoff = match perf.retry_backoff.strategy {
            BackoffStrategy::Fixed => Backoff::Fixed(base),
            BackoffStrategy::Exponential => Backoff::Exponential {
                base,
                max: Duration::from_millis(perf.retry_backoff.max_delay_ms.max(perf.retry_backoff.base_delay_ms)),
            },
        };
        Self {
            max_attempts: perf.retry_attempts.saturating_add(1),
            backoff,
            retryable: Self::default_classes(),
        }
    }

    /// An error is retried only if it is transient by nature and its class
    /// is in the policy's set. Validation and policy refusals never are.
    pub fn should_retry(&self, err: &HsmError) -> bool {
        err.is_retryable() && self.retryable.contains(&err.class())
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.checked_mul(factor).map_or(max, |d| d.min(max))
            }
        }
    }
}
