//! Bounded retry policy for transport-level failures.
//!
//! The policy is independent of what is being retried: callers hand it an
//! operation and it decides whether and how long to wait between attempts.
//! Delays go through `tokio::time`, so tests drive it with a paused clock.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use super::error::ProviderError;

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// `base * 2^(n-1)` before retry `n`.
    Exponential,
    /// `base * n` before retry `n`.
    Linear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
        }
    }
}

/// Result of running an operation under a policy.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ProviderError>,
    /// Attempts actually made, including the final one.
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let raw = match self.backoff {
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow((retry - 1).min(16));
                self.base_delay.saturating_mul(factor)
            }
            Backoff::Linear => self.base_delay.saturating_mul(retry),
        };
        raw.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or retries run out.
    ///
    /// A remote rate limit that asks for a longer pause than the backoff curve
    /// is honoured, still bounded by `max_delay`.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(err) => {
                    let retries_used = attempt - 1;
                    if !err.is_retryable() || retries_used >= self.max_retries {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                        };
                    }
                    let mut delay = self.delay_for(attempt);
                    if let ProviderError::RateLimited {
                        retry_after: Some(wait),
                        ..
                    } = &err
                    {
                        delay = delay.max((*wait).min(self.max_delay));
                    }
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying provider call"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
