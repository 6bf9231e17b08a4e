//! Interval rate limiter with quota bookkeeping and retry-with-backoff
//!
//! Every outbound Gmail API call passes through [`RateLimiter::wait_if_needed`],
//! which spaces calls at least `1 / requests_per_second` apart and records the
//! quota units the call costs. [`RateLimiter::execute_with_retry`] wraps that
//! gate and the call itself in an exponential backoff loop driven by a
//! [`RetryPolicy`].
//!
//! The limiter is cheap to clone; clones share the same state, so a single
//! instance can be handed to every component that issues calls.

use rand::Rng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RateLimitConfig;
use crate::error::{GmailError, Result};

/// Retry policy value object used by [`RateLimiter::execute_with_retry`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Apply +/-10% jitter to computed delays
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs_f64(config.base_delay_secs),
            max_delay: Duration::from_secs_f64(config.max_delay_secs),
            jitter: config.jitter,
        }
    }

    /// Backoff before retry number `attempt` (1-based), without jitter.
    ///
    /// `min(base * 2^(attempt-1), max)`, raised to the server hint when one
    /// was given.
    pub fn delay_for_attempt(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let computed = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        match hint {
            Some(hint) => computed.max(hint),
            None => computed,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        delay.mul_f64(factor)
    }
}

#[derive(Debug)]
struct RateLimiterState {
    requests_per_second: f64,
    min_interval: Duration,
    /// Only ever moves forward
    last_request: Option<Instant>,
    request_count: u64,
    quota_units_used: u64,
    first_try_successes: u64,
    retried_successes: u64,
    total_retries: u64,
}

/// Interval-based rate limiter shared by every API caller
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterState>>,
}

impl RateLimiter {
    /// Create a limiter allowing `requests_per_second` calls per second
    pub fn new(requests_per_second: f64) -> Self {
        let requests_per_second = if requests_per_second > 0.0 {
            requests_per_second
        } else {
            warn!(
                "Invalid requests_per_second {}, falling back to 10",
                requests_per_second
            );
            10.0
        };

        Self {
            inner: Arc::new(Mutex::new(RateLimiterState {
                requests_per_second,
                min_interval: Duration::from_secs_f64(1.0 / requests_per_second),
                last_request: None,
                request_count: 0,
                quota_units_used: 0,
                first_try_successes: 0,
                retried_successes: 0,
                total_retries: 0,
            })),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_second)
    }

    /// Block until the minimum interval since the last permitted call has
    /// elapsed, then stamp the call and book its quota cost.
    ///
    /// The lock is held across the sleep so that two concurrent callers can
    /// never both observe "enough time has passed" for the same slot.
    pub async fn wait_if_needed(&self, quota_cost: u32) {
        let mut state = self.inner.lock().await;

        if let Some(last) = state.last_request {
            let elapsed = last.elapsed();
            if elapsed < state.min_interval {
                let wait = state.min_interval - elapsed;
                trace!("Rate limiter sleeping {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        let now = Instant::now();
        state.last_request = Some(match state.last_request {
            Some(last) if last > now => last,
            _ => now,
        });
        state.request_count += 1;
        state.quota_units_used += quota_cost as u64;
    }

    /// Run `operation` behind the rate gate, retrying retryable failures with
    /// exponential backoff.
    ///
    /// Every attempt passes through [`wait_if_needed`](Self::wait_if_needed),
    /// so `request_count` and `quota_units_used` count attempts rather than
    /// logical calls. Non-retryable errors propagate immediately; once
    /// `max_retries` retries are spent the last error is wrapped in
    /// [`GmailError::RateLimitExceeded`].
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        operation_name: &str,
        quota_cost: u32,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0u32;

        loop {
            self.wait_if_needed(quota_cost).await;

            match operation().await {
                Ok(value) => {
                    let mut state = self.inner.lock().await;
                    if retries == 0 {
                        state.first_try_successes += 1;
                    } else {
                        state.retried_successes += 1;
                        info!(
                            "{} succeeded after {} retr{}",
                            operation_name,
                            retries,
                            if retries == 1 { "y" } else { "ies" }
                        );
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => {
                    debug!("{} failed with non-retryable error: {}", operation_name, e);
                    return Err(e);
                }
                Err(e) if retries >= policy.max_retries => {
                    warn!(
                        "{} giving up after {} attempts: {}",
                        operation_name,
                        retries + 1,
                        e
                    );
                    return Err(GmailError::RateLimitExceeded {
                        attempts: retries + 1,
                        last_error: Box::new(e),
                    });
                }
                Err(e) => {
                    retries += 1;
                    let hint = e.retry_after_hint().map(Duration::from_secs);
                    let delay = policy.jittered(policy.delay_for_attempt(retries, hint));
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        retries,
                        policy.max_retries + 1,
                        e,
                        delay
                    );
                    self.inner.lock().await.total_retries += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Get current statistics
    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.inner.lock().await;
        RateLimiterStats {
            requests_per_second: state.requests_per_second,
            min_interval_secs: state.min_interval.as_secs_f64(),
            request_count: state.request_count,
            quota_units_used: state.quota_units_used,
            first_try_successes: state.first_try_successes,
            retried_successes: state.retried_successes,
            total_retries: state.total_retries,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10.0)
    }
}

/// Statistics about rate limiter usage
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub requests_per_second: f64,
    pub min_interval_secs: f64,
    /// Attempts that passed the gate
    pub request_count: u64,
    pub quota_units_used: u64,
    /// Calls that succeeded without a retry
    pub first_try_successes: u64,
    /// Calls that succeeded only after one or more retries
    pub retried_successes: u64,
    pub total_retries: u64,
}
