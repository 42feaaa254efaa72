//! Retry-with-backoff routine bounded by a shared work deadline.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::error::{ErrorClass, VolumeError};

/// Retry parameters for one operation kind.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Factor applied to the delay after every failed attempt.
    pub multiplier: u32,
    /// Upper bound for a single backoff delay.
    pub max_delay: Duration,
    /// Upper bound for the random jitter added to each delay.
    pub jitter: Duration,
    /// Error classes worth another attempt.
    pub retryable: Vec<ErrorClass>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(16),
            jitter: Duration::from_millis(250),
            retryable: vec![ErrorClass::Transient, ErrorClass::RateLimited],
        }
    }
}

impl RetryPolicy {
    /// Returns `true` when `error` should be retried under this policy.
    #[must_use]
    pub fn is_retryable(&self, error: &VolumeError) -> bool {
        self.retryable.contains(&error.class())
    }

    /// Returns the backoff before attempt `attempt + 1`, without jitter.
    ///
    /// `attempt` counts from 1 for the first failed attempt.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        if self.jitter.is_zero() {
            return delay;
        }
        let max_jitter = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=max_jitter);
        delay.saturating_add(Duration::from_millis(jitter))
    }
}

/// Deadline of a shared run that later joiners may push back.
///
/// The deadline only ever moves forward.
#[derive(Clone, Debug)]
pub struct WorkDeadline(Arc<Mutex<Instant>>);

impl WorkDeadline {
    /// Creates a deadline expiring at `deadline`.
    #[must_use]
    pub fn new(deadline: Instant) -> Self {
        Self(Arc::new(Mutex::new(deadline)))
    }

    /// Moves the deadline to `deadline` when that is later than the current one.
    pub fn extend_to(&self, deadline: Instant) {
        let mut current = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if deadline > *current {
            *current = deadline;
        }
    }

    /// Current deadline.
    #[must_use]
    pub fn current(&self) -> Instant {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` once the current deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.current()
    }
}

/// Sleeps until `wake`, or returns `false` when `deadline` passes first
/// without being extended beyond `wake`.
async fn sleep_within(deadline: &WorkDeadline, wake: Instant) -> bool {
    loop {
        let limit = deadline.current();
        if wake <= limit {
            sleep_until(wake).await;
            return true;
        }
        sleep_until(limit).await;
        if deadline.current() <= limit {
            return false;
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, spends the
/// attempt budget, or `deadline` passes.
///
/// The deadline gates new attempts and backoff sleeps. An attempt that was
/// already dispatched is always awaited, so at most one attempt is
/// outstanding at any instant and its outcome is never dropped.
///
/// # Errors
///
/// Returns the first non-retryable error, [`VolumeError::Exhausted`] wrapping
/// the last retryable error, or [`VolumeError::DeadlineExceeded`].
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: &WorkDeadline,
    operation: &str,
    mut op: F,
) -> Result<T, VolumeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VolumeError>>,
{
    let deadline_error = || VolumeError::DeadlineExceeded {
        operation: operation.to_owned(),
    };
    let mut attempt = 0;

    loop {
        if deadline.is_expired() {
            return Err(deadline_error());
        }
        attempt += 1;

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !policy.is_retryable(&error) {
            return Err(error);
        }
        if attempt >= policy.max_attempts {
            warn!(operation, attempt, %error, "retry budget exhausted");
            return Err(VolumeError::Exhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let delay = policy.jittered_backoff(attempt);
        debug!(
            operation,
            attempt,
            %error,
            delay_ms = delay.as_millis(),
            "retrying after retryable failure"
        );
        if !sleep_within(deadline, Instant::now() + delay).await {
            return Err(deadline_error());
        }
    }
}
