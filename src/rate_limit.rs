//! Token bucket guarding outbound cloud API calls.
//!
//! Tokens are tracked in thousandths so refill stays in integer arithmetic:
//! a rate of `n` requests per second refills `n` milli-tokens per
//! millisecond.

use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;

use crate::error::VolumeError;

const MILLI: u64 = 1000;

#[derive(Debug)]
struct Bucket {
    milli_tokens: u64,
    last_refill: Instant,
}

/// Request budget shared by every call of one adapter.
#[derive(Debug)]
pub struct RateBudget {
    per_second: u64,
    capacity: u64,
    bucket: Mutex<Bucket>,
}

impl RateBudget {
    /// Creates a full bucket holding `burst` tokens that refills at
    /// `per_second` tokens per second.
    #[must_use]
    pub fn new(per_second: u32, burst: u32) -> Self {
        let capacity = u64::from(burst.max(1)) * MILLI;
        Self {
            per_second: u64::from(per_second),
            capacity,
            bucket: Mutex::new(Bucket {
                milli_tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes one token.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::RateLimited`] when the bucket is empty; the
    /// request must not be sent.
    pub fn try_acquire(&self) -> Result<(), VolumeError> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed_ms = u64::try_from(now.duration_since(bucket.last_refill).as_millis())
            .unwrap_or(u64::MAX);
        if elapsed_ms > 0 {
            bucket.milli_tokens = bucket
                .milli_tokens
                .saturating_add(elapsed_ms.saturating_mul(self.per_second))
                .min(self.capacity);
            bucket.last_refill = now;
        }

        if bucket.milli_tokens < MILLI {
            return Err(VolumeError::RateLimited(String::from(
                "local API request budget exhausted",
            )));
        }
        bucket.milli_tokens -= MILLI;
        Ok(())
    }
}
