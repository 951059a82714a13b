//! Bounded retry for optimistic-concurrency writes.
//!
//! Compare-and-swap writes (sync point merges, resource row updates) fail
//! when another worker raced them. The caller re-reads and reapplies; this
//! module supplies the loop around that:
//!
//! - **Bounded**: at most `max_attempts` tries, then [`Error::RetriesExhausted`]
//! - **Exponential backoff**: `base_delay * 2^n`, capped at `max_delay`
//! - **Jitter**: a random extra delay so racing writers spread out
//!
//! # Example
//!
//! ```rust
//! use converge_core::retry::{Attempt, RetryPolicy, retry_on_conflict};
//!
//! # async fn demo() -> converge_core::Result<()> {
//! let mut tries = 0;
//! let value = retry_on_conflict(&RetryPolicy::default(), || {
//!     tries += 1;
//!     let outcome = if tries < 3 { Attempt::Conflict } else { Attempt::Done(tries) };
//!     async move { Ok::<_, converge_core::Error>(outcome) }
//! })
//! .await?;
//! assert_eq!(value, 3);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default number of attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 60;

/// Default base backoff.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1);

/// Default backoff ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one attempt of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// The write applied; stop retrying.
    Done(T),
    /// Another writer won the race; re-read and try again.
    Conflict,
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit limits.
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// A policy that never sleeps. Useful in tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Widens the base delay in proportion to the number of expected racers.
    ///
    /// With more than two writers converging on the same row, conflicts are
    /// likely; spreading the first retries avoids a thundering herd.
    #[must_use]
    pub fn scaled_for(&self, racers: usize) -> Self {
        let factor = u32::try_from(racers.saturating_sub(2).max(1)).unwrap_or(u32::MAX);
        Self {
            base_delay: self.base_delay.saturating_mul(factor).min(self.max_delay),
            ..*self
        }
    }

    /// Backoff to apply after the given (zero-based) failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.max_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay
            .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
            .min(self.max_delay);
        exp + jitter(exp)
    }
}

/// Random extra delay in `[0, bound / 2]`.
fn jitter(bound: Duration) -> Duration {
    let half = u64::try_from(bound.as_micros() / 2).unwrap_or(u64::MAX);
    if half == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(rand::rng().random_range(0..=half))
}

/// Runs `op` until it reports [`Attempt::Done`] or the budget is spent.
///
/// `op` is responsible for re-reading any state it depends on; each call is
/// a fresh attempt. Errors returned by `op` abort the loop immediately.
///
/// # Errors
///
/// Returns the first error from `op`, or [`Error::RetriesExhausted`] (converted
/// into `E`) when every attempt conflicted.
pub async fn retry_on_conflict<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, E>>,
    E: From<Error>,
{
    let max_attempts = policy.max_attempts.max(1);
    for attempt in 0..max_attempts {
        match op().await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Conflict => {
                tracing::trace!(attempt, "compare-and-swap conflict; retrying");
                if attempt + 1 < max_attempts {
                    let delay = policy.delay_for(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
    Err(Error::RetriesExhausted {
        attempts: max_attempts,
    }
    .into())
}
