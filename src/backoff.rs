//! Exponential backoff for retries that carry no timing hints.
//!
//! Attempt `0` is the initial call and never waits. Retry `n` waits `base * 2^(n-1)` capped at the
//! configured maximum, plus a uniformly random jitter in `[0, jitter]`.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use discord_dispatch::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_secs(1))
//!     .with_max(Duration::from_secs(64))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(4));
//! assert_eq!(backoff.delay(12), Duration::from_secs(64));
//! ```

use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Ceiling applied when a computation would overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Doubling backoff with an optional cap and additive jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
    jitter: Duration,
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None, jitter: Duration::ZERO }
    }

    /// Cap every computed delay (before jitter) at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        if max < self.base {
            return Err(BackoffError::MaxLessThanBase { base: self.base, max });
        }
        self.max = Some(max);
        Ok(self)
    }

    /// Add up to `jitter` of random delay on top of each computed delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic part of the delay for `attempt`.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        self.max.map(|m| delay.min(m)).unwrap_or(delay)
    }

    /// Delay for `attempt` with jitter drawn from the thread-local RNG.
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        self.jittered_delay_with_rng(attempt, &mut rng())
    }

    pub fn jittered_delay_with_rng<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if attempt == 0 || self.jitter.is_zero() {
            return delay;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = Duration::from_millis(rng.random_range(0..=jitter_ms));
        delay.saturating_add(extra).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// One second doubling to a minute, with up to one second of jitter.
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Some(Duration::from_secs(64)),
            jitter: Duration::from_secs(1),
        }
    }
}
