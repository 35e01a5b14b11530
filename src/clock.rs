//! Clock abstractions used by the windowed buckets.
//!
//! Bucket deadlines are tracked in milliseconds relative to an arbitrary epoch chosen by the clock.
//! Nothing outside a bucket ever compares these values against another time source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Clock abstraction so bucket timing can be faked in tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;
}

/// Monotonic clock backed by `tokio::time::Instant`.
///
/// Follows tokio's paused test clock, so bucket deadlines and `tokio::time` sleeps advance together
/// under `start_paused`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: tokio::time::Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: tokio::time::Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock for tests that need to step bucket time explicitly.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
