use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::window::Window;
use super::{BucketError, OnLimited, TokenBucket};
use crate::clock::{Clock, MonotonicClock};

/// A windowed bucket whose parameters follow the server.
///
/// `now` and `reset_at` are server wall-clock instants; only their difference is kept; the local
/// deadline is measured on the bucket's own [`Clock`], so skew between the two clocks never leaks
/// into the window.
#[derive(Debug)]
pub struct VariableWindowBucket {
    window: Window,
}

impl VariableWindowBucket {
    pub fn new(total: u32, remaining: u32, now: DateTime<Utc>, reset_at: DateTime<Utc>) -> Self {
        Self::with_clock(total, remaining, now, reset_at, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        total: u32,
        remaining: u32,
        now: DateTime<Utc>,
        reset_at: DateTime<Utc>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::from_window(total, remaining, window_between(now, reset_at), clock)
    }

    /// Build from a window length directly; used for seed buckets that have no server data yet.
    pub fn from_window(
        total: u32,
        remaining: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { window: Window::new(total, remaining, window, clock) }
    }

    /// Re-parameterize from the latest response.
    ///
    /// Queued callers are released only when `remaining` grew past what the bucket was tracking.
    pub fn update(&self, total: u32, remaining: u32, now: DateTime<Utc>, reset_at: DateTime<Utc>) {
        self.window.update(total, remaining, window_between(now, reset_at));
    }

    pub fn window(&self) -> Duration {
        self.window.window()
    }

    pub fn time_until_reset(&self) -> Duration {
        self.window.time_until_reset()
    }

    pub fn pending(&self) -> usize {
        self.window.pending()
    }

    pub(crate) fn is_stale(&self, expire_after: Duration) -> bool {
        self.window.is_stale(expire_after)
    }
}

fn window_between(now: DateTime<Utc>, reset_at: DateTime<Utc>) -> Duration {
    (reset_at - now).to_std().unwrap_or(Duration::ZERO)
}

#[async_trait]
impl TokenBucket for VariableWindowBucket {
    async fn acquire_with(
        &self,
        amount: u32,
        on_limited: Option<OnLimited>,
    ) -> Result<(), BucketError> {
        self.window.acquire(amount, on_limited).await
    }

    fn is_limiting(&self) -> bool {
        self.window.remaining() == 0
    }

    fn remaining(&self) -> u32 {
        self.window.remaining()
    }

    fn capacity(&self) -> u32 {
        self.window.capacity()
    }

    fn close(&self) -> usize {
        self.window.close()
    }
}
