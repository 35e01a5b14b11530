use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::window::Window;
use super::{BucketError, OnLimited, TokenBucket};
use crate::clock::{Clock, MonotonicClock};

/// Caps `capacity` acquisitions per window of fixed length.
///
/// The first window starts at construction with the bucket full.
///
/// ```rust
/// use std::time::Duration;
/// use discord_dispatch::{FixedWindowBucket, TokenBucket};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let bucket = FixedWindowBucket::new(2, Duration::from_secs(1));
/// bucket.acquire(1).await.unwrap();
/// bucket.acquire(1).await.unwrap();
/// assert!(bucket.is_limiting());
/// # });
/// ```
#[derive(Debug)]
pub struct FixedWindowBucket {
    window: Window,
}

impl FixedWindowBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self::with_clock(capacity, window, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(capacity: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { window: Window::new(capacity, capacity, window, clock) }
    }

    pub fn window(&self) -> Duration {
        self.window.window()
    }

    pub fn time_until_reset(&self) -> Duration {
        self.window.time_until_reset()
    }

    /// Callers currently queued.
    pub fn pending(&self) -> usize {
        self.window.pending()
    }
}

#[async_trait]
impl TokenBucket for FixedWindowBucket {
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
