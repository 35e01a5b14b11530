//! Windowed token buckets.
//!
//! Both bucket flavours share one window core: a capacity, a remaining-slot counter, a reset
//! deadline and a FIFO queue of suspended callers. Windows reset lazily whenever a caller looks at
//! the bucket; there is no background timer.
//!
//! - [`FixedWindowBucket`]: parameters fixed at construction.
//! - [`VariableWindowBucket`]: re-parameterized from server rate-limit headers.

use async_trait::async_trait;

pub mod fixed;
pub mod variable;
pub(crate) mod window;

pub use fixed::FixedWindowBucket;
pub use variable::VariableWindowBucket;

/// Callback run once when an acquire has to wait.
pub type OnLimited = Box<dyn FnOnce() + Send>;

/// Errors surfaced by bucket acquisition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketError {
    /// More slots were requested than the bucket can ever hold.
    #[error("cannot acquire {requested} slots from a bucket with capacity {capacity}")]
    InvalidAcquisition { requested: u32, capacity: u32 },
    /// The bucket was closed while the caller was queued (or before it arrived).
    #[error("bucket closed")]
    Closed,
}

/// Common surface of the windowed buckets.
#[async_trait]
pub trait TokenBucket: Send + Sync + std::fmt::Debug {
    /// Take `amount` slots, suspending in FIFO order until they are available.
    ///
    /// `on_limited` runs exactly once if (and only if) the call has to wait.
    async fn acquire_with(
        &self,
        amount: u32,
        on_limited: Option<OnLimited>,
    ) -> Result<(), BucketError>;

    async fn acquire(&self, amount: u32) -> Result<(), BucketError> {
        self.acquire_with(amount, None).await
    }

    /// True exactly when no slots are left in the current window.
    fn is_limiting(&self) -> bool;

    fn remaining(&self) -> u32;

    fn capacity(&self) -> u32;

    /// Reject every queued caller with [`BucketError::Closed`], returning how many were waiting.
    fn close(&self) -> usize;
}
