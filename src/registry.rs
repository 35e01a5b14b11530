//! Resource to bucket mapping owned by a dispatcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bucket::{TokenBucket, VariableWindowBucket};
use crate::clock::Clock;
use crate::resource::Resource;

/// How often [`BucketRegistry::spawn_gc`] runs by default.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(20);
/// Shortest accepted collection interval; `tokio::time::interval` rejects zero.
pub const MIN_GC_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct Inner {
    buckets: Mutex<HashMap<String, Arc<VariableWindowBucket>>>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(slot) = self.gc_task.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// At most one bucket per bucket key.
///
/// Lookup and insertion happen under one lock, so concurrent first requests for the same route
/// can never create two buckets.
#[derive(Debug, Clone)]
pub struct BucketRegistry {
    inner: Arc<Inner>,
    clock: Arc<dyn Clock>,
}

impl BucketRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: Mutex::new(HashMap::new()),
                gc_task: Mutex::new(None),
            }),
            clock,
        }
    }

    pub fn get(&self, resource: &Resource) -> Option<Arc<VariableWindowBucket>> {
        let buckets = self.inner.buckets.lock().expect("bucket registry poisoned");
        buckets.get(resource.bucket_key()).cloned()
    }

    /// Existing bucket for `resource`, or a new one seeded with `capacity` slots per `window`.
    ///
    /// The flag is true when the bucket was created by this call.
    pub fn get_or_seed(
        &self,
        resource: &Resource,
        capacity: u32,
        window: Duration,
    ) -> (Arc<VariableWindowBucket>, bool) {
        let mut buckets = self.inner.buckets.lock().expect("bucket registry poisoned");
        if let Some(bucket) = buckets.get(resource.bucket_key()) {
            return (bucket.clone(), false);
        }
        debug!(bucket = %resource.bucket_key(), capacity, ?window, "seeding rate limit bucket");
        let bucket = Arc::new(VariableWindowBucket::from_window(
            capacity,
            capacity,
            window,
            self.clock.clone(),
        ));
        buckets.insert(resource.bucket_key().to_string(), bucket.clone());
        (bucket, true)
    }

    pub fn len(&self) -> usize {
        self.inner.buckets.lock().expect("bucket registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop buckets with no waiters whose window ended more than `expire_after` ago.
    ///
    /// Returns the number of buckets removed.
    pub fn gc(&self, expire_after: Duration) -> usize {
        let mut buckets = self.inner.buckets.lock().expect("bucket registry poisoned");
        let before = buckets.len();
        buckets.retain(|_, bucket| Arc::strong_count(bucket) > 1 || !bucket.is_stale(expire_after));
        let purged = before - buckets.len();
        if purged > 0 {
            debug!(purged, alive = buckets.len(), "purged stale rate limit buckets");
        }
        purged
    }

    /// Run [`gc`](Self::gc) every `interval` until the registry is closed or dropped.
    ///
    /// Replaces a previously spawned collector. Intervals below [`MIN_GC_INTERVAL`] are raised to
    /// it. Must be called from within a tokio runtime.
    pub fn spawn_gc(&self, interval: Duration, expire_after: Duration) {
        let interval = interval.max(MIN_GC_INTERVAL);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let clock = self.clock.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                BucketRegistry { inner, clock: clock.clone() }.gc(expire_after);
            }
        });
        if let Some(previous) =
            self.inner.gc_task.lock().expect("bucket registry poisoned").replace(task)
        {
            previous.abort();
        }
    }

    /// Stop the collector and reject every queued caller. Returns how many callers were waiting.
    pub fn close(&self) -> usize {
        if let Some(task) = self.inner.gc_task.lock().expect("bucket registry poisoned").take() {
            task.abort();
        }
        let buckets: Vec<_> = self
            .inner
            .buckets
            .lock()
            .expect("bucket registry poisoned")
            .drain()
            .map(|(_, bucket)| bucket)
            .collect();
        let pending: usize = buckets.iter().map(|bucket| bucket.close()).sum();
        if pending > 0 {
            warn!(pending, "rate limit buckets closed with callers still waiting");
        }
        pending
    }
}
