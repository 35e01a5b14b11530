//! Live-updatable settings shared between a dispatcher and its owner.
//!
//! Default uses `ArcSwap` for lock-free reads; feature `adaptive-rwlock` switches to `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared handle to a value that can be replaced while requests are in flight.
///
/// Clones observe the same value. Readers take a snapshot per request, so a change applies to the
/// next request rather than to one that is already retrying.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> T {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            T::clone(&self.inner.load())
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().expect("dynamic config poisoned").clone()
        }
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().expect("dynamic config poisoned") = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;

    #[test]
    fn clones_share_updates() {
        let retries = DynamicConfig::new(5usize);
        let handle = retries.clone();
        handle.set(2);
        assert_eq!(retries.get(), 2);
    }
}
