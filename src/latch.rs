//! Global rate-limit latch.
//!
//! A binary gate shared by every request of a client. While locked, all callers suspend; unlocking
//! releases them together rather than one at a time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bucket::OnLimited;

#[derive(Debug)]
struct LatchInner {
    locked: watch::Sender<bool>,
    /// Bumped by every `lock`; a timer only opens the latch for the lock that armed it.
    generation: AtomicU64,
    unlock_task: Mutex<Option<JoinHandle<()>>>,
}

impl LatchInner {
    fn open(&self) {
        self.locked.send_replace(false);
    }

    /// Open on behalf of the timer armed for `generation`. False when a later lock superseded it.
    fn open_if_current(&self, generation: u64) -> bool {
        let _slot = self.unlock_task.lock().expect("latch timer poisoned");
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.open();
        true
    }
}

impl Drop for LatchInner {
    fn drop(&mut self) {
        if let Ok(slot) = self.unlock_task.get_mut() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

/// Gate for the account-wide rate limit. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct GlobalLatch {
    inner: Arc<LatchInner>,
}

impl Default for GlobalLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalLatch {
    pub fn new() -> Self {
        let (locked, _) = watch::channel(false);
        Self {
            inner: Arc::new(LatchInner {
                locked,
                generation: AtomicU64::new(0),
                unlock_task: Mutex::new(None),
            }),
        }
    }

    pub fn is_locked(&self) -> bool {
        *self.inner.locked.borrow()
    }

    /// Wait until the latch is open.
    pub async fn acquire(&self) {
        self.acquire_with(None).await
    }

    /// Wait until the latch is open, running `on_locked` once first if the call has to wait.
    pub async fn acquire_with(&self, on_locked: Option<OnLimited>) {
        let mut rx = self.inner.locked.subscribe();
        if !*rx.borrow_and_update() {
            return;
        }
        if let Some(callback) = on_locked {
            callback();
        }
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|locked| !*locked).await;
    }

    /// Lock now and unlock automatically after `duration`.
    ///
    /// Returns immediately. Locking an already locked latch re-arms the timer. Must be called from
    /// within a tokio runtime.
    pub fn lock(&self, duration: Duration) {
        let mut slot = self.inner.unlock_task.lock().expect("latch timer poisoned");
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.locked.send_replace(true);
        tracing::debug!(seconds = duration.as_secs_f64(), generation, "global latch locked");

        let weak: Weak<LatchInner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = weak.upgrade() {
                if inner.open_if_current(generation) {
                    tracing::debug!("global latch released by timer");
                }
            }
        }));
    }

    /// Open the latch and release every waiter. No-op when already open.
    pub fn unlock(&self) {
        if let Some(task) = self.inner.unlock_task.lock().expect("latch timer poisoned").take() {
            task.abort();
        }
        self.inner.open();
    }
}
