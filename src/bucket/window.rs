use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use super::{BucketError, OnLimited};
use crate::clock::Clock;

/// Lower bound on a self-wake so a deadline that already passed cannot spin the waiter.
const MIN_WAKE: Duration = Duration::from_millis(1);

struct Waiter {
    amount: u32,
    tx: oneshot::Sender<Result<(), BucketError>>,
}

pub(crate) struct WindowState {
    capacity: u32,
    remaining: u32,
    window_ms: u64,
    reset_at: u64,
    queue: VecDeque<Waiter>,
    closed: bool,
}

impl WindowState {
    /// Restore the window if its deadline passed, then hand slots to queued callers in order.
    fn reassess(&mut self, now: u64) {
        if now >= self.reset_at {
            self.remaining = self.capacity;
            self.reset_at = now.saturating_add(self.window_ms);
            tracing::trace!(capacity = self.capacity, window_ms = self.window_ms, "window reset");
        }
        self.release();
    }

    fn release(&mut self) {
        while let Some(front) = self.queue.front() {
            if front.amount > self.remaining {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else { break };
            self.remaining -= waiter.amount;
            if waiter.tx.send(Ok(())).is_err() {
                // caller gave up while queued
                self.remaining += waiter.amount;
            }
        }
    }
}

/// Window core shared by the fixed and variable buckets.
pub(crate) struct Window {
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("Window")
            .field("capacity", &st.capacity)
            .field("remaining", &st.remaining)
            .field("window_ms", &st.window_ms)
            .field("reset_at", &st.reset_at)
            .field("queued", &st.queue.len())
            .finish()
    }
}

impl Window {
    pub(crate) fn new(
        capacity: u32,
        remaining: u32,
        window: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window_ms = duration_millis(window);
        let reset_at = clock.now_millis().saturating_add(window_ms);
        Self {
            clock,
            state: Mutex::new(WindowState {
                capacity,
                remaining: remaining.min(capacity),
                window_ms,
                reset_at,
                queue: VecDeque::new(),
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().expect("bucket state poisoned")
    }

    pub(crate) async fn acquire(
        &self,
        amount: u32,
        on_limited: Option<OnLimited>,
    ) -> Result<(), BucketError> {
        let rx = {
            let mut st = self.lock();
            if st.closed {
                return Err(BucketError::Closed);
            }
            if amount > st.capacity {
                return Err(BucketError::InvalidAcquisition {
                    requested: amount,
                    capacity: st.capacity,
                });
            }
            st.reassess(self.clock.now_millis());
            if st.queue.is_empty() && st.remaining >= amount {
                st.remaining -= amount;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            st.queue.push_back(Waiter { amount, tx });
            rx
        };

        if let Some(callback) = on_limited {
            callback();
        }

        let mut rx = rx;
        loop {
            let wake_in = self.time_until_reset().max(MIN_WAKE);
            match tokio::time::timeout(wake_in, &mut rx).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(_)) => return Err(BucketError::Closed),
                Err(_) => self.reassess(),
            }
        }
    }

    pub(crate) fn reassess(&self) {
        let now = self.clock.now_millis();
        self.lock().reassess(now);
    }

    /// Replace the window parameters. Waiters are only woken when `remaining` grew.
    pub(crate) fn update(&self, capacity: u32, remaining: u32, window: Duration) {
        let now = self.clock.now_millis();
        let mut st = self.lock();
        let previous = st.remaining;
        st.capacity = capacity;
        st.window_ms = duration_millis(window);
        st.reset_at = now.saturating_add(st.window_ms);
        st.remaining = remaining.min(capacity);
        if st.remaining > previous {
            st.reassess(now);
        }
    }

    pub(crate) fn close(&self) -> usize {
        let mut st = self.lock();
        st.closed = true;
        let pending = st.queue.len();
        for waiter in st.queue.drain(..) {
            let _ = waiter.tx.send(Err(BucketError::Closed));
        }
        pending
    }

    pub(crate) fn time_until_reset(&self) -> Duration {
        let now = self.clock.now_millis();
        Duration::from_millis(self.lock().reset_at.saturating_sub(now))
    }

    /// No queued callers and the window ended at least `expire_after` ago.
    pub(crate) fn is_stale(&self, expire_after: Duration) -> bool {
        let now = self.clock.now_millis();
        let st = self.lock();
        st.queue.is_empty() && now >= st.reset_at.saturating_add(duration_millis(expire_after))
    }

    pub(crate) fn remaining(&self) -> u32 {
        self.lock().remaining
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.lock().capacity
    }

    pub(crate) fn window(&self) -> Duration {
        Duration::from_millis(self.lock().window_ms)
    }

    pub(crate) fn pending(&self) -> usize {
        self.lock().queue.len()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
