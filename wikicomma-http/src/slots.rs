//! # Connection slots
//!
//! A fixed pool of `N` connection slots, each carrying a monotonically
//! increasing lock token and a last-activity timestamp. [`SlotPool::acquire`]
//! returns the first idle slot or suspends the caller on a FIFO waiter
//! queue, mirroring [`crate::ratelimit::RateLimiter`]'s waiter discipline.
//!
//! A 1 Hz watchdog per acquired slot forces the slot back to idle if no
//! heartbeat was recorded for 10 seconds, bumping the slot's `lockups`
//! counter — a backstop behind the transport's own read/total timeouts
//! (spec §9 redesign flag: prefer transport timeouts, keep the watchdog as
//! a backstop only).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

struct Slot {
    id: usize,
    lock_token: AtomicU64,
    last_activity: Mutex<Instant>,
    lockups: AtomicUsize,
    /// signalled by the watchdog when it force-unlocks this slot
    forced: Notify,
}

struct PoolInner {
    idle: Vec<bool>,
    waiters: VecDeque<oneshot::Sender<usize>>,
}

/// Fixed-size pool of connection slots shared by one site's HTTP client.
pub struct SlotPool {
    slots: Vec<Arc<Slot>>,
    inner: Mutex<PoolInner>,
}

impl SlotPool {
    pub fn new(n: usize) -> Arc<Self> {
        let slots: Vec<Arc<Slot>> = (0..n)
            .map(|id| {
                Arc::new(Slot {
                    id,
                    lock_token: AtomicU64::new(0),
                    last_activity: Mutex::new(Instant::now()),
                    lockups: AtomicUsize::new(0),
                    forced: Notify::new(),
                })
            })
            .collect();

        Arc::new(Self {
            slots,
            inner: Mutex::new(PoolInner {
                idle: vec![true; n],
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Acquire the first idle slot, or suspend on the FIFO waiter queue.
    /// Spawns that slot's watchdog for the lifetime of the returned guard.
    pub async fn acquire(self: &Arc<Self>) -> SlotGuard {
        let id = {
            let mut inner = self.inner.lock();
            if let Some(id) = inner.idle.iter().position(|&idle| idle) {
                inner.idle[id] = false;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Some(rx)
            }
        };

        let id = match id {
            Some(rx) => rx.await.expect("slot pool dropped while waiting"),
            None => {
                // find the id we just claimed above under the same lock
                let inner = self.inner.lock();
                inner.idle.iter().position(|&idle| !idle).unwrap_or(0)
            }
        };

        let slot = Arc::clone(&self.slots[id]);
        slot.lock_token.fetch_add(1, Ordering::SeqCst);
        *slot.last_activity.lock() = Instant::now();
        let my_token = slot.lock_token.load(Ordering::SeqCst);

        let watchdog_slot = Arc::clone(&slot);
        let watchdog = tokio::spawn(async move {
            let mut interval = tokio::time::interval(WATCHDOG_TICK);
            loop {
                interval.tick().await;
                if watchdog_slot.lock_token.load(Ordering::SeqCst) != my_token {
                    return; // slot was released/reacquired by someone else
                }
                let idle_for = watchdog_slot.last_activity.lock().elapsed();
                if idle_for > WATCHDOG_TIMEOUT {
                    watchdog_slot.lockups.fetch_add(1, Ordering::SeqCst);
                    watchdog_slot.forced.notify_waiters();
                    return;
                }
            }
        });

        SlotGuard {
            pool: Arc::clone(self),
            slot,
            token: my_token,
            watchdog: Some(watchdog),
        }
    }

    fn release(&self, id: usize) {
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.waiters.pop_front() {
            let _ = waiter.send(id);
            // idle[id] stays false: ownership transfers directly to the waiter
            return;
        }
        inner.idle[id] = true;
    }

    pub fn lockups(&self) -> usize {
        self.slots.iter().map(|s| s.lockups.load(Ordering::SeqCst)).sum()
    }
}

/// RAII handle on an acquired slot. Dropping it (or the watchdog firing)
/// releases the slot back to the pool.
pub struct SlotGuard {
    pool: Arc<SlotPool>,
    slot: Arc<Slot>,
    token: u64,
    watchdog: Option<tokio::task::JoinHandle<()>>,
}

impl SlotGuard {
    /// Record a heartbeat — called on every chunk of a streamed response.
    pub fn heartbeat(&self) {
        *self.slot.last_activity.lock() = Instant::now();
    }

    /// Resolves once the watchdog force-unlocks this slot (10s without a
    /// heartbeat). Callers race this against their request future.
    pub async fn forced_unlock(&self) {
        self.slot.forced.notified().await;
    }

    pub fn id(&self) -> usize {
        self.slot.id
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
        // only release if this guard still owns the lock (not superseded
        // by a watchdog-forced reacquisition)
        if self.slot.lock_token.load(Ordering::SeqCst) == self.token {
            self.pool.release(self.slot.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_returns_distinct_slots_up_to_capacity() {
        let pool = SlotPool::new(2);
        let g1 = pool.acquire().await;
        let g2 = pool.acquire().await;
        assert_ne!(g1.id(), g2.id());
    }

    #[tokio::test]
    async fn release_wakes_a_waiter() {
        let pool = SlotPool::new(1);
        let g1 = pool.acquire().await;
        let pool2 = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let _g = pool2.acquire().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(g1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .unwrap();
    }
}
