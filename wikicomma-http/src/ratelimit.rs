//! # Rate-limit bucket
//!
//! A token bucket with configurable capacity and refill period. Suspenders
//! call [`RateLimiter::acquire`] and wait until a token is available; the
//! call never fails. A background task refills one token every
//! `period / capacity`, capped at `capacity`.
//!
//! ## Design
//!
//! Waiters form a FIFO queue of one-shot channels. When the refill task has
//! a token and a waiter is queued, the token is handed directly to the
//! waiter instead of being stored — no token is ever created and then lost
//! to a timing race.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Inner {
    capacity: u32,
    tokens: u32,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// A token bucket rate limiter shared across a site's HTTP client.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    refill_period: Duration,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Construct a bucket with capacity `C` actions per `period` seconds,
    /// starting full.
    pub fn new(capacity: u32, period: Duration) -> Arc<Self> {
        let per_token = if capacity == 0 {
            period
        } else {
            period / capacity.max(1)
        };

        Arc::new(Self {
            inner: Mutex::new(Inner {
                capacity,
                tokens: capacity,
                waiters: VecDeque::new(),
            }),
            refill_period: per_token,
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// An unlimited bucket — `acquire()` returns immediately. Used when the
    /// site configuration omits `ratelimit`.
    pub fn unlimited() -> Arc<Self> {
        Self::new(u32::MAX, Duration::from_millis(1))
    }

    /// Start the background refill task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.refill_period);
            interval.tick().await; // first tick fires immediately, skip it
            loop {
                interval.tick().await;
                this.refill_one();
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Stop the background refill task.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    fn refill_one(&self) {
        let mut inner = self.inner.lock();
        if let Some(waiter) = inner.waiters.pop_front() {
            // hand the token straight to the oldest waiter, never store it
            let _ = waiter.send(());
            return;
        }
        if inner.tokens < inner.capacity {
            inner.tokens += 1;
        }
    }

    /// Wait for one token to become available, consuming it. Never fails.
    pub async fn acquire(&self) {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.tokens > 0 {
                inner.tokens -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let _ = rx.await;
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn acquire_never_blocks_when_tokens_available() {
        let bucket = RateLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let bucket = RateLimiter::new(1, Duration::from_millis(100));
        bucket.start();
        bucket.acquire().await; // drains the initial token
        let start = Instant::now();
        bucket.acquire().await; // must wait ~100ms for a refill
        assert!(start.elapsed() >= Duration::from_millis(80));
        bucket.stop();
    }

    #[tokio::test]
    async fn fifo_waiters_each_get_one_token() {
        let bucket = RateLimiter::new(0, Duration::from_millis(20));
        bucket.start();
        let b1 = Arc::clone(&bucket);
        let b2 = Arc::clone(&bucket);
        let t1 = tokio::spawn(async move { b1.acquire().await });
        let t2 = tokio::spawn(async move { b2.acquire().await });
        tokio::time::timeout(Duration::from_secs(2), async {
            t1.await.unwrap();
            t2.await.unwrap();
        })
        .await
        .expect("both waiters should eventually be released");
        bucket.stop();
    }
}
