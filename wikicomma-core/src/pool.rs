//! # Worker pool / promise queue
//!
//! A bounded-parallelism runner over a list of zero-argument async jobs
//! (spec §4.4). [`JobQueue::pop`] treats the backing list as a stack so the
//! most recently pushed job runs first — matching the "pops the last task"
//! wording — which keeps newly discovered revisions from queueing behind an
//! entire page's backlog. `WorkerPool::run` starts `min(n, max_jobs)`
//! workers and returns once every worker observes an empty queue.
//!
//! Cancellation is cooperative: a worker only checks the queue between
//! jobs, never while one is in flight (spec §5). The pool takes no global
//! state — it is constructed fresh per site engine, per the redesign flag
//! against a worker-config singleton (spec §9).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

type BoxJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A shared, mutable list of pending jobs.
#[derive(Default)]
pub struct JobQueue {
    jobs: Mutex<VecDeque<BoxJob>>,
}

impl JobQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue a job. Any `Future` works, not just boxed ones.
    pub fn push(&self, job: impl Future<Output = ()> + Send + 'static) {
        self.jobs.lock().push_back(Box::pin(job));
    }

    fn pop(&self) -> Option<BoxJob> {
        self.jobs.lock().pop_back()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

/// Bounded-parallelism runner over a [`JobQueue`].
pub struct WorkerPool {
    /// Sleep observed by each worker between jobs (spec §6 `delay_ms`).
    delay: Duration,
    /// Absolute cap on concurrent workers; `None` disables the cap (spec
    /// §6 `maximum_jobs`).
    max_jobs: Option<usize>,
}

impl WorkerPool {
    pub fn new(delay: Duration, max_jobs: Option<usize>) -> Self {
        Self { delay, max_jobs }
    }

    /// Run up to `min(n, max_jobs)` workers against `queue` until it is
    /// drained. Jobs pushed onto `queue` by other in-flight jobs (e.g. a
    /// page scan enqueuing its own revision fetches) are picked up by any
    /// worker that next finds the queue non-empty.
    pub async fn run(&self, queue: Arc<JobQueue>, n: usize) {
        let worker_count = match self.max_jobs {
            Some(cap) => n.min(cap).max(1),
            None => n.max(1),
        };

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let queue = Arc::clone(&queue);
            let delay = self.delay;
            handles.push(tokio::spawn(async move {
                loop {
                    let job = queue.pop();
                    match job {
                        Some(job) => {
                            job.await;
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        None => break,
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn run_drains_all_jobs() {
        let queue = JobQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            queue.push(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let pool = WorkerPool::new(Duration::from_millis(0), None);
        pool.run(Arc::clone(&queue), 4).await;

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn run_caps_worker_count_at_max_jobs() {
        let queue = JobQueue::new();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            queue.push(async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let pool = WorkerPool::new(Duration::from_millis(0), Some(2));
        pool.run(queue, 8).await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn jobs_pushed_mid_run_are_picked_up() {
        let queue = JobQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = Arc::clone(&queue);
        let inner_counter = Arc::clone(&counter);
        queue.push(async move {
            inner_counter.fetch_add(1, Ordering::SeqCst);
            let counter2 = Arc::clone(&inner_counter);
            inner_queue.push(async move {
                counter2.fetch_add(1, Ordering::SeqCst);
            });
        });

        let pool = WorkerPool::new(Duration::from_millis(0), None);
        pool.run(Arc::clone(&queue), 1).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
