//! Worker pools for handler execution
//!
//! Events moved off the I/O task by a dispatcher run on a [`WorkerPool`].
//! Four growth policies exist; `eager` is the one with the distinctive
//! invariant: while `active < max` it starts a new worker instead of
//! queueing, and only queues once every worker slot is taken.

use mizzen_core::constants::{
    CORE_THREADS_KEY, DEFAULT_CORE_THREADS, DEFAULT_QUEUES, DEFAULT_THREADS, QUEUES_KEY,
    THREADPOOL_KEY, THREADS_KEY,
};
use mizzen_core::{Error, Result, Url};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool growth policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadPoolKind {
    /// A fixed number of workers; overflow queues, then rejects
    Fixed,
    /// Unbounded workers, nothing ever queues
    Cached,
    /// Workers grow up to the limit and never shrink below demand
    Limited,
    /// Grow to max before queueing while `active < max`
    Eager,
}

impl ThreadPoolKind {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "fixed" => Ok(ThreadPoolKind::Fixed),
            "cached" => Ok(ThreadPoolKind::Cached),
            "limited" => Ok(ThreadPoolKind::Limited),
            "eager" => Ok(ThreadPoolKind::Eager),
            other => Err(Error::Extension(format!(
                "no extension named '{}' for ThreadPool",
                other
            ))),
        }
    }
}

struct PoolState {
    active: AtomicUsize,
    queue: Mutex<VecDeque<Job>>,
}

/// Bounded executor backed by tokio tasks
pub struct WorkerPool {
    kind: ThreadPoolKind,
    core: usize,
    max: usize,
    queue_capacity: usize,
    state: Arc<PoolState>,
}

impl WorkerPool {
    pub fn new(kind: ThreadPoolKind, core: usize, max: usize, queue_capacity: usize) -> Self {
        Self {
            kind,
            core: core.min(max),
            max,
            queue_capacity,
            state: Arc::new(PoolState {
                active: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Build a pool from the endpoint URL's `threadpool`, `threads`,
    /// `corethreads` and `queues` parameters
    pub fn from_url(url: &Url) -> Result<Self> {
        let kind = ThreadPoolKind::from_name(url.param_or(THREADPOOL_KEY, "fixed"))?;
        let threads = url.param_usize(THREADS_KEY, DEFAULT_THREADS);
        let queues = url.param_usize(QUEUES_KEY, DEFAULT_QUEUES);
        let pool = match kind {
            ThreadPoolKind::Fixed => Self::new(kind, threads, threads, queues),
            ThreadPoolKind::Cached => Self::new(kind, 0, usize::MAX, 0),
            ThreadPoolKind::Limited => Self::new(kind, threads, threads, queues),
            ThreadPoolKind::Eager => {
                let core = url.param_usize(CORE_THREADS_KEY, DEFAULT_CORE_THREADS);
                Self::new(kind, core, threads, queues)
            }
        };
        Ok(pool)
    }

    pub fn kind(&self) -> ThreadPoolKind {
        self.kind
    }

    /// Workers currently running or draining the queue
    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.state.queue.lock().len()
    }

    fn try_claim(&self, limit: usize) -> bool {
        self.state
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |a| {
                if a < limit {
                    Some(a + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn spawn_worker(&self, initial: Option<Job>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            if let Some(job) = initial {
                job.await;
            }
            loop {
                // retire only after confirming the queue is empty under the
                // lock, so enqueuers cannot race a disappearing worker
                let job = {
                    let mut queue = state.queue.lock();
                    match queue.pop_front() {
                        Some(job) => job,
                        None => {
                            state.active.fetch_sub(1, Ordering::SeqCst);
                            return;
                        }
                    }
                };
                job.await;
            }
        });
    }

    /// Run `task` on the pool; rejected with `LimitExceeded` when every
    /// worker is busy and the queue is full
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let job: Job = Box::pin(task);

        if self.kind == ThreadPoolKind::Cached {
            self.state.active.fetch_add(1, Ordering::SeqCst);
            self.spawn_worker(Some(job));
            return Ok(());
        }

        if self.try_claim(self.core) {
            self.spawn_worker(Some(job));
            return Ok(());
        }
        // eager grows to max before it queues
        if self.kind == ThreadPoolKind::Eager && self.try_claim(self.max) {
            self.spawn_worker(Some(job));
            return Ok(());
        }

        {
            let mut queue = self.state.queue.lock();
            if queue.len() < self.queue_capacity {
                queue.push_back(job);
                trace!("queued job, depth {}", queue.len());
                drop(queue);
                // a worker may have retired between the claim attempt and
                // the push; make sure someone drains the queue
                if self.try_claim(self.max) {
                    self.spawn_worker(None);
                }
                return Ok(());
            }
        }

        if self.try_claim(self.max) {
            self.spawn_worker(Some(job));
            return Ok(());
        }

        Err(Error::LimitExceeded(format!(
            "worker pool exhausted: {} active, {} queued",
            self.active(),
            self.queued()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn cached_pool_never_rejects() {
        let pool = WorkerPool::new(ThreadPoolKind::Cached, 0, usize::MAX, 0);
        let (tx, rx) = oneshot::channel();
        pool.execute(async move {
            tx.send(()).ok();
        })
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fixed_pool_rejects_when_full_without_queue() {
        let pool = WorkerPool::new(ThreadPoolKind::Fixed, 1, 1, 0);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.execute(async move {
            release_rx.await.ok();
        })
        .unwrap();

        // wait for the worker to pick the job up
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.active(), 1);

        let rejected = pool.execute(async {});
        assert!(matches!(rejected, Err(Error::LimitExceeded(_))));

        release_tx.send(()).ok();
    }

    #[tokio::test]
    async fn fixed_pool_drains_queue() {
        let pool = WorkerPool::new(ThreadPoolKind::Fixed, 1, 1, 8);
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..5 {
            let done_tx = done_tx.clone();
            pool.execute(async move {
                done_tx.send(i).ok();
            })
            .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn eager_pool_grows_before_queueing() {
        let pool = WorkerPool::new(ThreadPoolKind::Eager, 1, 4, 16);
        let mut releases = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel::<()>();
            releases.push(tx);
            pool.execute(async move {
                rx.await.ok();
            })
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        // all four submissions got their own worker even though core is 1
        assert_eq!(pool.active(), 4);
        assert_eq!(pool.queued(), 0);

        // the fifth has no free slot left and must queue
        let (tx, rx) = oneshot::channel::<()>();
        releases.push(tx);
        pool.execute(async move {
            rx.await.ok();
        })
        .unwrap();
        assert_eq!(pool.queued(), 1);

        for tx in releases {
            tx.send(()).ok();
        }
    }

    #[test]
    fn kind_parsing() {
        assert_eq!(ThreadPoolKind::from_name("eager").unwrap(), ThreadPoolKind::Eager);
        assert!(ThreadPoolKind::from_name("mystery").is_err());
    }
}
