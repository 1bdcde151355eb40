//! Fixed-size worker pool scheduler

use crate::execution::scheduler::{Cancellation, Disposable, Scheduler, SchedulerError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

struct PoolInner {
    permits: Arc<Semaphore>,
    workers: usize,
    active: AtomicUsize,
}

/// Marks one worker busy for as long as it lives
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn new(active: &'a AtomicUsize) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self(active)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scheduler backed by a fixed pool of `N` workers
///
/// At most `N` work items run at the same time on the multi-threaded tokio
/// runtime; the rest wait for a free worker. Clones share the same pool.
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct ProcessPoolScheduler {
    inner: Arc<PoolInner>,
}

impl ProcessPoolScheduler {
    /// Create a pool with `workers` workers
    pub fn new(workers: usize) -> Result<Self, SchedulerError> {
        if workers == 0 {
            return Err(SchedulerError::InvalidPoolSize(workers));
        }

        debug!("Creating worker pool with {} workers", workers);
        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(workers)),
                workers,
                active: AtomicUsize::new(0),
            }),
        })
    }

    /// Pool size
    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Number of workers currently running a work item
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Submit a work item that starts after `delay` once a worker is free
    fn submit<W, Fut>(&self, delay: Duration, work: W) -> Disposable
    where
        W: FnOnce(Cancellation) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancellation = Cancellation::new();
        let token = cancellation.clone();
        let inner = Arc::clone(&self.inner);

        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if token.is_cancelled() {
                trace!("Work item disposed before it was queued");
                return;
            }

            let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
                return;
            };
            if token.is_cancelled() {
                trace!("Work item disposed before it started");
                return;
            }

            let _active = ActiveGuard::new(&inner.active);
            work(token).await;
        });

        Disposable::new(cancellation, handle)
    }
}

impl Scheduler for ProcessPoolScheduler {
    fn schedule<S, W, Fut>(&self, state: S, work: W) -> Disposable
    where
        S: Send + 'static,
        W: FnOnce(Self, Cancellation, S) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.schedule_relative(Duration::ZERO, state, work)
    }

    fn schedule_relative<S, W, Fut>(&self, delay: Duration, state: S, work: W) -> Disposable
    where
        S: Send + 'static,
        W: FnOnce(Self, Cancellation, S) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = self.clone();
        self.submit(delay, move |token| work(scheduler, token, state))
    }

    /// The loop occupies one worker until it is disposed.
    fn schedule_periodic<S, F>(&self, period: Duration, state: S, mut action: F) -> Disposable
    where
        S: Send + 'static,
        F: FnMut(&S) -> Option<S> + Send + 'static,
    {
        self.submit(Duration::ZERO, move |token| async move {
            let mut state = state;
            loop {
                tokio::time::sleep(period).await;
                if token.is_cancelled() {
                    return;
                }
                if let Some(next) = action(&state) {
                    state = next;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            ProcessPoolScheduler::new(0),
            Err(SchedulerError::InvalidPoolSize(0))
        ));
    }

    #[tokio::test]
    async fn test_schedule_runs_work_with_state() {
        let pool = ProcessPoolScheduler::new(2).unwrap();
        let (tx, rx) = oneshot::channel();

        let handle = pool.schedule(21, move |scheduler, _token, state: i32| async move {
            let _ = tx.send((scheduler.workers(), state * 2));
        });

        handle.join().await.unwrap();
        assert_eq!(rx.await.unwrap(), (2, 42));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_bounds_concurrency() {
        let pool = ProcessPoolScheduler::new(2).unwrap();
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let peak = Arc::clone(&peak);
                pool.schedule((), move |scheduler, _token, ()| async move {
                    peak.fetch_max(scheduler.active(), Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                })
            })
            .collect();

        for handle in handles {
            handle.join().await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_dispose_before_start_prevents_work() {
        let pool = ProcessPoolScheduler::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = pool.schedule((), move |_, _, ()| async move {
            let _ = release_rx.await;
        });

        let counter = Arc::clone(&ran);
        let queued = pool.schedule((), move |_, _, ()| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        queued.dispose();
        assert!(queued.is_disposed());

        let _ = release_tx.send(());
        blocker.join().await.unwrap();
        queued.join().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_while_running_is_cooperative() {
        let pool = ProcessPoolScheduler::new(1).unwrap();
        let steps = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let counter = Arc::clone(&steps);
        let handle = pool.schedule((), move |_, token, ()| async move {
            let _ = started_tx.send(());
            for _ in 0..100 {
                if token.is_cancelled() {
                    break;
                }
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        started_rx.await.unwrap();
        handle.dispose();
        handle.join().await.unwrap();
        assert!(steps.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn test_panic_is_isolated_to_its_handle() {
        let pool = ProcessPoolScheduler::new(1).unwrap();

        let failing = pool.schedule((), |_, _, ()| async move {
            panic!("boom");
        });
        let (tx, rx) = oneshot::channel();
        let healthy = pool.schedule((), move |_, _, ()| async move {
            let _ = tx.send("still alive");
        });

        match failing.join().await {
            Err(SchedulerError::WorkerPanicked(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected panic, got {other:?}"),
        }
        healthy.join().await.unwrap();
        assert_eq!(rx.await.unwrap(), "still alive");
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_schedule_relative_waits() {
        let pool = ProcessPoolScheduler::new(1).unwrap();
        let start = std::time::Instant::now();
        let handle = pool.schedule_relative(Duration::from_millis(50), (), |_, _, ()| async {});
        handle.join().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_schedule_absolute_in_the_past_runs_immediately() {
        let pool = ProcessPoolScheduler::new(1).unwrap();
        let (tx, rx) = oneshot::channel();
        let at = Utc::now() - chrono::Duration::seconds(10);
        let handle = pool.schedule_absolute(at, 7, move |_, _, state: u8| async move {
            let _ = tx.send(state);
        });
        handle.join().await.unwrap();
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_schedule_periodic_feeds_state_back() {
        let pool = ProcessPoolScheduler::new(1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&seen);
        let handle = pool.schedule_periodic(Duration::from_millis(10), 0u32, move |state| {
            log.lock().unwrap().push(*state);
            // None keeps the previous state
            if *state < 3 {
                Some(state + 1)
            } else {
                None
            }
        });

        while seen.lock().unwrap().len() < 6 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.dispose();
        handle.join().await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(&seen[..6], &[0, 1, 2, 3, 3, 3]);
    }
}
