//! Scheduler abstraction - decides when and where work items run

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Error types for scheduled work
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("pool size must be at least 1, got {0}")]
    InvalidPoolSize(usize),

    /// The work item panicked; other work is unaffected
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("work item was aborted")]
    Aborted,
}

/// Cooperative cancellation flag shared between a work item and its
/// [`Disposable`]
///
/// Work items check it at their own step boundaries; nothing is interrupted
/// mid-step.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Handle returned for every scheduled work item
///
/// Disposing before the work starts prevents it from starting. Disposing
/// while it runs only raises the [`Cancellation`] flag. Dropping the handle
/// detaches the work without cancelling it.
#[derive(Debug)]
pub struct Disposable {
    cancellation: Cancellation,
    handle: JoinHandle<()>,
}

impl Disposable {
    pub fn new(cancellation: Cancellation, handle: JoinHandle<()>) -> Self {
        Self {
            cancellation,
            handle,
        }
    }

    /// Cancel the work item
    pub fn dispose(&self) {
        self.cancellation.cancel();
    }

    /// The flag [`Disposable::dispose`] raises
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Whether [`Disposable::dispose`] was called
    pub fn is_disposed(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether the work item has stopped running
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the work item to stop
    ///
    /// # Errors
    /// Returns `SchedulerError::WorkerPanicked` if the work item panicked.
    pub async fn join(self) -> Result<(), SchedulerError> {
        match self.handle.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_panic() => Err(SchedulerError::WorkerPanicked(panic_message(
                e.into_panic(),
            ))),
            Err(_) => Err(SchedulerError::Aborted),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs work items now, later, at a time point or periodically
///
/// A work item receives a clone of the scheduler, the cancellation flag of
/// its [`Disposable`] and the submitted state.
pub trait Scheduler: Clone + Send + Sync + 'static {
    /// Current time as seen by the scheduler
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// Run `work` as soon as a worker is available
    fn schedule<S, W, Fut>(&self, state: S, work: W) -> Disposable
    where
        S: Send + 'static,
        W: FnOnce(Self, Cancellation, S) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    /// Run `work` once `delay` has elapsed
    fn schedule_relative<S, W, Fut>(&self, delay: Duration, state: S, work: W) -> Disposable
    where
        S: Send + 'static,
        W: FnOnce(Self, Cancellation, S) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static;

    /// Run `work` at `at`; time points in the past run immediately
    fn schedule_absolute<S, W, Fut>(&self, at: DateTime<Utc>, state: S, work: W) -> Disposable
    where
        S: Send + 'static,
        W: FnOnce(Self, Cancellation, S) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = (at - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule_relative(delay, state, work)
    }

    /// Call `action` every `period` until disposed
    ///
    /// A `Some` return value replaces the state passed to the next call.
    fn schedule_periodic<S, F>(&self, period: Duration, state: S, action: F) -> Disposable
    where
        S: Send + 'static,
        F: FnMut(&S) -> Option<S> + Send + 'static;
}
