//! Registry of handlers run when the process is asked to stop

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Future returned by a termination handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type Handler = Box<dyn FnOnce() -> HandlerFuture + Send>;

/// Identifies a registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Handlers to run on external termination
///
/// Every registered handler runs at most once: either through
/// [`SignalRegistry::fire_all`] or never, if it was unregistered first.
#[derive(Default)]
pub struct SignalRegistry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(HandlerId, Handler)>>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler
    pub fn register<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let boxed: Handler = Box::new(move || Box::pin(handler()) as HandlerFuture);
        self.lock().push((id, boxed));
        debug!("Registered termination handler {:?}", id);
        id
    }

    /// Remove a handler; returns false if it already ran or was removed
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.lock();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        before != handlers.len()
    }

    /// Number of pending handlers
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending handler once, in registration order
    ///
    /// Returns the number of handlers that ran.
    pub async fn fire_all(&self) -> usize {
        let handlers: Vec<_> = std::mem::take(&mut *self.lock());
        let count = handlers.len();

        for (id, handler) in handlers {
            debug!("Running termination handler {:?}", id);
            handler().await;
        }

        count
    }

    /// Wait for an interrupt or terminate request, then run all handlers
    pub async fn listen(&self) -> std::io::Result<usize> {
        Termination::new()?.recv().await?;
        info!("Termination requested, finalizing {} pending experiment(s)", self.len());
        Ok(self.fire_all().await)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(HandlerId, Handler)>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Signal registry lock was poisoned");
                poisoned.into_inner()
            }
        }
    }
}

/// Listener for Ctrl-C and SIGTERM
///
/// Only sees requests made after it was created.
pub struct Termination {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Termination {
    #[cfg(unix)]
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next request
    #[cfg(unix)]
    pub async fn recv(&mut self) -> std::io::Result<()> {
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = self.terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await
    }
}
