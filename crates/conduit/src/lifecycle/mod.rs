//! Cooperative cancellation and graceful drain
//!
//! This module provides:
//! - [`LifecycleController`] - owns a cancellation signal and an in-flight counter
//! - [`CancelSignal`] - non-owning, observe-only handle passed to every blocking call
//! - [`InFlight`] - guard that keeps [`LifecycleController::wait`] from returning
//!
//! # Hierarchy
//!
//! ```text
//! root controller (process)
//!   ├── pool controller      cancel(root) ⇒ cancel(pool)
//!   │     └── worker signals cancel(pool) ⇒ cancel(worker)
//!   └── pipeline controller  cancel(pipeline) does not touch root
//! ```
//!
//! Work registered on a child also counts toward every ancestor, so waiting
//! on the root drains the whole tree.
//!
//! # Example
//!
//! ```
//! use conduit::lifecycle::LifecycleController;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let root = LifecycleController::new();
//! let signal = root.signal();
//!
//! root.spawn(async move {
//!     signal.cancelled().await;
//!     // flush, close files, ...
//! });
//!
//! root.cancel();
//! root.wait().await;
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    name: String,
    token: CancellationToken,
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<Callback>>,
    children: Mutex<Vec<Weak<Shared>>>,
    tracker: TaskTracker,
    parent: Option<Arc<Shared>>,
}

impl Shared {
    fn new(name: String, token: CancellationToken, parent: Option<Arc<Shared>>) -> Self {
        Self {
            name,
            token,
            cancelled: AtomicBool::new(false),
            callbacks: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            tracker: TaskTracker::new(),
            parent,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(lifecycle = %self.name, "Cancellation requested");
        self.token.cancel();

        // Callbacks registered after the swap run inline in `on_cancel`
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            callback();
        }

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn on_cancel(&self, callback: Callback) {
        {
            let mut callbacks = self.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push(callback);
                return;
            }
        }
        callback();
    }

    fn child(self: &Arc<Self>, name: String) -> Arc<Shared> {
        let child = Arc::new(Shared::new(
            name,
            self.token.child_token(),
            Some(Arc::clone(self)),
        ));

        let parent_cancelled = {
            let mut children = self.children.lock();
            children.retain(|c| c.strong_count() > 0);
            if self.is_cancelled() {
                true
            } else {
                children.push(Arc::downgrade(&child));
                false
            }
        };

        if parent_cancelled {
            child.cancel();
        }
        child
    }

    fn register(&self) -> InFlight {
        let mut tokens = vec![self.tracker.token()];
        let mut ancestor = self.parent.as_ref();
        while let Some(shared) = ancestor {
            tokens.push(shared.tracker.token());
            ancestor = shared.parent.as_ref();
        }
        InFlight { _tokens: tokens }
    }
}

/// Guard for one in-flight operation
///
/// While it is alive, `wait()` on the owning controller and all of its
/// ancestors keeps blocking.
#[must_use = "dropping the guard immediately marks the operation complete"]
pub struct InFlight {
    _tokens: Vec<TaskTrackerToken>,
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("depth", &self._tokens.len())
            .finish()
    }
}

/// Owner of a cancellation signal and its in-flight work
///
/// Cancellation is idempotent and irreversible. Dropping the controller
/// cancels it, so work started under a component never outlives the
/// component's owner by accident.
pub struct LifecycleController {
    shared: Arc<Shared>,
}

impl LifecycleController {
    /// Create a root controller
    pub fn new() -> Self {
        Self::named("root")
    }

    /// Create a root controller with a name used in log output
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared::new(name.into(), CancellationToken::new(), None)),
        }
    }

    /// Create a controller that is cancelled whenever `parent` is
    ///
    /// Cancelling the child never affects the parent.
    pub fn child_of(parent: &CancelSignal, name: impl Into<String>) -> Self {
        Self {
            shared: parent.shared.child(name.into()),
        }
    }

    /// Create a child of this controller
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            shared: self.shared.child(name.into()),
        }
    }

    /// Name used in log output
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Request cancellation (idempotent)
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Observe-only handle for descendants
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register an in-flight operation
    pub fn register(&self) -> InFlight {
        self.shared.register()
    }

    /// Spawn a task that counts as in-flight until it completes
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.signal().spawn(future)
    }

    /// Number of registered in-flight operations
    pub fn in_flight(&self) -> usize {
        self.shared.tracker.len()
    }

    /// Wait until every registered operation has completed
    ///
    /// Does not cancel anything by itself; pair with [`cancel`](Self::cancel)
    /// or use [`shutdown`](Self::shutdown).
    pub async fn wait(&self) {
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Wait with an upper bound; returns `false` if work was still in flight
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Cancel, then drain for at most `timeout`
    ///
    /// Returns `false` if in-flight work had to be abandoned.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel();
        let drained = self.wait_timeout(timeout).await;
        if !drained {
            warn!(
                lifecycle = %self.shared.name,
                remaining = self.in_flight(),
                "Drain timed out, abandoning in-flight work"
            );
        }
        drained
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("name", &self.shared.name)
            .field("cancelled", &self.is_cancelled())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Non-owning view of a controller's cancellation state
///
/// Every blocking point in the runtime selects between its normal wake-up
/// condition and [`cancelled`](Self::cancelled).
#[derive(Clone)]
pub struct CancelSignal {
    shared: Arc<Shared>,
}

impl CancelSignal {
    /// A signal that is never cancelled
    ///
    /// Useful for callers that do not participate in a lifecycle.
    pub fn never() -> Self {
        Self {
            shared: Arc::new(Shared::new(
                "detached".to_string(),
                CancellationToken::new(),
                None,
            )),
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        self.shared.token.cancelled().await
    }

    /// Run `callback` on cancellation, or right away if already cancelled
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.on_cancel(Box::new(callback));
    }

    /// Register an in-flight operation on the owning controller
    pub fn register(&self) -> InFlight {
        self.shared.register()
    }

    /// Spawn a task that counts as in-flight until it completes
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.register();
        tokio::spawn(async move {
            let _guard = guard;
            future.await
        })
    }

    /// A token for foreign code that follows this signal
    ///
    /// Cancelling the returned token does not cancel this signal.
    pub fn token(&self) -> CancellationToken {
        self.shared.token.child_token()
    }

    /// Name of the owning controller
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl std::fmt::Debug for CancelSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelSignal")
            .field("name", &self.shared.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
