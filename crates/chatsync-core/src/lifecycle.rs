//! Ownership of live subscriptions.
//!
//! Every listener a component attaches is wrapped in a [`Subscription`]
//! that the caller owns. Release is explicit (`unsubscribe`), idempotent,
//! and also happens on drop, so error paths and abandoned handles never
//! leave a listener registered with the store. [`LifecycleScope`] groups the
//! subscriptions of one consumer (a screen, a signed-in user) so they can be
//! torn down together on navigation or logout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use chatsync_store::{ChildQuery, Snapshot, StoreClient, WatchGuard};

use crate::error::{SyncError, SyncResult};
use crate::observer::{SyncEvent, SyncObserver};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a subscription's handler is fed, in store delivery order.
pub(crate) enum WatchEvent {
    Snapshot(Snapshot),
    /// The store dropped the listener and it could not be attached again.
    Failed(SyncError),
}

struct Control {
    label: String,
    closed: AtomicBool,
    guard: Mutex<Option<WatchGuard>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl Control {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns false if already released.
    fn release(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Dropping the guard unregisters the store listener right away;
        // aborting the driver only takes effect at its next await.
        drop(lock(&self.guard).take());
        if let Some(handle) = lock(&self.abort).take() {
            handle.abort();
        }
        debug!(subscription = %self.label, "subscription released");
        true
    }
}

/// Shared view of a subscription's state for the code that emits on it.
#[derive(Clone)]
pub(crate) struct Liveness(Arc<Control>);

impl Liveness {
    pub fn is_live(&self) -> bool {
        !self.0.is_closed()
    }

    pub fn release(&self) {
        self.0.release();
    }
}

/// Handle to one live listener.
pub struct Subscription {
    control: Arc<Control>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("label", &self.control.label)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    /// Subscribe at `path` and spawn the task that feeds `handler`.
    ///
    /// The first attach is awaited so its failure reaches the caller. If the
    /// store later drops the listener the driver attaches again at the same
    /// path; if that fails the handler gets [`WatchEvent::Failed`] and the
    /// subscription ends.
    pub(crate) async fn attach<M, H>(
        store: Arc<dyn StoreClient>,
        path: String,
        query: Option<ChildQuery>,
        label: String,
        observer: Arc<dyn SyncObserver>,
        make_handler: M,
    ) -> SyncResult<Self>
    where
        M: FnOnce(Liveness) -> H,
        H: FnMut(WatchEvent) + Send + 'static,
    {
        let watch = store.subscribe(&path, query.clone()).await?;
        let (rx, guard) = watch.into_parts();

        let control = Arc::new(Control {
            label,
            closed: AtomicBool::new(false),
            guard: Mutex::new(Some(guard)),
            abort: Mutex::new(None),
        });

        let handler = make_handler(Liveness(control.clone()));
        let task = tokio::spawn(drive(store, path, query, rx, control.clone(), observer, handler));
        *lock(&control.abort) = Some(task.abort_handle());

        debug!(subscription = %control.label, "subscription attached");
        Ok(Self { control })
    }

    /// Release the listener. Safe to call more than once.
    pub fn unsubscribe(&self) {
        self.control.release();
    }

    pub fn is_active(&self) -> bool {
        !self.control.is_closed()
    }

    pub fn label(&self) -> &str {
        &self.control.label
    }

    pub(crate) fn liveness(&self) -> Liveness {
        Liveness(self.control.clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.control.release();
    }
}

async fn drive<H>(
    store: Arc<dyn StoreClient>,
    path: String,
    query: Option<ChildQuery>,
    mut rx: mpsc::UnboundedReceiver<Snapshot>,
    control: Arc<Control>,
    observer: Arc<dyn SyncObserver>,
    mut handler: H,
) where
    H: FnMut(WatchEvent) + Send + 'static,
{
    loop {
        while let Some(snapshot) = rx.recv().await {
            if control.is_closed() {
                return;
            }
            handler(WatchEvent::Snapshot(snapshot));
        }

        if control.is_closed() {
            return;
        }

        match store.subscribe(&path, query.clone()).await {
            Ok(watch) => {
                let (next_rx, guard) = watch.into_parts();
                {
                    let mut slot = lock(&control.guard);
                    if control.is_closed() {
                        return;
                    }
                    *slot = Some(guard);
                }
                rx = next_rx;
                observer.observe(SyncEvent::Reattached { path: path.clone() });
            }
            Err(e) => {
                warn!(subscription = %control.label, "Re-attach at {} failed: {}", path, e);
                handler(WatchEvent::Failed(e.into()));
                control.release();
                return;
            }
        }
    }
}

/// Owns the subscriptions of one consumer and releases them together.
pub struct LifecycleScope {
    name: String,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl LifecycleScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, subscription: Subscription) {
        lock(&self.subscriptions).push(subscription);
    }

    /// Release everything attached so far. Returns how many subscriptions
    /// were still active.
    pub fn teardown(&self) -> usize {
        let subscriptions = std::mem::take(&mut *lock(&self.subscriptions));
        let active = subscriptions.iter().filter(|s| s.is_active()).count();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        if !subscriptions.is_empty() {
            debug!(scope = %self.name, active, "scope torn down");
        }
        active
    }

    pub fn active_count(&self) -> usize {
        lock(&self.subscriptions)
            .iter()
            .filter(|s| s.is_active())
            .count()
    }
}

impl Drop for LifecycleScope {
    fn drop(&mut self) {
        self.teardown();
    }
}
