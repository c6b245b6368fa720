use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::tree;
use crate::{ChildQuery, Snapshot, Watch, WatchGuard};

/// Live listeners of one store. Backends call [`WatcherRegistry::notify`]
/// while still holding their own write lock, so every listener sees
/// snapshots in write order.
#[derive(Clone, Default)]
pub struct WatcherRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    watchers: Mutex<HashMap<u64, Watcher>>,
}

struct Watcher {
    path: Vec<String>,
    query: Option<ChildQuery>,
    tx: mpsc::UnboundedSender<Snapshot>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<u64, Watcher>> {
        self.inner
            .watchers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener and queue its first snapshot.
    pub fn register(&self, path: Vec<String>, query: Option<ChildQuery>, initial: Snapshot) -> Watch {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(initial);

        trace!(id, path = %tree::join(&path), "watch registered");
        self.watchers().insert(id, Watcher { path, query, tx });

        let registry = self.clone();
        Watch::new(
            rx,
            WatchGuard::new(move || {
                if registry.watchers().remove(&id).is_some() {
                    trace!(id, "watch released");
                }
            }),
        )
    }

    /// Push a fresh snapshot to every listener whose path overlaps `changed`.
    /// `snapshot_at` reads the backend's current state.
    pub fn notify<F>(&self, changed: &[String], mut snapshot_at: F)
    where
        F: FnMut(&[String], Option<&ChildQuery>) -> Snapshot,
    {
        let watchers = self.watchers();
        for watcher in watchers.values() {
            if tree::overlaps(&watcher.path, changed) {
                let snap = snapshot_at(&watcher.path, watcher.query.as_ref());
                let _ = watcher.tx.send(snap);
            }
        }
    }

    /// Drop every listener's sender. Their watches end as if the
    /// connection had been reset.
    pub fn disconnect_all(&self) {
        let dropped = {
            let mut watchers = self.watchers();
            let n = watchers.len();
            watchers.clear();
            n
        };
        debug!("Disconnected {} watchers", dropped);
    }

    pub fn len(&self) -> usize {
        self.watchers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
