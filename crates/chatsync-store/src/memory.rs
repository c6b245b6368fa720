use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::tree;
use crate::watchers::WatcherRegistry;
use crate::{BoxFuture, ChildQuery, StoreClient, StoreError, StoreResult, Watch, new_child_key};

/// In-process store. Cheap to clone; clones share the same tree.
///
/// Besides serving as a local cache backend it carries the fault hooks the
/// test suites use to simulate an unreliable remote: failing subtrees,
/// slow reads and dropped listeners.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    tree: Mutex<Value>,
    watchers: WatcherRegistry,
    faults: Mutex<Faults>,
    reads: Mutex<HashMap<String, usize>>,
}

#[derive(Default)]
struct Faults {
    fail_reads: Vec<Vec<String>>,
    fail_writes: Vec<Vec<String>>,
    /// One-shot delays keyed by exact path.
    delays: HashMap<String, Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_data(Value::Object(Default::default()))
    }

    /// Start from an existing tree, e.g. a fixture.
    pub fn with_data(data: Value) -> Self {
        let root = match tree::prune(data) {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Default::default()),
        };

        Self {
            inner: Arc::new(MemoryInner {
                tree: Mutex::new(root),
                watchers: WatcherRegistry::new(),
                faults: Mutex::new(Faults::default()),
                reads: Mutex::new(HashMap::new()),
            }),
        }
    }

    // -- Fault hooks --

    /// Every read, query and subscribe at or under `prefix` fails.
    pub fn fail_reads_under(&self, prefix: &str) {
        if let Ok(segs) = tree::parse_path(prefix) {
            lock(&self.inner.faults).fail_reads.push(segs);
        }
    }

    /// Every write at or under `prefix` fails.
    pub fn fail_writes_under(&self, prefix: &str) {
        if let Ok(segs) = tree::parse_path(prefix) {
            lock(&self.inner.faults).fail_writes.push(segs);
        }
    }

    /// The next read or query of exactly `path` sleeps for `delay` before
    /// answering.
    pub fn delay_next_read(&self, path: &str, delay: Duration) {
        if let Ok(segs) = tree::parse_path(path) {
            lock(&self.inner.faults).delays.insert(tree::join(&segs), delay);
        }
    }

    pub fn clear_faults(&self) {
        *lock(&self.inner.faults) = Faults::default();
    }

    /// Simulate a connection reset: every live watch ends.
    pub fn disconnect_watchers(&self) {
        self.inner.watchers.disconnect_all();
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.len()
    }

    /// Number of point reads issued for exactly `path`.
    pub fn read_count(&self, path: &str) -> usize {
        let key = tree::parse_path(path).map(|s| tree::join(&s)).unwrap_or_default();
        lock(&self.inner.reads).get(&key).copied().unwrap_or(0)
    }

    /// Copy of the whole tree.
    pub fn dump(&self) -> Value {
        lock(&self.inner.tree).clone()
    }

    fn check_read(&self, segs: &[String]) -> StoreResult<()> {
        let faults = lock(&self.inner.faults);
        if faults.fail_reads.iter().any(|p| tree::starts_with(segs, p)) {
            return Err(StoreError::Unavailable(format!("read {} refused", tree::join(segs))));
        }
        Ok(())
    }

    fn check_write(&self, segs: &[String]) -> StoreResult<()> {
        let faults = lock(&self.inner.faults);
        if faults.fail_writes.iter().any(|p| tree::starts_with(segs, p)) {
            return Err(StoreError::Unavailable(format!("write {} refused", tree::join(segs))));
        }
        Ok(())
    }

    fn take_delay(&self, key: &str) -> Option<Duration> {
        lock(&self.inner.faults).delays.remove(key)
    }

    fn put(&self, segs: &[String], value: Value) -> StoreResult<()> {
        self.check_write(segs)?;

        let mut root = lock(&self.inner.tree);
        tree::set(&mut root, segs, value);
        self.inner.watchers.notify(segs, |path, query| {
            tree::snapshot(tree::get(&root, path), query)
        });
        Ok(())
    }
}

impl StoreClient for MemoryStore {
    fn read(&self, path: &str) -> BoxFuture<'_, StoreResult<Option<Value>>> {
        let segs = tree::parse_path(path);
        Box::pin(async move {
            let segs = segs?;
            self.check_read(&segs)?;

            let key = tree::join(&segs);
            if let Some(delay) = self.take_delay(&key) {
                debug!(path = %key, ?delay, "delaying read");
                tokio::time::sleep(delay).await;
            }
            *lock(&self.inner.reads).entry(key).or_default() += 1;

            // Faults may have been installed while we slept.
            self.check_read(&segs)?;
            let root = lock(&self.inner.tree);
            Ok(tree::get(&root, &segs).cloned())
        })
    }

    fn write(&self, path: &str, value: Value) -> BoxFuture<'_, StoreResult<()>> {
        let segs = tree::parse_path(path);
        Box::pin(async move { self.put(&segs?, value) })
    }

    fn append(&self, prefix: &str, value: Value) -> BoxFuture<'_, StoreResult<String>> {
        let segs = tree::parse_path(prefix);
        Box::pin(async move {
            let mut segs = segs?;
            let key = new_child_key();
            segs.push(key.clone());
            self.put(&segs, value)?;
            Ok(key)
        })
    }

    fn query(&self, path: &str, query: &ChildQuery) -> BoxFuture<'_, StoreResult<Vec<(String, Value)>>> {
        let segs = tree::parse_path(path);
        let query = query.clone();
        Box::pin(async move {
            let segs = segs?;
            self.check_read(&segs)?;

            if let Some(delay) = self.take_delay(&tree::join(&segs)) {
                debug!(path = %tree::join(&segs), ?delay, "delaying query");
                tokio::time::sleep(delay).await;
            }

            let root = lock(&self.inner.tree);
            Ok(tree::apply_query(tree::get(&root, &segs), &query))
        })
    }

    fn subscribe(&self, path: &str, query: Option<ChildQuery>) -> BoxFuture<'_, StoreResult<Watch>> {
        let segs = tree::parse_path(path);
        Box::pin(async move {
            let segs = segs?;
            self.check_read(&segs)?;

            // Hold the tree lock so no write slips between the initial
            // snapshot and registration.
            let root = lock(&self.inner.tree);
            let initial = tree::snapshot(tree::get(&root, &segs), query.as_ref());
            Ok(self.inner.watchers.register(segs, query, initial))
        })
    }
}
