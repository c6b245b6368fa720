//! Abstract hierarchical key-value store consumed by the sync core, plus two
//! backends: an in-memory tree (with fault injection for tests) and a
//! SQLite-backed tree.

pub mod memory;
pub mod sqlite;
pub mod tree;
pub mod watchers;

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use watchers::WatcherRegistry;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type StoreResult<T> = Result<T, StoreError>;

/// Value at a watched location; `None` when nothing is stored there.
pub type Snapshot = Option<Value>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid path: '{0}'")]
    InvalidPath(String),
}

/// Child selection for `query` and narrowed subscriptions.
///
/// Children are ordered by the first numeric field found among `order_by`
/// (0 when none is present), then by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildQuery {
    pub order_by: Vec<String>,
    /// Only children strictly before this (order value, key) position.
    pub end_before: Option<(i64, String)>,
    /// Keep only the last `n` children after filtering.
    pub limit_to_last: Option<usize>,
}

impl ChildQuery {
    pub fn ordered_by(fields: &[&str]) -> Self {
        Self {
            order_by: fields.iter().map(|f| f.to_string()).collect(),
            end_before: None,
            limit_to_last: None,
        }
    }

    pub fn end_before(mut self, order: i64, key: &str) -> Self {
        self.end_before = Some((order, key.to_string()));
        self
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit_to_last = Some(n);
        self
    }
}

/// Releases a store listener when dropped.
pub struct WatchGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WatchGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// A live listener. The first snapshot is the value at subscribe time;
/// after that one snapshot per relevant write. Dropping the watch is the
/// unsubscribe.
pub struct Watch {
    rx: mpsc::UnboundedReceiver<Snapshot>,
    _guard: WatchGuard,
}

impl Watch {
    pub fn new(rx: mpsc::UnboundedReceiver<Snapshot>, guard: WatchGuard) -> Self {
        Self { rx, _guard: guard }
    }

    /// Next snapshot, or `None` once the store has dropped this listener.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Separate the snapshot stream from the guard so the two can be owned
    /// by different tasks. The listener stays registered until the guard
    /// is dropped.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<Snapshot>, WatchGuard) {
        (self.rx, self._guard)
    }
}

pub trait StoreClient: Send + Sync {
    fn read(&self, path: &str) -> BoxFuture<'_, StoreResult<Option<Value>>>;

    fn exists(&self, path: &str) -> BoxFuture<'_, StoreResult<bool>> {
        let read = self.read(path);
        Box::pin(async move { Ok(read.await?.is_some()) })
    }

    /// Replace the node at `path`. Writing `null` deletes it.
    fn write(&self, path: &str, value: Value) -> BoxFuture<'_, StoreResult<()>>;

    /// Store `value` under a new time-ordered child key of `prefix` and
    /// return the key.
    fn append(&self, prefix: &str, value: Value) -> BoxFuture<'_, StoreResult<String>>;

    fn query(&self, path: &str, query: &ChildQuery) -> BoxFuture<'_, StoreResult<Vec<(String, Value)>>>;

    fn subscribe(&self, path: &str, query: Option<ChildQuery>) -> BoxFuture<'_, StoreResult<Watch>>;
}

/// Keys handed out by `append`. UUIDv7 strings sort lexically in creation
/// order.
pub fn new_child_key() -> String {
    uuid::Uuid::now_v7().to_string()
}
