//! Client-side chat synchronization core.
//!
//! Keeps a user's chat list, the message window of an open chat and chat
//! creation consistent with a remote key-tree store that other clients
//! mutate concurrently:
//! - [`membership::ChatMembershipIndex`]: live, recency-ordered chat list
//! - [`stream::MessageStream`]: live message window with backward paging
//! - [`factory::ChatFactory`]: idempotent chat creation
//! - [`resolver::PathResolver`]: legacy message-location discovery
//! - [`lifecycle`]: subscription ownership and teardown

pub mod config;
pub mod error;
pub mod factory;
pub mod lifecycle;
pub mod membership;
pub mod observer;
pub mod paths;
pub mod resolver;
pub mod stream;
pub mod users;

use std::sync::Arc;

use chatsync_store::StoreClient;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use factory::ChatFactory;
pub use lifecycle::{LifecycleScope, Subscription};
pub use membership::ChatMembershipIndex;
pub use observer::{NullObserver, SyncEvent, SyncObserver, TracingObserver};
pub use resolver::{MessageLocation, PathResolver};
pub use stream::{Author, MessageStream, StreamState};
pub use users::UserDirectory;

/// Everything the components share: the store handle, the location
/// strategy, configuration and the side channel for best-effort work.
#[derive(Clone)]
pub struct SyncContext {
    pub store: Arc<dyn StoreClient>,
    pub resolver: Arc<PathResolver>,
    pub config: SyncConfig,
    pub observer: Arc<dyn SyncObserver>,
}

impl SyncContext {
    pub fn new(store: Arc<dyn StoreClient>, config: SyncConfig) -> Self {
        let resolver = Arc::new(PathResolver::from_config(&config));
        Self {
            store,
            resolver,
            config,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_resolver(mut self, resolver: PathResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }
}

/// Wall-clock milliseconds, the timestamp unit stored in records.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
