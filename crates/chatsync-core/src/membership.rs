use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use chatsync_store::{Snapshot, StoreClient};
use chatsync_types::models::{Chat, MembershipEntry};

use crate::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::{Liveness, Subscription, WatchEvent, lock};
use crate::observer::{SyncEvent, SyncObserver};
use crate::paths;

/// Live list of the chats a user belongs to, built from the user's
/// membership index and ordered most recent first.
pub struct ChatMembershipIndex {
    store: Arc<dyn StoreClient>,
    observer: Arc<dyn SyncObserver>,
}

impl ChatMembershipIndex {
    pub fn new(ctx: &SyncContext) -> Self {
        Self {
            store: ctx.store.clone(),
            observer: ctx.observer.clone(),
        }
    }

    /// Emit the user's chat list now and after every membership change.
    ///
    /// Each change starts a resolution batch that reads the listed chats.
    /// Batches may finish out of order; a batch only emits if no newer one
    /// has started, so the caller never sees an older list after a newer
    /// one.
    pub async fn subscribe<F>(&self, user_id: &str, on_chats: F) -> SyncResult<Subscription>
    where
        F: Fn(SyncResult<Vec<Chat>>) + Send + Sync + 'static,
    {
        paths::validate_key("user id", user_id)?;

        let store = self.store.clone();
        let observer = self.observer.clone();
        let user = user_id.to_string();
        let on_chats: Arc<dyn Fn(SyncResult<Vec<Chat>>) + Send + Sync> = Arc::new(on_chats);

        Subscription::attach(
            self.store.clone(),
            paths::user_chats(user_id),
            None,
            format!("chat-list:{}", user_id),
            self.observer.clone(),
            move |liveness| {
                let mut batches = Batches {
                    store,
                    observer,
                    user_id: user,
                    on_chats,
                    liveness,
                    latest: Arc::new(AtomicU64::new(0)),
                    emit: Arc::new(Mutex::new(())),
                    in_flight: Vec::new(),
                };
                move |event| batches.handle(event)
            },
        )
        .await
    }
}

/// Resolution batches of one chat-list subscription.
struct Batches {
    store: Arc<dyn StoreClient>,
    observer: Arc<dyn SyncObserver>,
    user_id: String,
    on_chats: Arc<dyn Fn(SyncResult<Vec<Chat>>) + Send + Sync>,
    liveness: Liveness,
    /// Generation of the newest batch started.
    latest: Arc<AtomicU64>,
    /// Serializes the generation check with the emission it guards.
    emit: Arc<Mutex<()>>,
    in_flight: Vec<JoinHandle<()>>,
}

impl Batches {
    fn handle(&mut self, event: WatchEvent) {
        self.in_flight.retain(|task| !task.is_finished());

        let generation = self.latest.fetch_add(1, Ordering::AcqRel) + 1;

        match event {
            WatchEvent::Snapshot(snapshot) => {
                let chat_ids = member_chat_ids(&self.user_id, &snapshot);
                debug!(user_id = %self.user_id, generation, chats = chat_ids.len(), "membership changed");

                let store = self.store.clone();
                let observer = self.observer.clone();
                let on_chats = self.on_chats.clone();
                let liveness = self.liveness.clone();
                let latest = self.latest.clone();
                let emit = self.emit.clone();
                let user_id = self.user_id.clone();

                self.in_flight.push(tokio::spawn(async move {
                    let result = resolve_chats(store.as_ref(), &chat_ids).await;

                    let _turn = lock(&emit);
                    let newest = latest.load(Ordering::Acquire);
                    if newest != generation {
                        observer.observe(SyncEvent::StaleBatchDiscarded {
                            user_id,
                            generation,
                            latest: newest,
                        });
                        return;
                    }
                    if liveness.is_live() {
                        on_chats(result);
                    }
                }));
            }
            WatchEvent::Failed(e) => {
                // Bumping the generation above already voids in-flight work.
                let _turn = lock(&self.emit);
                (self.on_chats)(Err(e));
            }
        }
    }
}

impl Drop for Batches {
    fn drop(&mut self) {
        for task in &self.in_flight {
            task.abort();
        }
    }
}

fn member_chat_ids(user_id: &str, snapshot: &Snapshot) -> Vec<String> {
    match snapshot {
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(chat_id, raw)| MembershipEntry::from_raw(user_id, chat_id, raw).chat_id)
            .collect(),
        Some(other) => {
            warn!("Membership index of '{}' is not a record: {}", user_id, other);
            Vec::new()
        }
        None => Vec::new(),
    }
}

/// Point-read every chat, drop the ones that no longer exist or are not
/// records, and order by recency.
pub async fn resolve_chats(store: &dyn StoreClient, chat_ids: &[String]) -> SyncResult<Vec<Chat>> {
    let reads = chat_ids.iter().map(|id| {
        let path = paths::chat(id);
        async move { (id, store.read(&path).await) }
    });

    let mut chats = Vec::with_capacity(chat_ids.len());
    for (id, result) in join_all(reads).await {
        match result.map_err(SyncError::from)? {
            Some(value) => {
                if let Some(chat) = Chat::from_raw(id, &value) {
                    chats.push(chat);
                }
            }
            None => debug!(chat_id = %id, "dangling membership entry"),
        }
    }

    sort_by_recency(&mut chats);
    Ok(chats)
}

/// Most recent `last_message_at` first; chats without messages last;
/// ties by id.
pub fn sort_by_recency(chats: &mut [Chat]) {
    chats.sort_by(|a, b| {
        b.last_message_at
            .cmp(&a.last_message_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
