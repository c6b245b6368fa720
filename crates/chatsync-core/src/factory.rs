use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use chatsync_store::StoreClient;
use chatsync_types::api::CreateChatRequest;
use chatsync_types::models::{Chat, MembershipEntry};

use crate::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::lifecycle::lock;
use crate::now_ms;
use crate::paths;
use crate::users::load_users;

/// Trimmed chat name plus the participant id set.
type CreationKey = (String, BTreeSet<String>);
type PendingTable = Arc<Mutex<HashMap<CreationKey, Arc<AsyncMutex<()>>>>>;

/// Creates chats idempotently with respect to (name, participant set).
pub struct ChatFactory {
    store: Arc<dyn StoreClient>,
    pending: PendingTable,
}

impl ChatFactory {
    pub fn new(ctx: &SyncContext) -> Self {
        Self {
            store: ctx.store.clone(),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a chat, or return the id of an existing chat with the same
    /// trimmed name and exactly the same participants.
    ///
    /// Nothing is written until every username resolves. Membership entries
    /// are written last; if some fail the chat still exists and
    /// [`SyncError::PartialWrite`] names the members that will not see it.
    pub async fn create(&self, req: CreateChatRequest) -> SyncResult<String> {
        let name = req.name.trim().to_string();
        if name.is_empty() {
            return Err(SyncError::Validation("chat name is empty".into()));
        }
        paths::validate_key("requester id", &req.requester_id)?;

        let requester = req.requester_username.trim().to_string();
        if requester.is_empty() {
            return Err(SyncError::Validation("requester username is empty".into()));
        }
        let mut usernames = vec![requester.clone()];
        for username in &req.participant_usernames {
            let username = username.trim();
            if !username.is_empty() && !usernames.iter().any(|u| u == username) {
                usernames.push(username.to_string());
            }
        }

        let participants = self.resolve_participants(&usernames, &requester, &req.requester_id).await?;
        let participant_set: BTreeSet<String> =
            participants.iter().map(|(id, _)| id.clone()).collect();

        let _pending = self.claim((name.clone(), participant_set.clone())).await;

        if let Some(existing) = self.find_existing(&name, &participant_set).await? {
            debug!(chat_id = %existing, name = %name, "chat already exists");
            return Ok(existing);
        }

        let now = now_ms();
        let (ids, names): (Vec<String>, Vec<String>) = participants.into_iter().unzip();
        let chat_id = self
            .store
            .append(
                paths::CHATS,
                json!({
                    "name": name,
                    "participantIds": ids,
                    "participantUsernames": names,
                    "createdAt": now,
                    "createdBy": req.requester_id,
                    "lastMessage": Value::Null,
                    "lastMessageAt": Value::Null,
                }),
            )
            .await?;
        info!(chat_id = %chat_id, name = %name, members = ids.len(), "chat created");

        let writes = ids.iter().map(|user_id| {
            let entry = MembershipEntry {
                user_id: user_id.clone(),
                chat_id: chat_id.clone(),
                added_at: now,
            };
            let store = self.store.clone();
            async move {
                let path = paths::membership(&entry.user_id, &entry.chat_id);
                let result = store.write(&path, entry.to_record()).await;
                (entry.user_id, result)
            }
        });

        let failed_user_ids: Vec<String> = join_all(writes)
            .await
            .into_iter()
            .filter_map(|(user_id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(chat_id = %chat_id, user_id = %user_id, "membership write failed: {}", e);
                    Some(user_id)
                }
            })
            .collect();

        if !failed_user_ids.is_empty() {
            return Err(SyncError::PartialWrite {
                chat_id,
                failed_user_ids,
            });
        }

        Ok(chat_id)
    }

    /// Map usernames to `(user id, username)` in the given order. The
    /// requester is taken from the request and never looked up.
    async fn resolve_participants(
        &self,
        usernames: &[String],
        requester: &str,
        requester_id: &str,
    ) -> SyncResult<Vec<(String, String)>> {
        let users = load_users(self.store.as_ref()).await?;

        let mut resolved: Vec<(String, String)> = Vec::with_capacity(usernames.len());
        for username in usernames {
            let id = if username == requester {
                requester_id.to_string()
            } else {
                users
                    .iter()
                    .find(|u| u.username.trim() == username)
                    .map(|u| u.id.clone())
                    .ok_or_else(|| SyncError::NotFound(username.clone()))?
            };
            // Two names for one id would make the set smaller than the list.
            if !resolved.iter().any(|(existing, _)| *existing == id) {
                resolved.push((id, username.clone()));
            }
        }
        Ok(resolved)
    }

    async fn find_existing(
        &self,
        name: &str,
        participants: &BTreeSet<String>,
    ) -> SyncResult<Option<String>> {
        let Some(Value::Object(records)) = self.store.read(paths::CHATS).await? else {
            return Ok(None);
        };

        Ok(records
            .iter()
            .filter_map(|(id, record)| Chat::from_raw(id, record))
            .find(|chat| is_same_chat(chat, name, participants))
            .map(|chat| chat.id))
    }

    /// Serialize creations of the same chat on this factory.
    async fn claim(&self, key: CreationKey) -> PendingCreation {
        let slot = lock(&self.pending).entry(key.clone()).or_default().clone();
        PendingCreation {
            table: self.pending.clone(),
            key,
            guard: Some(slot.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn is_same_chat(chat: &Chat, name: &str, participants: &BTreeSet<String>) -> bool {
    if chat.name.trim() != name {
        return false;
    }
    let ids: BTreeSet<&str> = chat.participant_ids.iter().map(String::as_str).collect();
    ids.len() == participants.len() && participants.iter().all(|id| ids.contains(id.as_str()))
}

/// Held for the duration of one creation. The table entry goes away with
/// the last holder.
struct PendingCreation {
    table: PendingTable,
    key: CreationKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PendingCreation {
    fn drop(&mut self) {
        let mut table = lock(&self.table);
        drop(self.guard.take());
        // Only the table itself still holds the slot: no waiter is queued.
        if table.get(&self.key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            table.remove(&self.key);
        }
    }
}
