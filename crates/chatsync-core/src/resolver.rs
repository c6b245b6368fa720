use tracing::debug;

use chatsync_store::StoreClient;

use crate::config::SyncConfig;
use crate::error::SyncResult;

/// Message location templates, canonical first, then legacy layouts in
/// the order they are preferred.
pub const LOCATION_TEMPLATES: [&str; 5] = [
    "messages/{chatId}",
    "chatMessages/{chatId}",
    "chats/{chatId}/messages",
    "messagesByChat/{chatId}",
    "chats/{chatId}/messagesById",
];

/// Where one chat's messages live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageLocation {
    pub template: &'static str,
    pub path: String,
    /// Index into the resolver's candidate list; 0 is canonical.
    pub priority: usize,
}

impl MessageLocation {
    pub fn is_canonical(&self) -> bool {
        self.priority == 0
    }
}

/// Picks the storage location of a chat's messages by probing candidates
/// in priority order.
#[derive(Debug, Clone)]
pub struct PathResolver {
    templates: Vec<&'static str>,
}

impl PathResolver {
    pub fn legacy() -> Self {
        Self {
            templates: LOCATION_TEMPLATES.to_vec(),
        }
    }

    /// Only the canonical location; nothing is probed.
    pub fn canonical_only() -> Self {
        Self {
            templates: vec![LOCATION_TEMPLATES[0]],
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        if config.legacy_paths {
            Self::legacy()
        } else {
            Self::canonical_only()
        }
    }

    pub fn candidates(&self, chat_id: &str) -> Vec<MessageLocation> {
        self.templates
            .iter()
            .enumerate()
            .map(|(priority, &template)| MessageLocation {
                template,
                path: template.replace("{chatId}", chat_id),
                priority,
            })
            .collect()
    }

    /// First candidate that exists, else the canonical one. Probes run one
    /// at a time; a failed probe aborts resolution since a lower-priority
    /// hit cannot be trusted while a higher one is undecided.
    pub async fn resolve(&self, store: &dyn StoreClient, chat_id: &str) -> SyncResult<MessageLocation> {
        let candidates = self.candidates(chat_id);

        if candidates.len() > 1 {
            for candidate in &candidates {
                if store.exists(&candidate.path).await? {
                    debug!(chat_id, path = %candidate.path, "message location resolved");
                    return Ok(candidate.clone());
                }
            }
        }

        let canonical = candidates
            .into_iter()
            .next()
            .unwrap_or_else(|| MessageLocation {
                template: LOCATION_TEMPLATES[0],
                path: LOCATION_TEMPLATES[0].replace("{chatId}", chat_id),
                priority: 0,
            });
        debug!(chat_id, path = %canonical.path, "using canonical message location");
        Ok(canonical)
    }
}
