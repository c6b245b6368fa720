//! Side channel for work that must not fail the operation that triggered
//! it: chat summary updates after a send, discarded resolution batches and
//! listener re-attachment.

use std::fmt;

/// Events reported through a [`SyncObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Chat summary now reflects a sent message
    SummaryUpdated { chat_id: String, message_id: String },
    /// Chat summary already shows a newer message; nothing written
    SummarySuperseded { chat_id: String, message_id: String },
    /// Chat summary update failed; the message itself was stored
    SummaryUpdateFailed {
        chat_id: String,
        message_id: String,
        error: String,
    },
    /// A chat-list resolution finished after a newer one had started
    StaleBatchDiscarded {
        user_id: String,
        generation: u64,
        latest: u64,
    },
    /// A listener dropped by the store was attached again
    Reattached { path: String },
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SummaryUpdated { chat_id, message_id } => {
                write!(f, "summary_updated chat={} message={}", chat_id, message_id)
            }
            Self::SummarySuperseded { chat_id, message_id } => {
                write!(f, "summary_superseded chat={} message={}", chat_id, message_id)
            }
            Self::SummaryUpdateFailed { chat_id, message_id, error } => {
                write!(f, "summary_update_failed chat={} message={} error: {}", chat_id, message_id, error)
            }
            Self::StaleBatchDiscarded { user_id, generation, latest } => {
                write!(f, "stale_batch_discarded user={} generation={} latest={}", user_id, generation, latest)
            }
            Self::Reattached { path } => {
                write!(f, "reattached path={}", path)
            }
        }
    }
}

pub trait SyncObserver: Send + Sync {
    fn observe(&self, event: SyncEvent);
}

/// Observer that uses the `tracing` crate.
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn observe(&self, event: SyncEvent) {
        match &event {
            SyncEvent::SummaryUpdateFailed { .. } => {
                tracing::warn!(component = "chatsync", "{}", event);
            }
            SyncEvent::Reattached { .. } => {
                tracing::info!(component = "chatsync", "{}", event);
            }
            _ => {
                tracing::debug!(component = "chatsync", "{}", event);
            }
        }
    }
}

/// Discards every event.
pub struct NullObserver;

impl SyncObserver for NullObserver {
    fn observe(&self, _event: SyncEvent) {}
}
