use chatsync_store::StoreError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The chat exists but some members will not see it until their
    /// membership entry is written.
    #[error("chat {chat_id} created but membership writes failed for {failed_user_ids:?}")]
    PartialWrite {
        chat_id: String,
        failed_user_ids: Vec<String>,
    },
    #[error("stream closed")]
    Closed,
}

impl SyncError {
    /// Stable failure reason handed to the UI layer.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::PartialWrite { .. } => "partial_write",
            Self::Closed => "closed",
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::InvalidPath(path) => Self::Validation(format!("invalid path '{}'", path)),
        }
    }
}
