//! Store path layout.

use crate::error::{SyncError, SyncResult};

pub const USERS: &str = "users";
pub const CHATS: &str = "chats";
pub const USER_CHATS: &str = "userChats";

pub fn user(user_id: &str) -> String {
    format!("{}/{}", USERS, user_id)
}

pub fn chat(chat_id: &str) -> String {
    format!("{}/{}", CHATS, chat_id)
}

pub fn chat_field(chat_id: &str, field: &str) -> String {
    format!("{}/{}/{}", CHATS, chat_id, field)
}

/// Membership index of one user: one child per chat id.
pub fn user_chats(user_id: &str) -> String {
    format!("{}/{}", USER_CHATS, user_id)
}

pub fn membership(user_id: &str, chat_id: &str) -> String {
    format!("{}/{}/{}", USER_CHATS, user_id, chat_id)
}

/// Ids are single path segments. An empty id or one containing '/' would
/// address a different node than intended.
pub fn validate_key(kind: &str, key: &str) -> SyncResult<()> {
    if key.trim().is_empty() {
        return Err(SyncError::Validation(format!("{} must not be empty", kind)));
    }
    if key.contains('/') {
        return Err(SyncError::Validation(format!("{} '{}' must not contain '/'", kind, key)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(membership("u1", "c1"), "userChats/u1/c1");
        assert_eq!(chat_field("c1", "lastMessage"), "chats/c1/lastMessage");
    }

    #[test]
    fn keys_must_be_single_segments() {
        assert!(validate_key("chat id", "c1").is_ok());
        assert!(validate_key("chat id", "").is_err());
        assert!(validate_key("chat id", "  ").is_err());
        assert!(validate_key("chat id", "a/b").is_err());
    }
}
