use serde::{Deserialize, Serialize};

// -- Users --

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

// -- Chats --

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChatRequest {
    pub name: String,
    pub participant_usernames: Vec<String>,
    pub requester_id: String,
    pub requester_username: String,
}

// -- Messages --

/// Result of one backward pagination step. `more` is a heuristic: a full
/// page was returned, so older entries may exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OlderPage {
    pub more: bool,
}
