use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Username shown for messages whose sender fields are missing.
pub const UNKNOWN_SENDER: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(default)]
    pub id: String,
    pub username: String,
    /// Opaque secret. Only the credential layer interprets it.
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub created_at: i64,
}

impl User {
    /// Decode a user record stored under `users/{id}`. The key wins over any
    /// `id` field in the record.
    pub fn from_value(id: &str, value: &Value) -> Option<Self> {
        match serde_json::from_value::<User>(value.clone()) {
            Ok(mut user) => {
                user.id = id.to_string();
                Some(user)
            }
            Err(e) => {
                warn!("Skipping malformed user '{}': {}", id, e);
                None
            }
        }
    }
}

/// Chat metadata. `participant_ids` is logically a set; the vector order is
/// display order only and `participant_usernames` follows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub participant_ids: Vec<String>,
    pub participant_usernames: Vec<String>,
    pub created_at: i64,
    pub created_by: String,
    pub last_message: Option<String>,
    pub last_message_at: Option<i64>,
}

impl Chat {
    /// Normalize a chat stored under `chats/{id}`.
    ///
    /// Only values that are not records are rejected. Field types are taken
    /// loosely: timestamps may be numbers or numeric strings, and anything
    /// unreadable falls back to its default. Older clients wrote `chatName`,
    /// `participants` and a single `timestamp` that they bumped on every
    /// send.
    pub fn from_raw(id: &str, raw: &Value) -> Option<Self> {
        let Value::Object(fields) = raw else {
            warn!("Chat '{}' is not a record, ignoring", id);
            return None;
        };

        let last_message = pick(fields, &["lastMessage"])
            .map(scalar_text)
            .filter(|text| !text.is_empty());

        Some(Chat {
            id: id.to_string(),
            name: pick(fields, &["name", "chatName"]).map(scalar_text).unwrap_or_default(),
            participant_ids: pick(fields, &["participantIds", "participants"])
                .map(text_list)
                .unwrap_or_default(),
            participant_usernames: pick(fields, &["participantUsernames"])
                .map(text_list)
                .unwrap_or_default(),
            created_at: first_timestamp(fields, &["createdAt", "timestamp"]).unwrap_or_default(),
            created_by: pick(fields, &["createdBy"]).map(scalar_text).unwrap_or_default(),
            last_message,
            last_message_at: first_timestamp(fields, &["lastMessageAt", "timestamp"]),
        })
    }
}

/// A chat message in its strict form. Raw store entries are converted with
/// [`Message::from_raw`] before anything else looks at them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub body: String,
    pub created_at: i64,
}

impl Message {
    /// Normalize one raw entry found at a message location.
    ///
    /// Older clients wrote bare strings, `message`/`text` instead of `body`,
    /// and `timestamp` instead of `createdAt`. Nothing is discarded: missing
    /// timestamps become 0 and missing bodies become empty.
    pub fn from_raw(id: &str, chat_id: &str, raw: &Value) -> Self {
        let mut msg = Message {
            id: id.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: String::new(),
            sender_username: UNKNOWN_SENDER.to_string(),
            body: String::new(),
            created_at: 0,
        };

        match raw {
            Value::Object(fields) => {
                if let Some(body) = ["body", "message", "text"]
                    .iter()
                    .find_map(|k| fields.get(*k))
                {
                    msg.body = scalar_text(body);
                }
                if let Some(ts) = ["createdAt", "timestamp"]
                    .iter()
                    .find_map(|k| fields.get(*k).and_then(timestamp_ms))
                {
                    msg.created_at = ts;
                }
                if let Some(Value::String(sender)) = fields.get("senderId") {
                    msg.sender_id = sender.clone();
                }
                if let Some(Value::String(name)) = fields.get("senderUsername") {
                    if !name.is_empty() {
                        msg.sender_username = name.clone();
                    }
                }
                if let Some(Value::String(cid)) = fields.get("chatId") {
                    if !cid.is_empty() && cid != chat_id {
                        warn!("Message '{}' claims chat '{}' but lives under '{}'", id, cid, chat_id);
                    }
                }
            }
            other => msg.body = scalar_text(other),
        }

        msg
    }

    /// Ordering key: creation time, then the store-assigned id.
    pub fn sort_key(&self) -> (i64, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Record written to the store on send. The id is the store key and is
    /// not repeated inside the record.
    pub fn to_record(&self) -> Value {
        serde_json::json!({
            "chatId": self.chat_id,
            "senderId": self.sender_id,
            "senderUsername": self.sender_username,
            "body": self.body,
            "createdAt": self.created_at,
        })
    }
}

/// Existence of `userChats/{user_id}/{chat_id}` is membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub user_id: String,
    pub chat_id: String,
    pub added_at: i64,
}

impl MembershipEntry {
    pub fn to_record(&self) -> Value {
        serde_json::json!({ "addedAt": self.added_at })
    }

    /// Legacy clients stored `true` instead of a record, so any value counts.
    pub fn from_raw(user_id: &str, chat_id: &str, raw: &Value) -> Self {
        let added_at = raw
            .get("addedAt")
            .and_then(timestamp_ms)
            .unwrap_or_default();

        Self {
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            added_at,
        }
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn pick<'a>(fields: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|k| fields.get(*k))
}

fn first_timestamp(fields: &Map<String, Value>, names: &[&str]) -> Option<i64> {
    names.iter().find_map(|k| fields.get(*k).and_then(timestamp_ms))
}

/// Array entries as text, or the keys of a `{ id: true }` map.
fn text_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(scalar_text)
            .filter(|text| !text.is_empty())
            .collect(),
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

fn timestamp_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
