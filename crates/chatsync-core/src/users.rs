use std::sync::Arc;

use argon2::{
    Argon2, PasswordHasher,
    password_hash::{SaltString, rand_core::OsRng},
};
use serde_json::{Value, json};
use tracing::info;

use chatsync_store::StoreClient;
use chatsync_types::api::RegisterRequest;
use chatsync_types::models::User;

use crate::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::now_ms;
use crate::paths;

/// Registration and lookup over the `users` index.
pub struct UserDirectory {
    store: Arc<dyn StoreClient>,
}

impl UserDirectory {
    pub fn new(ctx: &SyncContext) -> Self {
        Self {
            store: ctx.store.clone(),
        }
    }

    pub async fn register(&self, req: RegisterRequest) -> SyncResult<User> {
        let username = req.username.trim();
        let length = username.chars().count();
        if !(3..=32).contains(&length) {
            return Err(SyncError::Validation(
                "username must be 3 to 32 characters".into(),
            ));
        }
        if req.password.chars().count() < 8 {
            return Err(SyncError::Validation(
                "password must be at least 8 characters".into(),
            ));
        }

        // Not transactional: two clients can still register the same name.
        if self.find_by_username(username).await?.is_some() {
            return Err(SyncError::Validation("username already exists".into()));
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| SyncError::Validation(format!("password rejected: {}", e)))?
            .to_string();

        let created_at = now_ms();
        let id = self
            .store
            .append(
                paths::USERS,
                json!({
                    "username": username,
                    "password": password_hash,
                    "createdAt": created_at,
                }),
            )
            .await?;

        info!(user_id = %id, username, "user registered");

        Ok(User {
            id,
            username: username.to_string(),
            password: password_hash,
            created_at,
        })
    }

    /// First user, in key order, whose name matches after trimming.
    pub async fn find_by_username(&self, username: &str) -> SyncResult<Option<User>> {
        let wanted = username.trim();
        Ok(load_users(self.store.as_ref())
            .await?
            .into_iter()
            .find(|u| u.username.trim() == wanted))
    }
}

/// Every decodable user under `users`, in key order.
pub(crate) async fn load_users(store: &dyn StoreClient) -> SyncResult<Vec<User>> {
    let users = match store.read(paths::USERS).await? {
        Some(Value::Object(records)) => records
            .iter()
            .filter_map(|(id, record)| User::from_value(id, record))
            .collect(),
        _ => Vec::new(),
    };
    Ok(users)
}
