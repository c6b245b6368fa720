use std::path::PathBuf;

use crate::error::{SyncError, SyncResult};

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const DEFAULT_DB_PATH: &str = "chatsync.db";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    /// Messages per live window and per `load_older` page.
    pub page_size: usize,
    /// Probe the legacy message locations, not just the canonical one.
    pub legacy_paths: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            page_size: DEFAULT_PAGE_SIZE,
            legacy_paths: true,
        }
    }
}

impl SyncConfig {
    /// Read `CHATSYNC_*` variables from the process environment.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> SyncResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("CHATSYNC_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Some(raw) = lookup("CHATSYNC_PAGE_SIZE") {
            config.page_size = raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    SyncError::Validation(format!("CHATSYNC_PAGE_SIZE must be a positive integer, got '{}'", raw))
                })?;
        }

        if let Some(raw) = lookup("CHATSYNC_LEGACY_PATHS") {
            config.legacy_paths = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(SyncError::Validation(format!(
                        "CHATSYNC_LEGACY_PATHS must be a boolean, got '{}'",
                        raw
                    )));
                }
            };
        }

        Ok(config)
    }
}
