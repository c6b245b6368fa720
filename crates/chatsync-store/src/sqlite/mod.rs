mod migrations;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use rusqlite::Connection;
use serde_json::Value;
use tracing::{info, warn};

use crate::tree;
use crate::watchers::WatcherRegistry;
use crate::{BoxFuture, ChildQuery, StoreClient, StoreError, StoreResult, Watch, new_child_key};

/// SQLite connection holder.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // Keys are case-sensitive; LIKE must not fold "Alice" into "alice".
        conn.pragma_update(None, "case_sensitive_like", true)?;

        migrations::run(&conn)?;

        info!("Store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "case_sensitive_like", true)?;
        migrations::run(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().map_err(|e| anyhow!("DB lock poisoned: {}", e))?;
        f(&conn)
    }
}

/// Key-tree store persisted in SQLite. Listeners are process-local.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
    watchers: WatcherRegistry,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_db(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_db(Database::open_in_memory()?))
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            watchers: WatcherRegistry::new(),
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Run blocking database work off the async runtime.
    async fn blocking<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Database, &WatcherRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let watchers = self.watchers.clone();
        tokio::task::spawn_blocking(move || f(&db, &watchers))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {}", e)))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

fn like_prefix(segs: &[String]) -> String {
    let base = tree::join(segs)
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("{}/%", base)
}

fn read_subtree(conn: &Connection, segs: &[String]) -> Result<Option<Value>> {
    let mut stmt = conn.prepare(
        "SELECT path, value FROM nodes WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![tree::join(segs), like_prefix(segs)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut leaves = Vec::with_capacity(rows.len());
    for (path, raw) in rows {
        match serde_json::from_str::<Value>(&raw) {
            Ok(v) => leaves.push((path, v)),
            Err(e) => warn!("Corrupt leaf at '{}': {}", path, e),
        }
    }

    Ok(tree::unflatten(segs, leaves))
}

fn write_subtree(conn: &Connection, segs: &[String], value: Value) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "DELETE FROM nodes WHERE path = ?1 OR path LIKE ?2 ESCAPE '\\'",
        rusqlite::params![tree::join(segs), like_prefix(segs)],
    )?;

    // A leaf at an ancestor is replaced by the object we are about to
    // build beneath it.
    for depth in 1..segs.len() {
        tx.execute("DELETE FROM nodes WHERE path = ?1", [tree::join(&segs[..depth])])?;
    }

    for (path, leaf) in tree::flatten(segs, &tree::prune(value)) {
        tx.execute(
            "INSERT INTO nodes (path, value) VALUES (?1, ?2)",
            rusqlite::params![path, leaf.to_string()],
        )?;
    }

    tx.commit()?;
    Ok(())
}

fn put(db: &Database, watchers: &WatcherRegistry, segs: &[String], value: Value) -> Result<()> {
    db.with_conn(|conn| {
        write_subtree(conn, segs, value)?;
        // Still under the connection lock: snapshots go out in write order.
        watchers.notify(segs, |path, query| match read_subtree(conn, path) {
            Ok(node) => tree::snapshot(node.as_ref(), query),
            Err(e) => {
                warn!("Snapshot read for '{}' failed: {}", tree::join(path), e);
                None
            }
        });
        Ok(())
    })
}

impl StoreClient for SqliteStore {
    fn read(&self, path: &str) -> BoxFuture<'_, StoreResult<Option<Value>>> {
        let segs = tree::parse_path(path);
        Box::pin(async move {
            let segs = segs?;
            self.blocking(move |db, _| db.with_conn(|conn| read_subtree(conn, &segs)))
                .await
        })
    }

    fn write(&self, path: &str, value: Value) -> BoxFuture<'_, StoreResult<()>> {
        let segs = tree::parse_path(path);
        Box::pin(async move {
            let segs = segs?;
            self.blocking(move |db, watchers| put(db, watchers, &segs, value))
                .await
        })
    }

    fn append(&self, prefix: &str, value: Value) -> BoxFuture<'_, StoreResult<String>> {
        let segs = tree::parse_path(prefix);
        Box::pin(async move {
            let mut segs = segs?;
            let key = new_child_key();
            segs.push(key.clone());
            self.blocking(move |db, watchers| put(db, watchers, &segs, value))
                .await?;
            Ok(key)
        })
    }

    fn query(&self, path: &str, query: &ChildQuery) -> BoxFuture<'_, StoreResult<Vec<(String, Value)>>> {
        let segs = tree::parse_path(path);
        let query = query.clone();
        Box::pin(async move {
            let segs = segs?;
            self.blocking(move |db, _| {
                let node = db.with_conn(|conn| read_subtree(conn, &segs))?;
                Ok(tree::apply_query(node.as_ref(), &query))
            })
            .await
        })
    }

    fn subscribe(&self, path: &str, query: Option<ChildQuery>) -> BoxFuture<'_, StoreResult<Watch>> {
        let segs = tree::parse_path(path);
        Box::pin(async move {
            let segs = segs?;
            self.blocking(move |db, watchers| {
                db.with_conn(|conn| {
                    let node = read_subtree(conn, &segs)?;
                    let initial = tree::snapshot(node.as_ref(), query.as_ref());
                    Ok(watchers.register(segs, query, initial))
                })
            })
            .await
        })
    }
}
