// Local durable cache: per-user notification backlog and viewed-story set.
//
// Best-effort by contract. Reads fall back to an empty list on any failure
// and writes log and continue, so a broken cache file never blocks a session.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use feedsync_common::types::UserId;

use crate::config::CacheConfig;

const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE cache_entries (
    cache_key   TEXT PRIMARY KEY,
    value_json  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

const MIGRATIONS: &[(i64, &str)] = &[(1, MIGRATION_V1_SQL)];

/// Which end of a stored list survives when it exceeds its bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retain {
    /// Lists stored newest-first.
    Head,
    /// Lists stored oldest-first.
    Tail,
}

/// A per-user cache slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheKey {
    Notifications(UserId),
    ViewedStories(UserId),
}

impl CacheKey {
    pub fn as_key(&self) -> String {
        match self {
            Self::Notifications(user_id) => format!("notifications:{user_id}"),
            Self::ViewedStories(user_id) => format!("viewed_stories:{user_id}"),
        }
    }

    fn retain(&self) -> Retain {
        match self {
            Self::Notifications(_) => Retain::Head,
            Self::ViewedStories(_) => Retain::Tail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Limits {
    max_notifications: usize,
    max_viewed_stories: usize,
}

impl Limits {
    fn for_key(&self, key: &CacheKey) -> usize {
        match key {
            CacheKey::Notifications(_) => self.max_notifications,
            CacheKey::ViewedStories(_) => self.max_viewed_stories,
        }
    }
}

/// Shared handle to the SQLite-backed cache.
#[derive(Clone)]
pub struct LocalCache {
    conn: Arc<Mutex<Connection>>,
    limits: Limits,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache").field("limits", &self.limits).finish_non_exhaustive()
    }
}

impl LocalCache {
    pub fn open(path: impl AsRef<Path>, config: &CacheConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create cache parent directory `{}`", parent.display())
            })?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open cache at `{}`", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas for cache")?;
        Self::init(&mut conn)?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn open_in_memory(config: &CacheConfig) -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("failed to open in-memory cache")?;
        Self::init(&mut conn)?;
        Ok(Self::from_connection(conn, config))
    }

    /// Open `path`, or fall back to an in-memory cache when it is unusable.
    pub fn open_or_in_memory(path: Option<&Path>, config: &CacheConfig) -> Result<Self> {
        if let Some(path) = path {
            match Self::open(path, config) {
                Ok(cache) => return Ok(cache),
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "cache unavailable; using in-memory cache")
                }
            }
        }
        Self::open_in_memory(config)
    }

    fn init(conn: &mut Connection) -> Result<()> {
        ensure_migration_table(conn)?;
        apply_pending_migrations(conn)
    }

    fn from_connection(conn: Connection, config: &CacheConfig) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            limits: Limits {
                max_notifications: config.max_notifications,
                max_viewed_stories: config.max_viewed_stories,
            },
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schema_version(&self) -> Result<i64> {
        current_schema_version(&self.lock())
    }

    /// Stored list for `key`; empty when missing or unreadable.
    pub fn load_list<T: DeserializeOwned>(&self, key: &CacheKey) -> Vec<T> {
        match self.try_load(key) {
            Ok(Some(items)) => items,
            Ok(None) => Vec::new(),
            Err(error) => {
                warn!(key = %key.as_key(), error = %format!("{error:#}"), "cache read failed");
                Vec::new()
            }
        }
    }

    /// Drop from `items` whatever `store_list` would not keep for `key`.
    pub fn trim_to_bound<T>(&self, key: &CacheKey, items: &mut Vec<T>) {
        let limit = self.limits.for_key(key);
        match key.retain() {
            Retain::Head => items.truncate(limit),
            Retain::Tail => {
                let excess = items.len().saturating_sub(limit);
                items.drain(..excess);
            }
        }
    }

    /// Persist `items` under `key`, trimmed to the configured bound.
    pub fn store_list<T: Serialize>(&self, key: &CacheKey, items: &[T]) {
        let limit = self.limits.for_key(key);
        let kept = match key.retain() {
            Retain::Head => &items[..items.len().min(limit)],
            Retain::Tail => &items[items.len().saturating_sub(limit)..],
        };
        if let Err(error) = self.try_store(key, kept) {
            warn!(key = %key.as_key(), error = %format!("{error:#}"), "cache write failed");
        }
    }

    pub fn remove(&self, key: &CacheKey) {
        let result = self
            .lock()
            .execute("DELETE FROM cache_entries WHERE cache_key = ?1", params![key.as_key()]);
        if let Err(error) = result {
            warn!(key = %key.as_key(), %error, "cache delete failed");
        }
    }

    fn try_load<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<Vec<T>>> {
        let raw: Option<String> = self
            .lock()
            .query_row(
                "SELECT value_json FROM cache_entries WHERE cache_key = ?1",
                params![key.as_key()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query cache entry")?;
        raw.map(|json| serde_json::from_str(&json).context("cached value is not a valid list"))
            .transpose()
    }

    fn try_store<T: Serialize>(&self, key: &CacheKey, items: &[T]) -> Result<()> {
        let json = serde_json::to_string(items).context("failed to encode cache value")?;
        self.lock()
            .execute(
                "INSERT INTO cache_entries (cache_key, value_json, updated_at)
                 VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(cache_key) DO UPDATE
                 SET value_json = excluded.value_json, updated_at = excluded.updated_at",
                params![key.as_key(), json],
            )
            .context("failed to upsert cache entry")?;
        debug!(key = %key.as_key(), len = items.len(), "cache entry stored");
        Ok(())
    }
}

fn ensure_migration_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );
        ",
    )
    .context("failed to ensure schema_migrations table exists")
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read current schema version")
}

fn apply_pending_migrations(conn: &mut Connection) -> Result<()> {
    let current_version = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current_version {
            continue;
        }

        let tx = conn.transaction().context("failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("failed to apply cache migration v{version}"))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            params![version],
        )
        .with_context(|| format!("failed to record migration v{version}"))?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
    }

    Ok(())
}
