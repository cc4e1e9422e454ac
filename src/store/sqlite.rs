//! SQLite-backed store.
//!
//! Each call opens its own connection on the blocking pool, so no lock is
//! held in the application. Atomicity comes from SQLite itself: every
//! operation is a single statement (`INSERT .. ON CONFLICT .. RETURNING`,
//! `DELETE .. RETURNING`), which SQLite executes under its write lock.

use super::{KeyValueStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Expired rows are physically removed once every this many writes.
const PURGE_EVERY_WRITES: u64 = 512;

pub struct SqliteStore {
    db_path: String,
    writes: AtomicU64,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_millis(ttl: Duration) -> i64 {
    now_millis() + ttl.as_millis() as i64
}

fn open(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

impl SqliteStore {
    /// Opens (creating if needed) the store at `db_path`.
    pub fn new(db_path: &str) -> StoreResult<Self> {
        let store = Self {
            db_path: db_path.to_string(),
            writes: AtomicU64::new(0),
        };
        store.init_db()?;
        info!("Key/value store initialized at: {}", db_path);
        Ok(store)
    }

    fn init_db(&self) -> StoreResult<()> {
        let conn = open(&self.db_path)?;

        // WAL lets readers proceed while a counter update holds the write lock.
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv (expires_at)",
            [],
        )?;

        Ok(())
    }

    async fn run<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            op(&conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
        .map_err(StoreError::from)
    }

    async fn note_write(&self) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % PURGE_EVERY_WRITES == 0 {
            if let Ok(removed) = self.purge_expired().await {
                debug!(removed, "Purged expired store rows");
            }
        }
    }

    /// Deletes rows whose TTL has elapsed. Reads already ignore them; this
    /// only reclaims space.
    pub async fn purge_expired(&self) -> StoreResult<usize> {
        let now = now_millis();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
        })
        .await
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        let now = now_millis();
        self.run(move |conn| {
            conn.query_row(
                "SELECT 1 FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        let now = now_millis();
        self.run(move |conn| {
            conn.query_row(
                "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = ttl.map(expiry_millis);
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )
        })
        .await?;
        self.note_write().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let key = key.to_string();
        let now = now_millis();
        self.run(move |conn| {
            conn.query_row(
                "DELETE FROM kv WHERE key = ?1 RETURNING (expires_at IS NULL OR expires_at > ?2)",
                params![key, now],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .map(|live| live.unwrap_or(false))
        })
        .await
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        let now = now_millis();
        self.run(move |conn| {
            conn.query_row(
                "DELETE FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)
                 RETURNING value",
                params![key, now],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let key_owned = key.to_string();
        let now = now_millis();
        let window_end = now + window.as_millis() as i64;

        // One statement: an expired counter restarts at 1 with a fresh window,
        // a live one is bumped and keeps its original expiry.
        let count: Option<i64> = self
            .run(move |conn| {
                conn.query_row(
                    "INSERT INTO kv (key, value, expires_at) VALUES (?1, '1', ?2)
                     ON CONFLICT(key) DO UPDATE SET
                        value = CASE
                            WHEN kv.expires_at IS NOT NULL AND kv.expires_at <= ?3 THEN '1'
                            ELSE CAST(CAST(kv.value AS INTEGER) + 1 AS TEXT)
                        END,
                        expires_at = CASE
                            WHEN kv.expires_at IS NULL OR kv.expires_at <= ?3 THEN ?2
                            ELSE kv.expires_at
                        END
                     RETURNING CAST(value AS INTEGER)",
                    params![key_owned, window_end, now],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        self.note_write().await;

        match count {
            Some(n) if n > 0 => Ok(n as u64),
            _ => Err(StoreError::Corrupt(format!("counter {key} is not numeric"))),
        }
    }
}
