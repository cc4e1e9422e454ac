//! In-process store.
//!
//! Used by tests and single-node deployments. Expired entries are dropped
//! the next time their key is touched, and swept from the whole map every
//! [`PURGE_EVERY_WRITES`] writes so keys that are never seen again do not
//! accumulate.

use super::{KeyValueStore, StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Expired entries are swept once every this many writes.
pub const PURGE_EVERY_WRITES: u64 = 512;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// `HashMap` behind a single mutex. Every operation runs entirely under the
/// lock, so increments and takes are trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries. Test helper.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored entries, expired ones included.
    pub fn physical_len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drops every expired entry. Reads already ignore them; this only
    /// reclaims memory.
    pub fn purge_expired(&self) -> usize {
        Self::sweep(&mut self.entries.lock(), Instant::now())
    }

    fn sweep(map: &mut HashMap<String, Entry>, now: Instant) -> usize {
        let before = map.len();
        map.retain(|_, entry| entry.is_live(now));
        before - map.len()
    }

    /// Counts a write and sweeps on every `PURGE_EVERY_WRITES`th one. Runs
    /// under the caller's lock.
    fn note_write(&self, map: &mut HashMap<String, Entry>, now: Instant) {
        let n = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if n % PURGE_EVERY_WRITES == 0 {
            let removed = Self::sweep(map, now);
            debug!(removed, "Purged expired store entries");
        }
    }

    fn live_value(map: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match map.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut map = self.entries.lock();
        Ok(Self::live_value(&mut map, key, Instant::now()).is_some())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut map = self.entries.lock();
        Ok(Self::live_value(&mut map, key, Instant::now()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Instant::now();
        let mut map = self.entries.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        self.note_write(&mut map, now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .map_or(false, |entry| entry.is_live(now)))
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        let now = Instant::now();
        let mut map = self.entries.lock();

        match map.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                let count: u64 = entry
                    .value
                    .parse()
                    .map_err(|_| StoreError::Corrupt(format!("counter {key} is not numeric")))?;
                let count = count + 1;
                entry.value = count.to_string();
                if entry.expires_at.is_none() {
                    entry.expires_at = Some(now + window);
                }
                Ok(count)
            }
            _ => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(now + window),
                    },
                );
                self.note_write(&mut map, now);
                Ok(1)
            }
        }
    }
}
