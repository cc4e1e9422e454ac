//! Key/value store abstraction shared by revocation, refresh tokens,
//! API-key lookup and rate limiting.
//!
//! Every component above this layer talks to a `dyn KeyValueStore`, so the
//! request pipeline runs unchanged against [`MemoryStore`] in tests and
//! [`SqliteStore`] in a deployment. Expiry is owned by the store: entries
//! written with a TTL stop being visible once it elapses and nothing in the
//! application sweeps them.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors surfaced by a store backend.
///
/// These never reach the client verbatim; the pipeline maps them to
/// `StoreUnavailable` according to the configured failure policy.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or returned an I/O error.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A single call exceeded the per-call deadline.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be interpreted (e.g. non-numeric counter).
    #[error("corrupt value in store: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capabilities the auth core needs from its backing store.
///
/// Implementations must make every method linearizable with respect to
/// concurrent callers. `increment_with_expiry` and `take` in particular
/// must be single atomic operations, never a read followed by a write.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns true if a live (non-expired) entry exists for `key`.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Fetches the live value for `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes `value`, replacing any previous entry. `ttl = None` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Removes `key`. Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomically fetches and removes the live value for `key`.
    ///
    /// Two concurrent callers racing on the same key observe the value at
    /// most once between them.
    async fn take(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomically increments the counter at `key` and returns the new count.
    ///
    /// A missing or expired counter starts at 1 and expires `window` after
    /// that first increment. Later increments inside the window leave the
    /// expiry untouched, which is what makes the window fixed.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64>;
}

/// Wraps a store so that every call is bounded by `deadline`.
///
/// A slow backend then costs the request latency instead of hanging it.
/// The wrapped future is dropped on timeout; backends that run work on a
/// blocking pool let that work finish in the background and discard it.
pub struct TimeoutStore {
    inner: Arc<dyn KeyValueStore>,
    deadline: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, deadline_ms = self.deadline.as_millis() as u64, "Store call timed out");
                Err(StoreError::Timeout(self.deadline))
            }
        }
    }
}

#[async_trait]
impl KeyValueStore for TimeoutStore {
    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.bounded("exists", self.inner.exists(key)).await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.bounded("set", self.inner.set(key, value, ttl)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn take(&self, key: &str) -> StoreResult<Option<String>> {
        self.bounded("take", self.inner.take(key)).await
    }

    async fn increment_with_expiry(&self, key: &str, window: Duration) -> StoreResult<u64> {
        self.bounded("increment_with_expiry", self.inner.increment_with_expiry(key, window))
            .await
    }
}
