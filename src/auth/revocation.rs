//! Access-token blacklist.

use crate::store::{KeyValueStore, StoreResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

const BLACKLIST_PREFIX: &str = "blacklist:token:";

/// Blacklist of access tokens revoked before their natural expiry.
///
/// Entries carry a TTL that runs to the instant passed to [`revoke`], so the
/// store drops them once the token would have stopped validating anyway.
/// Callers pass the token's acceptance horizon including any clock skew.
///
/// [`revoke`]: RevocationStore::revoke
#[derive(Clone)]
pub struct RevocationStore {
    store: Arc<dyn KeyValueStore>,
}

impl RevocationStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(token: &str) -> String {
        format!("{BLACKLIST_PREFIX}{token}")
    }

    /// Revokes `token` until `until`.
    ///
    /// Returns `false` without writing when `until` has already passed.
    pub async fn revoke(&self, token: &str, until: DateTime<Utc>) -> StoreResult<bool> {
        let remaining = match (until - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => {
                debug!("Skipping revocation of an already expired token");
                return Ok(false);
            }
        };

        self.store
            .set(&Self::key(token), "revoked", Some(remaining))
            .await?;
        Ok(true)
    }

    pub async fn is_revoked(&self, token: &str) -> StoreResult<bool> {
        self.store.exists(&Self::key(token)).await
    }
}
