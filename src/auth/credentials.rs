//! API-key lookup.

use crate::auth::{
    errors::AuthError,
    models::{ApiKeyRecord, Identity},
};
use crate::store::{KeyValueStore, StoreError, StoreResult};
use chrono::Utc;
use std::sync::Arc;
use tracing::error;

const API_KEY_PREFIX: &str = "api_key:";

/// Read-only view over externally provisioned API keys.
///
/// Keys are invalidated by deleting their record; there is no revocation
/// list for them.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(api_key: &str) -> String {
        format!("{API_KEY_PREFIX}{api_key}")
    }

    /// Resolves `api_key` to the identity it was provisioned for.
    ///
    /// Store failures always reject: without the record there is no identity
    /// to admit, whatever the failure policy.
    pub async fn lookup(&self, api_key: &str) -> Result<Identity, AuthError> {
        let raw = match self.store.get(&Self::key(api_key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Err(AuthError::InvalidCredential),
            Err(e) => {
                error!(error = %e, "API key lookup failed");
                return Err(AuthError::StoreUnavailable);
            }
        };

        let record: ApiKeyRecord = serde_json::from_str(&raw).map_err(|e| {
            error!(error = %e, "API key record is unreadable");
            AuthError::StoreUnavailable
        })?;

        if let Some(expires_at) = record.expires_at {
            if Utc::now() > expires_at {
                return Err(AuthError::Expired);
            }
        }

        Ok(record.identity())
    }

    /// Writes an API-key record. Used by provisioning tooling and tests.
    pub async fn provision(&self, record: &ApiKeyRecord) -> StoreResult<()> {
        let value =
            serde_json::to_string(record).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.store.set(&Self::key(&record.key), &value, None).await
    }
}
