//! Token Issuer
//! Mints signed access tokens and opaque, single-use refresh tokens.

use crate::auth::{
    jwt::ClaimsCodec,
    models::{Claims, Identity, RefreshTokenRecord},
};
use crate::store::{KeyValueStore, StoreError};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

const REFRESH_PREFIX: &str = "refresh_token:";
const REFRESH_TOKEN_BYTES: usize = 32;

/// A freshly minted credential and the instant it stops being valid.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("refresh token is unknown or already used")]
    Invalid,

    #[error("refresh token has expired")]
    Expired,

    #[error("refresh token was revoked")]
    Revoked,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct TokenIssuer {
    codec: Arc<ClaimsCodec>,
    store: Arc<dyn KeyValueStore>,
}

fn refresh_key(token: &str) -> String {
    format!("{REFRESH_PREFIX}{token}")
}

fn ttl_to_chrono(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl).context("Token TTL out of range")
}

fn usable_record(raw: &str) -> Result<RefreshTokenRecord, RefreshError> {
    let record: RefreshTokenRecord = serde_json::from_str(raw).map_err(|e| {
        warn!(error = %e, "Discarding unreadable refresh token record");
        RefreshError::Invalid
    })?;

    if record.revoked {
        return Err(RefreshError::Revoked);
    }
    if Utc::now() >= record.expires_at {
        return Err(RefreshError::Expired);
    }
    Ok(record)
}

impl TokenIssuer {
    pub fn new(codec: Arc<ClaimsCodec>, store: Arc<dyn KeyValueStore>) -> Self {
        Self { codec, store }
    }

    /// Sign an access token for `identity`, valid from now for `ttl`.
    pub fn issue_access_token(&self, identity: &Identity, ttl: Duration) -> Result<IssuedToken> {
        let now = Utc::now();
        let expires_at = now + ttl_to_chrono(ttl)?;

        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            roles: identity.roles.clone(),
            tenant_id: identity.tenant_id.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = self.codec.encode(&claims)?;
        Ok(IssuedToken {
            token,
            expires_at: DateTime::from_timestamp(claims.exp, 0).unwrap_or(expires_at),
        })
    }

    /// Generate a random opaque refresh token and persist its record.
    pub async fn issue_refresh_token(&self, user_id: &str, ttl: Duration) -> Result<IssuedToken> {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let token = URL_SAFE_NO_PAD.encode(bytes);

        let expires_at = Utc::now() + ttl_to_chrono(ttl)?;
        let record = RefreshTokenRecord {
            user_id: user_id.to_string(),
            expires_at,
            revoked: false,
        };
        let value = serde_json::to_string(&record).context("Failed to encode refresh token")?;

        self.store
            .set(&refresh_key(&token), &value, Some(ttl))
            .await
            .context("Failed to store refresh token")?;

        debug!(user_id, "Issued refresh token");
        Ok(IssuedToken { token, expires_at })
    }

    /// Looks up a refresh token without consuming it.
    pub async fn inspect_refresh_token(
        &self,
        token: &str,
    ) -> Result<RefreshTokenRecord, RefreshError> {
        let raw = self
            .store
            .get(&refresh_key(token))
            .await?
            .ok_or(RefreshError::Invalid)?;
        usable_record(&raw)
    }

    /// Consume a refresh token, returning its record.
    ///
    /// The record is removed in the same store operation that reads it, so a
    /// token can be redeemed at most once even under concurrent attempts.
    pub async fn redeem_refresh_token(
        &self,
        token: &str,
    ) -> Result<RefreshTokenRecord, RefreshError> {
        let raw = self
            .store
            .take(&refresh_key(token))
            .await?
            .ok_or(RefreshError::Invalid)?;
        usable_record(&raw)
    }

    /// Drop a refresh token without redeeming it.
    pub async fn revoke_refresh_token(&self, token: &str) -> Result<bool, StoreError> {
        self.store.delete(&refresh_key(token)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn issuer() -> (TokenIssuer, Arc<ClaimsCodec>, Arc<MemoryStore>) {
        let codec = Arc::new(ClaimsCodec::new(b"issuer-test-secret"));
        let store = Arc::new(MemoryStore::new());
        (TokenIssuer::new(codec.clone(), store.clone()), codec, store)
    }

    fn identity() -> Identity {
        Identity {
            user_id: "u-1".to_string(),
            email: "dev@example.com".to_string(),
            roles: vec!["user".to_string()],
            tenant_id: "acme".to_string(),
        }
    }

    #[test]
    fn test_access_token_claims() {
        let (issuer, codec, _) = issuer();
        let issued = issuer
            .issue_access_token(&identity(), Duration::from_secs(900))
            .unwrap();

        let claims = codec.decode(&issued.token).unwrap();
        assert_eq!(claims.iat, claims.nbf);
        assert_eq!(claims.exp - claims.iat, 900);
        assert_eq!(claims.exp, issued.expires_at.timestamp());
        assert_eq!(claims.into_identity(), identity());
    }

    #[test]
    fn test_access_tokens_are_unique() {
        let (issuer, _, _) = issuer();
        let a = issuer.issue_access_token(&identity(), Duration::from_secs(60)).unwrap();
        let b = issuer.issue_access_token(&identity(), Duration::from_secs(60)).unwrap();
        assert_ne!(a.token, b.token);
    }

    #[tokio::test]
    async fn test_refresh_token_is_opaque_and_stored() {
        let (issuer, _, store) = issuer();
        let issued = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(!issued.token.contains('.'));
        assert_eq!(URL_SAFE_NO_PAD.decode(&issued.token).unwrap().len(), REFRESH_TOKEN_BYTES);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_token_single_use() {
        let (issuer, _, _) = issuer();
        let issued = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        let record = issuer.redeem_refresh_token(&issued.token).await.unwrap();
        assert_eq!(record.user_id, "u-1");

        assert!(matches!(
            issuer.redeem_refresh_token(&issued.token).await,
            Err(RefreshError::Invalid)
        ));
    }

    #[tokio::test]
    async fn test_inspect_does_not_consume() {
        let (issuer, _, _) = issuer();
        let issued = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        for _ in 0..2 {
            let record = issuer.inspect_refresh_token(&issued.token).await.unwrap();
            assert_eq!(record.user_id, "u-1");
        }
        assert!(issuer.redeem_refresh_token(&issued.token).await.is_ok());
        assert!(matches!(
            issuer.inspect_refresh_token(&issued.token).await,
            Err(RefreshError::Invalid)
        ));
    }

    #[tokio::test]
    async fn test_rotation_chain() {
        let (issuer, _, _) = issuer();
        let first = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        issuer.redeem_refresh_token(&first.token).await.unwrap();
        let second = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(issuer.redeem_refresh_token(&first.token).await.is_err());
        assert!(issuer.redeem_refresh_token(&second.token).await.is_ok());
        assert!(issuer.redeem_refresh_token(&second.token).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redeem_admits_one() {
        let (issuer, _, _) = issuer();
        let issuer = Arc::new(issuer);
        let issued = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let issuer = issuer.clone();
            let token = issued.token.clone();
            handles.push(tokio::spawn(async move {
                issuer.redeem_refresh_token(&token).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_cannot_be_redeemed() {
        let (issuer, _, _) = issuer();
        let issued = issuer
            .issue_refresh_token("u-1", Duration::from_secs(60))
            .await
            .unwrap();

        assert!(issuer.revoke_refresh_token(&issued.token).await.unwrap());
        assert!(matches!(
            issuer.redeem_refresh_token(&issued.token).await,
            Err(RefreshError::Invalid)
        ));
    }
}
