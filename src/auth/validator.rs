//! Token Validator
//! Turns a presented bearer token into an [`Identity`]: signature, then
//! timestamps, then the revocation list.

use crate::auth::{
    errors::AuthError,
    jwt::ClaimsCodec,
    models::{Claims, Identity},
    revocation::RevocationStore,
};
use crate::config::FailurePolicy;
use crate::store::StoreResult;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct TokenValidator {
    codec: Arc<ClaimsCodec>,
    revocations: RevocationStore,
    leeway: i64,
    failure_policy: FailurePolicy,
}

impl TokenValidator {
    pub fn new(
        codec: Arc<ClaimsCodec>,
        revocations: RevocationStore,
        clock_skew: Duration,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            codec,
            revocations,
            leeway: clock_skew.as_secs() as i64,
            failure_policy,
        }
    }

    /// Signature and timestamp checks only. No store access.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.codec.decode(token)?;
        check_timestamps(&claims, Utc::now().timestamp(), self.leeway)?;
        Ok(claims)
    }

    /// Fails with `Revoked` if `token` is blacklisted. A store failure is
    /// resolved by the failure policy.
    pub async fn check_revocation(&self, token: &str) -> Result<(), AuthError> {
        match self.revocations.is_revoked(token).await {
            Ok(true) => Err(AuthError::Revoked),
            Ok(false) => Ok(()),
            Err(e) => self.failure_policy.absorb("revocation", &e),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.verify(token)?;
        self.check_revocation(token).await?;
        Ok(claims.into_identity())
    }

    /// Blacklists `token` until `exp + leeway`, the last instant `verify`
    /// would still accept it.
    pub async fn revoke(&self, token: &str, claims: &Claims) -> StoreResult<bool> {
        let horizon = claims.exp.saturating_add(self.leeway);
        let until = DateTime::<Utc>::from_timestamp(horizon, 0).unwrap_or_else(Utc::now);
        self.revocations.revoke(token, until).await
    }
}

/// Valid while `nbf - leeway <= now < exp + leeway`.
pub fn check_timestamps(claims: &Claims, now: i64, leeway: i64) -> Result<(), AuthError> {
    if now >= claims.exp.saturating_add(leeway) {
        return Err(AuthError::Expired);
    }
    if now.saturating_add(leeway) < claims.nbf {
        return Err(AuthError::NotYetValid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::issuer::TokenIssuer;
    use crate::store::{KeyValueStore, MemoryStore, StoreError, StoreResult};
    use async_trait::async_trait;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

    struct DownStore;

    #[async_trait]
    impl KeyValueStore for DownStore {
        async fn exists(&self, _key: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _key: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn take(&self, _key: &str) -> StoreResult<Option<String>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn increment_with_expiry(&self, _key: &str, _window: Duration) -> StoreResult<u64> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn identity() -> Identity {
        Identity {
            user_id: "u-1".to_string(),
            email: "dev@example.com".to_string(),
            roles: vec!["user".to_string(), "admin".to_string()],
            tenant_id: "acme".to_string(),
        }
    }

    fn setup(
        store: Arc<dyn KeyValueStore>,
        policy: FailurePolicy,
    ) -> (TokenIssuer, TokenValidator, RevocationStore) {
        setup_with_skew(store, policy, Duration::ZERO)
    }

    fn setup_with_skew(
        store: Arc<dyn KeyValueStore>,
        policy: FailurePolicy,
        skew: Duration,
    ) -> (TokenIssuer, TokenValidator, RevocationStore) {
        let codec = Arc::new(ClaimsCodec::new(b"validator-test-secret"));
        let revocations = RevocationStore::new(store.clone());
        let issuer = TokenIssuer::new(codec.clone(), store);
        let validator = TokenValidator::new(codec, revocations.clone(), skew, policy);
        (issuer, validator, revocations)
    }

    fn claims_at(nbf: i64, exp: i64) -> Claims {
        Claims {
            sub: "u".to_string(),
            email: "e@x.io".to_string(),
            roles: vec![],
            tenant_id: String::new(),
            iat: nbf,
            nbf,
            exp,
            jti: "j".to_string(),
        }
    }

    #[tokio::test]
    async fn test_issued_token_validates_to_same_identity() {
        let (issuer, validator, _) = setup(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        let issued = issuer.issue_access_token(&identity(), Duration::from_secs(60)).unwrap();

        assert_eq!(validator.validate(&issued.token).await.unwrap(), identity());
    }

    #[test]
    fn test_expiry_boundary() {
        let now = 1_700_000_000;
        assert_eq!(
            check_timestamps(&claims_at(now - 60, now - 1), now, 0),
            Err(AuthError::Expired)
        );
        assert_eq!(check_timestamps(&claims_at(now - 60, now), now, 0), Err(AuthError::Expired));
        assert_eq!(check_timestamps(&claims_at(now - 60, now + 1), now, 0), Ok(()));
    }

    #[test]
    fn test_not_before_boundary() {
        let now = 1_700_000_000;
        assert_eq!(check_timestamps(&claims_at(now, now + 60), now, 0), Ok(()));
        assert_eq!(
            check_timestamps(&claims_at(now + 1, now + 60), now, 0),
            Err(AuthError::NotYetValid)
        );
    }

    #[test]
    fn test_clock_skew_is_bounded() {
        let now = 1_700_000_000;
        assert_eq!(check_timestamps(&claims_at(now - 60, now - 1), now, 5), Ok(()));
        assert_eq!(
            check_timestamps(&claims_at(now - 60, now - 5), now, 5),
            Err(AuthError::Expired)
        );
        assert_eq!(check_timestamps(&claims_at(now + 5, now + 60), now, 5), Ok(()));
        assert_eq!(
            check_timestamps(&claims_at(now + 6, now + 60), now, 5),
            Err(AuthError::NotYetValid)
        );
    }

    #[tokio::test]
    async fn test_revoked_token_stays_rejected() {
        let (issuer, validator, revocations) =
            setup(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        let issued = issuer.issue_access_token(&identity(), Duration::from_secs(60)).unwrap();

        revocations.revoke(&issued.token, issued.expires_at).await.unwrap();

        for _ in 0..3 {
            assert_eq!(validator.validate(&issued.token).await, Err(AuthError::Revoked));
        }
    }

    #[tokio::test]
    async fn test_revocation_outlives_clock_skew() {
        let (issuer, validator, _) = setup_with_skew(
            Arc::new(MemoryStore::new()),
            FailurePolicy::FailClosed,
            Duration::from_secs(5),
        );
        let issued = issuer.issue_access_token(&identity(), Duration::from_secs(1)).unwrap();
        let claims = validator.verify(&issued.token).unwrap();

        assert!(validator.revoke(&issued.token, &claims).await.unwrap());
        assert_eq!(validator.validate(&issued.token).await, Err(AuthError::Revoked));

        // Past `exp` but still inside the skew window: the signature and
        // timestamps pass, so only the blacklist keeps the token out.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(validator.verify(&issued.token).is_ok());
        assert_eq!(validator.validate(&issued.token).await, Err(AuthError::Revoked));
    }

    #[tokio::test]
    async fn test_revoke_skips_token_past_its_horizon() {
        let store = Arc::new(MemoryStore::new());
        let (_, validator, _) = setup(store.clone(), FailurePolicy::FailClosed);
        let now = Utc::now().timestamp();

        let claims = claims_at(now - 60, now - 1);
        assert!(!validator.revoke("stale", &claims).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_tampered_token_is_bad_signature() {
        let (issuer, validator, _) = setup(Arc::new(MemoryStore::new()), FailurePolicy::FailClosed);
        let issued = issuer.issue_access_token(&identity(), Duration::from_secs(60)).unwrap();

        let mut parts: Vec<String> = issued.token.split('.').map(String::from).collect();
        let forged = Claims {
            roles: vec!["superuser".to_string()],
            ..validator.verify(&issued.token).unwrap()
        };
        parts[1] = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged).unwrap());
        let tampered = parts.join(".");

        assert_eq!(validator.validate(&tampered).await, Err(AuthError::BadSignature));
    }

    #[tokio::test]
    async fn test_store_outage_follows_policy() {
        let store: Arc<dyn KeyValueStore> = Arc::new(DownStore);

        let (issuer, closed, _) = setup(store.clone(), FailurePolicy::FailClosed);
        let issued = issuer.issue_access_token(&identity(), Duration::from_secs(60)).unwrap();
        assert_eq!(closed.validate(&issued.token).await, Err(AuthError::StoreUnavailable));

        let (_, open, _) = setup(store, FailurePolicy::FailOpen);
        assert_eq!(open.validate(&issued.token).await.unwrap(), identity());
    }
}
