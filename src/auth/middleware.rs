//! Authentication Middleware
//! Runs every protected request through credential resolution, revocation,
//! authorization and rate limiting, in that order, and stops at the first
//! failing stage.

use crate::auth::{
    credentials::CredentialStore,
    errors::AuthError,
    gate::RouteRequirements,
    models::Identity,
    validator::TokenValidator,
};
use crate::config::{FailurePolicy, RateLimitKey};
use crate::middleware::rate_limit::{client_ip, rejection_response, RateLimitDecision, RateLimiter};
use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderName},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The credential a request presented. Resolved once per request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    ApiKey(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credential::ApiKey(_) => f.write_str("ApiKey(<redacted>)"),
        }
    }
}

impl Credential {
    /// `Authorization` wins when both headers are sent. A present but
    /// ill-formed `Authorization` header is `Malformed`, not a fallback to
    /// the API key.
    pub fn from_headers(headers: &HeaderMap, api_key_header: &HeaderName) -> Result<Self, AuthError> {
        if let Some(value) = headers.get(AUTHORIZATION) {
            let value = value.to_str().map_err(|_| AuthError::Malformed)?;
            let mut parts = value.split(' ');
            return match (parts.next(), parts.next(), parts.next()) {
                (Some("Bearer"), Some(token), None) if !token.is_empty() => {
                    Ok(Credential::Bearer(token.to_string()))
                }
                _ => Err(AuthError::Malformed),
            };
        }

        match headers.get(api_key_header).map(|v| v.to_str()) {
            Some(Ok(key)) if !key.is_empty() => Ok(Credential::ApiKey(key.to_string())),
            Some(Err(_)) => Err(AuthError::InvalidCredential),
            _ => Err(AuthError::MissingCredential),
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "bearer",
            Credential::ApiKey(_) => "api_key",
        }
    }
}

/// Admission stages in the order a request must pass them. A request
/// starts unauthenticated and is admitted once it has passed every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    CredentialResolved,
    RevocationChecked,
    AuthorizationChecked,
    RateLimited,
    Admitted,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::CredentialResolved => "credential_resolved",
            Stage::RevocationChecked => "revocation_checked",
            Stage::AuthorizationChecked => "authorization_checked",
            Stage::RateLimited => "rate_limited",
            Stage::Admitted => "admitted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Admission {
    pub identity: Identity,
    pub credential: Credential,
    pub rate_limit: Option<RateLimitDecision>,
}

/// Terminal rejection. `stage` is the stage the request failed to pass.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub stage: Stage,
    pub error: AuthError,
    pub rate_limit: Option<RateLimitDecision>,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        match (self.error, self.rate_limit) {
            (AuthError::RateLimited, Some(decision)) => rejection_response(&decision),
            (error, _) => error.into_response(),
        }
    }
}

/// Per-route rate-limit settings.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub max_requests: u64,
    pub window: Duration,
    pub key: RateLimitKey,
}

pub struct AuthPipeline {
    validator: TokenValidator,
    credentials: CredentialStore,
    limiter: RateLimiter,
    api_key_header: HeaderName,
    rate_limit: Option<RateLimitPolicy>,
    failure_policy: FailurePolicy,
}

impl AuthPipeline {
    pub fn new(
        validator: TokenValidator,
        credentials: CredentialStore,
        limiter: RateLimiter,
        api_key_header: HeaderName,
        rate_limit: Option<RateLimitPolicy>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            validator,
            credentials,
            limiter,
            api_key_header,
            rate_limit,
            failure_policy,
        }
    }

    pub async fn admit(
        &self,
        headers: &HeaderMap,
        client_ip: &str,
        requirements: &RouteRequirements,
    ) -> Result<Admission, Rejection> {
        let reject = |stage, error| Rejection {
            stage,
            error,
            rate_limit: None,
        };

        let credential = Credential::from_headers(headers, &self.api_key_header)
            .map_err(|e| reject(Stage::CredentialResolved, e))?;

        let identity = match &credential {
            Credential::Bearer(token) => {
                let claims = self
                    .validator
                    .verify(token)
                    .map_err(|e| reject(Stage::CredentialResolved, e))?;
                self.validator
                    .check_revocation(token)
                    .await
                    .map_err(|e| reject(Stage::RevocationChecked, e))?;
                claims.into_identity()
            }
            // API keys have no revocation list; deleting the record revokes.
            Credential::ApiKey(key) => self
                .credentials
                .lookup(key)
                .await
                .map_err(|e| reject(Stage::CredentialResolved, e))?,
        };

        requirements
            .check(&identity)
            .map_err(|e| reject(Stage::AuthorizationChecked, e))?;

        let rate_limit = match self.rate_limit {
            Some(policy) => self.check_rate_limit(&policy, &identity, client_ip).await?,
            None => None,
        };

        Ok(Admission {
            identity,
            credential,
            rate_limit,
        })
    }

    async fn check_rate_limit(
        &self,
        policy: &RateLimitPolicy,
        identity: &Identity,
        client_ip: &str,
    ) -> Result<Option<RateLimitDecision>, Rejection> {
        let discriminator = match policy.key {
            RateLimitKey::Identity => format!("user:{}", identity.user_id),
            RateLimitKey::ClientIp => format!("ip:{client_ip}"),
        };

        match self
            .limiter
            .allow(&discriminator, policy.max_requests, policy.window)
            .await
        {
            Ok(decision) if decision.allowed => Ok(Some(decision)),
            Ok(decision) => Err(Rejection {
                stage: Stage::RateLimited,
                error: AuthError::RateLimited,
                rate_limit: Some(decision),
            }),
            Err(e) => match self.failure_policy.absorb("rate_limit", &e) {
                Ok(()) => Ok(None),
                Err(error) => Err(Rejection {
                    stage: Stage::RateLimited,
                    error,
                    rate_limit: None,
                }),
            },
        }
    }
}

/// Middleware state: the shared pipeline plus what one route group demands.
#[derive(Clone)]
pub struct RouteGuard {
    pipeline: Arc<AuthPipeline>,
    requirements: Arc<RouteRequirements>,
}

impl RouteGuard {
    pub fn new(pipeline: Arc<AuthPipeline>, requirements: RouteRequirements) -> Self {
        Self {
            pipeline,
            requirements: Arc::new(requirements),
        }
    }
}

/// Auth middleware. On success the handler sees [`Identity`] and
/// [`Credential`] in the request extensions.
pub async fn require_auth(State(guard): State<RouteGuard>, mut req: Request, next: Next) -> Response {
    let ip = client_ip(&req);

    match guard
        .pipeline
        .admit(req.headers(), &ip, &guard.requirements)
        .await
    {
        Ok(admission) => {
            debug!(
                user_id = %admission.identity.user_id,
                scheme = admission.credential.scheme(),
                stage = Stage::Admitted.as_str(),
                "Request admitted"
            );
            req.extensions_mut().insert(admission.identity);
            req.extensions_mut().insert(admission.credential);

            let mut response = next.run(req).await;
            if let Some(decision) = admission.rate_limit {
                decision.apply_headers(response.headers_mut());
            }
            response
        }
        Err(rejection) => {
            warn!(
                stage = rejection.stage.as_str(),
                reason = rejection.error.code(),
                path = %req.uri().path(),
                client_ip = %ip,
                "Request rejected"
            );
            rejection.into_response()
        }
    }
}
