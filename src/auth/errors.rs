//! Rejection taxonomy for the request pipeline.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a request was refused. Every variant is terminal for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no bearer token or API key was presented")]
    MissingCredential,

    #[error("token could not be parsed")]
    Malformed,

    #[error("token signature does not verify")]
    BadSignature,

    #[error("credential has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("token has been revoked")]
    Revoked,

    #[error("API key is not recognised")]
    InvalidCredential,

    #[error("caller lacks the role or tenant required by this route")]
    Forbidden,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("credential store is unavailable")]
    StoreUnavailable,
}

impl AuthError {
    /// Machine-readable code sent in the `error` field.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => "missing_credential",
            AuthError::Malformed => "malformed_token",
            AuthError::BadSignature => "bad_signature",
            AuthError::Expired => "expired",
            AuthError::NotYetValid => "not_yet_valid",
            AuthError::Revoked => "revoked",
            AuthError::InvalidCredential => "invalid_credential",
            AuthError::Forbidden => "forbidden",
            AuthError::RateLimited => "rate_limit_exceeded",
            AuthError::StoreUnavailable => "store_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::MissingCredential
            | AuthError::Malformed
            | AuthError::BadSignature
            | AuthError::Expired
            | AuthError::NotYetValid
            | AuthError::Revoked
            | AuthError::InvalidCredential => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::StoreUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &'static str {
        match self {
            AuthError::MissingCredential => {
                "Authorization header (Bearer <token>) or API key required"
            }
            AuthError::Malformed | AuthError::BadSignature => "Invalid token",
            AuthError::Expired => "Credential has expired",
            AuthError::NotYetValid => "Token is not valid yet",
            AuthError::Revoked => "Token has been revoked",
            AuthError::InvalidCredential => "Invalid API key",
            AuthError::Forbidden => "Insufficient permissions",
            AuthError::RateLimited => "Too many requests. Please slow down.",
            AuthError::StoreUnavailable => "Authentication service error",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.code(),
            "message": self.message(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_statuses() {
        assert_eq!(AuthError::MissingCredential.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::BadSignature.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Revoked.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Forbidden.into_response().status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::RateLimited.into_response().status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            AuthError::StoreUnavailable.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            AuthError::MissingCredential,
            AuthError::Malformed,
            AuthError::BadSignature,
            AuthError::Expired,
            AuthError::NotYetValid,
            AuthError::Revoked,
            AuthError::InvalidCredential,
            AuthError::Forbidden,
            AuthError::RateLimited,
            AuthError::StoreUnavailable,
        ];
        let mut codes: Vec<_> = all.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }
}
