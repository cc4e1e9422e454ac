//! Authentication API Endpoints
//! Login, registration, refresh-token rotation, logout and `/auth/me`.

use crate::auth::{
    issuer::{RefreshError, TokenIssuer},
    middleware::Credential,
    models::{
        AuthResponse, Identity, LoginRequest, LogoutRequest, RefreshRequest, RegisterRequest,
        User, UserResponse,
    },
    user_store::{NewUser, UserStore, UserStoreError, UserStoreResult},
    validator::TokenValidator,
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const MIN_PASSWORD_LEN: usize = 6;

/// Shared auth state
#[derive(Clone)]
pub struct AuthState {
    pub user_store: Arc<UserStore>,
    pub issuer: Arc<TokenIssuer>,
    pub validator: TokenValidator,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

/// Runs a user-store call on the blocking pool; bcrypt and SQLite both block.
async fn blocking<T, F>(f: F) -> Result<T, AuthApiError>
where
    T: Send + 'static,
    F: FnOnce() -> UserStoreResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(UserStoreError::AlreadyExists(_))) => Err(AuthApiError::UserAlreadyExists),
        Ok(Err(e)) => {
            error!(error = %e, "User store failure");
            Err(AuthApiError::InternalError)
        }
        Err(e) => {
            error!(error = %e, "User store task panicked");
            Err(AuthApiError::InternalError)
        }
    }
}

async fn issue_pair(state: &AuthState, user: &User) -> Result<AuthResponse, AuthApiError> {
    let access = state
        .issuer
        .issue_access_token(&user.identity(), state.access_ttl)
        .map_err(|e| {
            error!(error = %e, "Failed to issue access token");
            AuthApiError::InternalError
        })?;
    let refresh = state
        .issuer
        .issue_refresh_token(&user.id.to_string(), state.refresh_ttl)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to issue refresh token");
            AuthApiError::InternalError
        })?;

    Ok(AuthResponse {
        access_token: access.token,
        refresh_token: refresh.token,
        expires_at: access.expires_at,
        refresh_expires_at: refresh.expires_at,
        user: UserResponse::from_user(user),
    })
}

fn validate_registration(payload: &RegisterRequest) -> Result<(), AuthApiError> {
    if !payload.email.contains('@') {
        return Err(AuthApiError::BadRequest("A valid email address is required".into()));
    }
    if payload.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthApiError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if payload.name.trim().is_empty() {
        return Err(AuthApiError::BadRequest("Name is required".into()));
    }
    Ok(())
}

/// Login endpoint - POST /auth/login
pub async fn login(
    State(state): State<AuthState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AuthApiError> {
    let Json(payload) = payload?;

    let store = state.user_store.clone();
    let email = payload.email.clone();
    let user = blocking(move || store.verify_password(&email, &payload.password)).await?;

    let Some(user) = user else {
        warn!("Failed login attempt");
        return Err(AuthApiError::InvalidCredentials);
    };

    let response = issue_pair(&state, &user).await?;
    info!(user_id = %user.id, "Login successful");
    Ok(Json(response))
}

/// Register endpoint - POST /auth/register
pub async fn register(
    State(state): State<AuthState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AuthResponse>), AuthApiError> {
    let Json(payload) = payload?;
    validate_registration(&payload)?;

    let roles = match payload.roles {
        Some(roles) if !roles.is_empty() => roles,
        _ => vec!["user".to_string()],
    };
    let tenant_id = payload.tenant_id.unwrap_or_default();

    let store = state.user_store.clone();
    let user = blocking(move || {
        store.create_user(NewUser {
            email: &payload.email,
            password: &payload.password,
            name: &payload.name,
            roles: &roles,
            tenant_id: &tenant_id,
        })
    })
    .await?;

    let response = issue_pair(&state, &user).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

fn refresh_rejection(e: RefreshError) -> AuthApiError {
    match e {
        RefreshError::Store(e) => {
            error!(error = %e, "Refresh token store failure");
            AuthApiError::InternalError
        }
        other => {
            warn!(reason = %other, "Refresh rejected");
            AuthApiError::InvalidRefreshToken
        }
    }
}

/// Refresh endpoint - POST /auth/refresh
///
/// The replacement pair is written before the presented token is consumed,
/// so a failure part-way leaves the old token usable. Consumption is the
/// atomic step: of several concurrent refreshes with the same token only
/// one keeps its replacement.
pub async fn refresh(
    State(state): State<AuthState>,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<AuthResponse>, AuthApiError> {
    let Json(payload) = payload?;

    let record = state
        .issuer
        .inspect_refresh_token(&payload.refresh_token)
        .await
        .map_err(refresh_rejection)?;

    // Reload so role and tenant changes reach the new access token.
    let store = state.user_store.clone();
    let user_id = record.user_id.clone();
    let user = blocking(move || store.get_user_by_id(&user_id))
        .await?
        .ok_or(AuthApiError::InvalidRefreshToken)?;

    let response = issue_pair(&state, &user).await?;

    if let Err(e) = state.issuer.redeem_refresh_token(&payload.refresh_token).await {
        if let Err(cleanup) = state.issuer.revoke_refresh_token(&response.refresh_token).await {
            error!(error = %cleanup, user_id = %user.id, "Failed to discard unused refresh token");
        }
        return Err(refresh_rejection(e));
    }

    Ok(Json(response))
}

/// Logout endpoint - POST /auth/logout (bearer token required)
pub async fn logout(
    State(state): State<AuthState>,
    Extension(credential): Extension<Credential>,
    body: Option<Json<LogoutRequest>>,
) -> Result<Json<serde_json::Value>, AuthApiError> {
    let Credential::Bearer(token) = credential else {
        return Err(AuthApiError::BearerRequired);
    };

    // Already admitted by the pipeline, so this only recovers `exp`.
    let claims = state
        .validator
        .verify(&token)
        .map_err(|_| AuthApiError::InvalidCredentials)?;

    state.validator.revoke(&token, &claims).await.map_err(|e| {
        error!(error = %e, "Failed to revoke access token");
        AuthApiError::InternalError
    })?;

    if let Some(Json(LogoutRequest {
        refresh_token: Some(refresh_token),
    })) = body
    {
        state
            .issuer
            .revoke_refresh_token(&refresh_token)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to revoke refresh token");
                AuthApiError::InternalError
            })?;
    }

    info!(user_id = %claims.sub, "Logged out");
    Ok(Json(json!({ "message": "Logged out successfully" })))
}

/// Get current user info - GET /auth/me
pub async fn me(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}

/// Auth API errors
#[derive(Debug)]
pub enum AuthApiError {
    BadRequest(String),
    InvalidCredentials,
    InvalidRefreshToken,
    BearerRequired,
    UserAlreadyExists,
    InternalError,
}

impl From<JsonRejection> for AuthApiError {
    fn from(rejection: JsonRejection) -> Self {
        AuthApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AuthApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AuthApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            AuthApiError::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                "Invalid email or password".to_string(),
            ),
            AuthApiError::InvalidRefreshToken => (
                StatusCode::UNAUTHORIZED,
                "invalid_refresh_token",
                "Invalid or expired refresh token".to_string(),
            ),
            AuthApiError::BearerRequired => (
                StatusCode::BAD_REQUEST,
                "bearer_required",
                "Logout requires a bearer token".to_string(),
            ),
            AuthApiError::UserAlreadyExists => (
                StatusCode::CONFLICT,
                "user_exists",
                "User already exists".to_string(),
            ),
            AuthApiError::InternalError => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "error": code, "message": message }))).into_response()
    }
}
