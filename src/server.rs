//! Router assembly.
//!
//! All store-backed components are built once here from an explicitly passed
//! store handle and shared by reference; nothing is process-global.

use crate::auth::{
    api as auth_api,
    middleware::{require_auth, AuthPipeline, RateLimitPolicy, RouteGuard},
    AuthState, ClaimsCodec, CredentialStore, RevocationStore, RouteRequirements, TokenIssuer,
    TokenValidator, UserStore,
};
use crate::config::GatewayConfig;
use crate::middleware::{
    rate_limit_middleware, request_id, request_logging, IpRateLimit, RateLimiter,
};
use crate::store::KeyValueStore;
use anyhow::Result;
use axum::{
    http::{StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer};
use tracing::error;

pub const SERVICE_NAME: &str = "streamforge-api-gateway";

/// Everything the router needs, wired from one store handle.
#[derive(Clone)]
pub struct GatewayContext {
    pub auth: AuthState,
    pub credentials: CredentialStore,
    pub pipeline: Arc<AuthPipeline>,
    pub ip_limit: Option<IpRateLimit>,
}

impl GatewayContext {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KeyValueStore>,
        user_store: Arc<UserStore>,
    ) -> Result<Self> {
        let policy = config.store.failure_policy;
        let codec = Arc::new(ClaimsCodec::new(config.jwt.secret.as_bytes()));
        let revocations = RevocationStore::new(store.clone());
        let validator = TokenValidator::new(
            codec.clone(),
            revocations,
            config.jwt.clock_skew,
            policy,
        );
        let credentials = CredentialStore::new(store.clone());
        let limiter = RateLimiter::new(store.clone());

        let rate_limit = config.rate_limit.enabled.then(|| RateLimitPolicy {
            max_requests: config.rate_limit.max_requests,
            window: config.rate_limit.window,
            key: config.rate_limit.key,
        });
        let ip_limit = config.rate_limit.enabled.then(|| IpRateLimit {
            limiter: limiter.clone(),
            max_requests: config.rate_limit.auth_max_requests,
            window: config.rate_limit.window,
            failure_policy: policy,
        });

        let pipeline = Arc::new(AuthPipeline::new(
            validator.clone(),
            credentials.clone(),
            limiter,
            config.api_key_header()?,
            rate_limit,
            policy,
        ));

        let auth = AuthState {
            user_store,
            issuer: Arc::new(TokenIssuer::new(codec, store)),
            validator,
            access_ttl: config.jwt.access_token_ttl,
            refresh_ttl: config.jwt.refresh_token_ttl,
        };

        Ok(Self {
            auth,
            credentials,
            pipeline,
            ip_limit,
        })
    }

    pub fn guard(&self, requirements: RouteRequirements) -> RouteGuard {
        RouteGuard::new(self.pipeline.clone(), requirements)
    }

    /// Puts every route of `router` behind the auth pipeline.
    pub fn protect<S>(&self, router: Router<S>, requirements: RouteRequirements) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(middleware::from_fn_with_state(
            self.guard(requirements),
            require_auth,
        ))
    }
}

/// Health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "message": "The requested resource was not found",
            "path": uri.path(),
        })),
    )
}

fn panic_response(_panic: Box<dyn Any + Send + 'static>) -> Response {
    error!("Handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "internal_error",
            "message": "Internal server error",
        })),
    )
        .into_response()
}

/// Identity echo routes: one per kind of route requirement.
pub fn identity_routes(ctx: &GatewayContext) -> Router {
    let authenticated = ctx.protect(
        Router::new().route("/api/v1/whoami", get(auth_api::me)),
        RouteRequirements::authenticated(),
    );
    let admin = ctx.protect(
        Router::new().route("/api/v1/admin/whoami", get(auth_api::me)),
        RouteRequirements::any_role(["admin"]),
    );
    let tenant = ctx.protect(
        Router::new().route("/api/v1/tenant/whoami", get(auth_api::me)),
        RouteRequirements::authenticated().with_tenant(),
    );

    Router::new().merge(authenticated).merge(admin).merge(tenant)
}

/// Builds the full application: auth endpoints, health, `downstream` (routes
/// that are expected to be wrapped with [`GatewayContext::protect`]) and the
/// cross-cutting layers.
pub fn build_router(ctx: &GatewayContext, downstream: Router) -> Router {
    let mut public_auth = Router::new()
        .route("/auth/login", post(auth_api::login))
        .route("/auth/register", post(auth_api::register))
        .route("/auth/refresh", post(auth_api::refresh));
    if let Some(ip_limit) = ctx.ip_limit.clone() {
        public_auth =
            public_auth.route_layer(middleware::from_fn_with_state(ip_limit, rate_limit_middleware));
    }

    let session = ctx.protect(
        Router::new()
            .route("/auth/logout", post(auth_api::logout))
            .route("/auth/me", get(auth_api::me)),
        RouteRequirements::authenticated(),
    );

    let auth_router = public_auth.merge(session).with_state(ctx.auth.clone());

    Router::new()
        .route("/health", get(health_check))
        .merge(auth_router)
        .merge(downstream)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn(request_logging))
        .layer(middleware::from_fn(request_id))
        .layer(CorsLayer::permissive())
}
