//! Rate limiting.
//!
//! Fixed-window counters kept in the shared store, so every gateway replica
//! pointed at the same store enforces one limit. A burst straddling a window
//! boundary can be admitted up to twice the limit; that is a property of
//! fixed windows and is accepted here.

use crate::auth::errors::AuthError;
use crate::config::FailurePolicy;
use crate::store::{KeyValueStore, StoreResult};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const RATE_LIMIT_PREFIX: &str = "ratelimit:";

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";

/// Outcome of one `allow` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Approximated as `now + window`.
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    fn from_count(count: u64, limit: u64, window: Duration) -> Self {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
        Self {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: Utc::now() + window,
        }
    }

    /// Writes the `X-RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(self.reset_at.timestamp()));
    }

    pub fn retry_after_secs(&self) -> u64 {
        (self.reset_at - Utc::now()).num_seconds().max(0) as u64
    }
}

/// Store-backed fixed-window limiter.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Counts one request for `discriminator` and decides whether it fits
    /// within `limit` for the current window.
    pub async fn allow(
        &self,
        discriminator: &str,
        limit: u64,
        window: Duration,
    ) -> StoreResult<RateLimitDecision> {
        let key = format!("{RATE_LIMIT_PREFIX}{discriminator}");
        let count = self.store.increment_with_expiry(&key, window).await?;
        Ok(RateLimitDecision::from_count(count, limit, window))
    }
}

/// The 429 response, headers included.
pub fn rejection_response(decision: &RateLimitDecision) -> Response {
    let mut response = AuthError::RateLimited.into_response();
    decision.apply_headers(response.headers_mut());
    response
        .headers_mut()
        .insert("retry-after", HeaderValue::from(decision.retry_after_secs()));
    response
}

/// Peer address from `ConnectInfo`, or `"unknown"` when the server was not
/// started with connect info (e.g. in tests).
pub fn client_ip<B>(request: &Request<B>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Per-IP limit for routes that run before any identity exists. Counters
/// live under `auth_ip:<addr>`, apart from the pipeline's `ip:<addr>`
/// counters, so the two limits never spend each other's budget.
#[derive(Clone)]
pub struct IpRateLimit {
    pub limiter: RateLimiter,
    pub max_requests: u64,
    pub window: Duration,
    pub failure_policy: FailurePolicy,
}

/// Rate limiting middleware function.
pub async fn rate_limit_middleware(
    State(limit): State<IpRateLimit>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip(&request);
    let discriminator = format!("auth_ip:{ip}");

    match limit
        .limiter
        .allow(&discriminator, limit.max_requests, limit.window)
        .await
    {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            decision.apply_headers(response.headers_mut());
            response
        }
        Ok(decision) => {
            warn!(
                ip = %ip,
                path = %request.uri().path(),
                retry_after_secs = decision.retry_after_secs(),
                "Rate limit exceeded"
            );
            rejection_response(&decision)
        }
        Err(e) => match limit.failure_policy.absorb("rate_limit", &e) {
            Ok(()) => next.run(request).await,
            Err(err) => err.into_response(),
        },
    }
}
