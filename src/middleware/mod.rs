//! Middleware for observability and rate limiting.
//!
//! This module provides:
//! - Request ids and request logging with latency tracking
//! - The store-backed fixed-window rate limiter

pub mod logging;
pub mod rate_limit;

pub use logging::{request_id, request_logging, RequestId};
pub use rate_limit::{rate_limit_middleware, IpRateLimit, RateLimitDecision, RateLimiter};
