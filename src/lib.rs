//! StreamForge API Gateway
//!
//! Authentication, authorization and admission control for the gateway:
//! bearer tokens and API keys, token revocation, role/tenant gating and a
//! store-backed fixed-window rate limiter, assembled into an axum router.

pub mod auth;
pub mod config;
pub mod middleware;
pub mod server;
pub mod store;

pub use config::GatewayConfig;
pub use server::{build_router, GatewayContext};
