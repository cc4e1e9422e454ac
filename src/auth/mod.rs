//! Authentication Module
//! Token issuance and validation, API keys, revocation, role/tenant gating
//! and the per-request admission pipeline.

pub mod api;
pub mod credentials;
pub mod errors;
pub mod gate;
pub mod issuer;
pub mod jwt;
pub mod middleware;
pub mod models;
pub mod revocation;
pub mod user_store;
pub mod validator;

pub use api::AuthState;
pub use credentials::CredentialStore;
pub use errors::AuthError;
pub use gate::{AuthorizationGate, RouteRequirements};
pub use issuer::TokenIssuer;
pub use jwt::ClaimsCodec;
pub use middleware::{require_auth, AuthPipeline, Credential, RouteGuard};
pub use models::Identity;
pub use revocation::RevocationStore;
pub use user_store::UserStore;
pub use validator::TokenValidator;
