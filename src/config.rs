//! Gateway Configuration
//!
//! Defaults, then an optional TOML file, then environment variables. The
//! binary applies CLI flags last.

use crate::auth::errors::AuthError;
use crate::auth::user_store::{MAX_BCRYPT_COST, MIN_BCRYPT_COST};
use crate::store::StoreError;
use anyhow::{bail, Context, Result};
use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::error;

pub const DEV_JWT_SECRET: &str = "dev-secret-change-in-production-minimum-32-characters";
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `development` relaxes the JWT secret checks.
    pub environment: String,
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub rate_limit: RateLimitConfig,
    pub store: StoreConfig,
    pub users: UserConfig,
    pub logging: LoggingConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            server: ServerConfig::default(),
            jwt: JwtConfig::default(),
            rate_limit: RateLimitConfig::default(),
            store: StoreConfig::default(),
            users: UserConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    #[serde(with = "duration_secs")]
    pub access_token_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub refresh_token_ttl: Duration,
    /// Tolerance applied to `exp` and `nbf`.
    #[serde(with = "duration_secs")]
    pub clock_skew: Duration,
    pub api_key_header: String,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: DEV_JWT_SECRET.to_string(),
            access_token_ttl: Duration::from_secs(24 * 3600),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 3600),
            clock_skew: Duration::ZERO,
            api_key_header: "X-API-Key".to_string(),
        }
    }
}

/// What a rate-limit counter is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKey {
    Identity,
    ClientIp,
}

/// Configuration for rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Maximum requests per window on authenticated routes.
    pub max_requests: u64,
    /// Window duration.
    #[serde(with = "duration_secs")]
    pub window: Duration,
    pub key: RateLimitKey,
    /// Per-IP limit for the unauthenticated `/auth/*` endpoints.
    pub auth_max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window: Duration::from_secs(60),
            key: RateLimitKey::Identity,
            auth_max_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// What to do when the store cannot answer a revocation or rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the request with `StoreUnavailable`.
    #[default]
    FailClosed,
    /// Admit the request with the check skipped.
    FailOpen,
}

impl FailurePolicy {
    /// Applies the policy to a failed store call made by `check`.
    pub fn absorb(self, check: &'static str, err: &StoreError) -> Result<(), AuthError> {
        match self {
            FailurePolicy::FailOpen => {
                error!(check, error = %err, "Store unavailable: admitting request WITHOUT this check (fail-open)");
                Ok(())
            }
            FailurePolicy::FailClosed => {
                error!(check, error = %err, "Store unavailable: rejecting request (fail-closed)");
                Err(AuthError::StoreUnavailable)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: String,
    /// Deadline applied to every individual store call.
    pub call_timeout_ms: u64,
    pub failure_policy: FailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            sqlite_path: "streamforge_gateway_kv.db".to_string(),
            call_timeout_ms: 2000,
            failure_policy: FailurePolicy::FailClosed,
        }
    }
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub db_path: String,
    pub bcrypt_cost: u32,
    pub bootstrap_admin_email: Option<String>,
    pub bootstrap_admin_password: Option<String>,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            db_path: "streamforge_gateway_users.db".to_string(),
            bcrypt_cost: bcrypt::DEFAULT_COST,
            bootstrap_admin_email: None,
            bootstrap_admin_password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "streamforge_gateway=info,tower_http=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v, "1" | "true" | "TRUE" | "on" | "ON")
}

fn parse_enum<T: serde::de::DeserializeOwned>(v: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(v.trim().to_ascii_lowercase())).ok()
}

impl GatewayConfig {
    /// Loads defaults, the optional TOML file and the process environment,
    /// then validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                Self::from_toml_str(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse TOML configuration")
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overrides fields from `lookup`. Unparseable values are ignored and the
    /// previous value kept.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
        };
        let num = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = lookup("ENVIRONMENT") {
            self.environment = v;
        }
        if let Some(v) = lookup("SERVER_ADDRESS") {
            self.server.bind_addr = v;
        }

        if let Some(v) = lookup("JWT_SECRET") {
            self.jwt.secret = v;
        }
        if let Some(v) = secs("JWT_ACCESS_TTL_SECS") {
            self.jwt.access_token_ttl = v;
        }
        if let Some(v) = secs("JWT_REFRESH_TTL_SECS") {
            self.jwt.refresh_token_ttl = v;
        }
        if let Some(v) = secs("JWT_CLOCK_SKEW_SECS") {
            self.jwt.clock_skew = v;
        }
        if let Some(v) = lookup("API_KEY_HEADER") {
            self.jwt.api_key_header = v;
        }

        if let Some(v) = lookup("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = parse_flag(&v);
        }
        if let Some(v) = num("RATE_LIMIT_LIMIT") {
            self.rate_limit.max_requests = v;
        }
        if let Some(v) = secs("RATE_LIMIT_WINDOW_SECS") {
            self.rate_limit.window = v;
        }
        if let Some(v) = lookup("RATE_LIMIT_KEY").and_then(|v| parse_enum(&v)) {
            self.rate_limit.key = v;
        }
        if let Some(v) = num("RATE_LIMIT_AUTH_LIMIT") {
            self.rate_limit.auth_max_requests = v;
        }

        if let Some(v) = lookup("STORE_BACKEND").and_then(|v| parse_enum(&v)) {
            self.store.backend = v;
        }
        if let Some(v) = lookup("STORE_SQLITE_PATH") {
            self.store.sqlite_path = v;
        }
        if let Some(v) = num("STORE_CALL_TIMEOUT_MS") {
            self.store.call_timeout_ms = v;
        }
        if let Some(v) = lookup("STORE_FAILURE_POLICY").and_then(|v| parse_enum(&v)) {
            self.store.failure_policy = v;
        }

        if let Some(v) = lookup("AUTH_DB_PATH") {
            self.users.db_path = v;
        }
        if let Some(v) = num("BCRYPT_COST") {
            self.users.bcrypt_cost = v as u32;
        }
        if let Some(v) = lookup("ADMIN_EMAIL") {
            self.users.bootstrap_admin_email = Some(v);
        }
        if let Some(v) = lookup("ADMIN_PASSWORD") {
            self.users.bootstrap_admin_password = Some(v);
        }

        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_FORMAT").and_then(|v| parse_enum(&v)) {
            self.logging.format = v;
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn api_key_header(&self) -> Result<HeaderName> {
        HeaderName::try_from(self.jwt.api_key_header.as_str())
            .with_context(|| format!("Invalid API key header name: {}", self.jwt.api_key_header))
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt.secret.is_empty() {
            bail!("JWT secret must not be empty");
        }
        if !self.is_development() {
            if self.jwt.secret == DEV_JWT_SECRET {
                bail!("The development JWT secret cannot be used outside development");
            }
            if self.jwt.secret.len() < MIN_SECRET_LEN {
                bail!("JWT secret must be at least {MIN_SECRET_LEN} bytes");
            }
        }
        if self.jwt.access_token_ttl.is_zero() {
            bail!("Access token TTL must be positive");
        }
        if self.jwt.refresh_token_ttl.is_zero() {
            bail!("Refresh token TTL must be positive");
        }
        self.api_key_header()?;

        if self.rate_limit.enabled {
            if self.rate_limit.max_requests == 0 || self.rate_limit.auth_max_requests == 0 {
                bail!("Rate limit must be positive");
            }
            if self.rate_limit.window.is_zero() {
                bail!("Rate limit window must be positive");
            }
        }

        if self.store.call_timeout_ms == 0 {
            bail!("Store call timeout must be positive");
        }
        if !(MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(&self.users.bcrypt_cost) {
            bail!("bcrypt cost must be between {MIN_BCRYPT_COST} and {MAX_BCRYPT_COST}");
        }
        Ok(())
    }
}

// Durations are written as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
