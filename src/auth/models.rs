//! Authentication Models
//! Identity, token claims, stored credential records and the JSON bodies of
//! the `/auth/*` endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resolved caller identity. Lives for one request; attached to the request
/// extensions by the auth pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub roles: Vec<String>,
    pub tenant_id: String,
}

impl Identity {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// JWT Claims payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub email: String,
    pub roles: Vec<String>,
    #[serde(default)]
    pub tenant_id: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String, // unique per token, so two tokens minted in the same second differ
}

impl Claims {
    pub fn into_identity(self) -> Identity {
        Identity {
            user_id: self.sub,
            email: self.email,
            roles: self.roles,
            tenant_id: self.tenant_id,
        }
    }
}

/// Stored under `refresh_token:<token>`. The token string itself is the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

/// Externally provisioned API key, stored under `api_key:<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id.clone(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

/// User account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // bcrypt hash - never serialize
    pub roles: Vec<String>,
    pub tenant_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.id.to_string(),
            email: self.email.clone(),
            roles: self.roles.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

/// Login request body
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Register request body
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Optional logout body; lets the client drop its refresh token too.
#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Token envelope returned by login, register and refresh.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>, // access token expiry
    pub refresh_expires_at: DateTime<Utc>,
    pub user: UserResponse,
}

/// User response (sanitized)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub roles: Vec<String>,
    pub tenant_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl UserResponse {
    pub fn from_user(user: &User) -> Self {
        Self {
            id: user.id.to_string(),
            email: user.email.clone(),
            name: user.name.clone(),
            roles: user.roles.clone(),
            tenant_id: user.tenant_id.clone(),
            created_at: user.created_at.clone(),
            updated_at: user.updated_at.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_into_identity() {
        let claims = Claims {
            sub: "u-1".to_string(),
            email: "a@example.com".to_string(),
            roles: vec!["user".to_string(), "admin".to_string()],
            tenant_id: "acme".to_string(),
            iat: 1,
            nbf: 1,
            exp: 2,
            jti: "j".to_string(),
        };

        let identity = claims.into_identity();
        assert_eq!(identity.user_id, "u-1");
        assert_eq!(identity.roles, vec!["user", "admin"]);
        assert!(identity.has_role("admin"));
        assert!(!identity.has_role("operator"));
    }

    #[test]
    fn test_api_key_record_optional_fields_default() {
        let record: ApiKeyRecord =
            serde_json::from_str(r#"{"key":"k","user_id":"u","email":"e@x.io"}"#).unwrap();
        assert!(record.roles.is_empty());
        assert!(record.tenant_id.is_empty());
        assert!(record.expires_at.is_none());
    }

    #[test]
    fn test_user_serialization_hides_password_hash() {
        let user = User {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            name: "A".to_string(),
            password_hash: "$2b$04$secret".to_string(),
            roles: vec!["user".to_string()],
            tenant_id: String::new(),
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };

        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("secret"));
    }
}
