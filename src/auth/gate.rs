//! Authorization Gate
//! Role and tenant predicates evaluated against a resolved identity.

use crate::auth::{errors::AuthError, models::Identity};

pub struct AuthorizationGate;

impl AuthorizationGate {
    /// True when the identity holds at least one of `allowed`.
    pub fn require_any_role<S: AsRef<str>>(identity: &Identity, allowed: &[S]) -> bool {
        allowed.iter().any(|role| identity.has_role(role.as_ref()))
    }

    pub fn require_tenant(identity: &Identity) -> bool {
        !identity.tenant_id.is_empty()
    }
}

/// What a route demands beyond a valid credential.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRequirements {
    pub any_role: Vec<String>,
    pub tenant: bool,
}

impl RouteRequirements {
    /// Any authenticated caller.
    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn any_role<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            any_role: roles.into_iter().map(Into::into).collect(),
            tenant: false,
        }
    }

    pub fn with_tenant(mut self) -> Self {
        self.tenant = true;
        self
    }

    pub fn check(&self, identity: &Identity) -> Result<(), AuthError> {
        let roles = self.any_role.as_slice();
        if !roles.is_empty() && !AuthorizationGate::require_any_role(identity, roles) {
            return Err(AuthError::Forbidden);
        }
        if self.tenant && !AuthorizationGate::require_tenant(identity) {
            return Err(AuthError::Forbidden);
        }
        Ok(())
    }
}
