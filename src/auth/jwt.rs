//! JWT Claims Codec
//! Signs and verifies access-token claim sets. HS256 is the only accepted
//! algorithm; a token whose header names anything else is refused before the
//! signature is looked at.

use crate::auth::{errors::AuthError, models::Claims};
use anyhow::{Context, Result};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use std::collections::HashSet;
use tracing::debug;

const ALGORITHM: Algorithm = Algorithm::HS256;

/// Stateless encoder/decoder for [`Claims`].
///
/// Decoding only proves structure and signature. Timestamps are left to
/// `TokenValidator` so that expiry, not-before and clock skew are judged in
/// one place.
pub struct ClaimsCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl ClaimsCodec {
    /// Create a new codec with the shared HMAC secret
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(ALGORITHM);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();
        validation.leeway = 0;

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign a claim set into a compact JWT
    pub fn encode(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(ALGORITHM), claims, &self.encoding_key).context("Failed to sign JWT")
    }

    /// Parse and verify a compact JWT
    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(err) => match err.kind() {
                ErrorKind::InvalidSignature => Err(AuthError::BadSignature),
                ErrorKind::InvalidAlgorithm => {
                    debug!("Rejected token declaring a non-HS256 algorithm");
                    Err(AuthError::Malformed)
                }
                _ => Err(AuthError::Malformed),
            },
        }
    }
}
