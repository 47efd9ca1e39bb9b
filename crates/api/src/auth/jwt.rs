//! Session token verification.
//!
//! The dashboard never mints tokens. Sessions are issued by the identity
//! provider and verified here against the provider's RS256 public key.
//! An HS256 shared-secret mode exists for local development, where no
//! provider keys are available.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,

    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// Claims carried in a provider session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Provider user ID (`user_...`)
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    /// Active organization, when the session has one selected
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub org_role: Option<String>,
    #[serde(default)]
    pub iss: Option<String>,
}

#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    algorithm: Algorithm,
}

impl JwtManager {
    /// Verify against the provider's PEM-encoded RS256 public key.
    pub fn from_rsa_pem(pem: &str) -> Result<Self, JwtError> {
        let decoding_key = DecodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| JwtError::Invalid(format!("Invalid RSA public key: {}", e)))?;
        Ok(Self {
            decoding_key,
            algorithm: Algorithm::RS256,
        })
    }

    /// HS256 shared-secret mode for local development tokens.
    pub fn with_shared_secret(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            algorithm: Algorithm::HS256,
        }
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, JwtError> {
        // Explicit algorithm; tokens claiming anything else are rejected.
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 60;

        decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::OffsetDateTime;

    const TEST_SECRET: &str = "test-secret-key-at-least-32-chars!";

    fn encode_test_token(claims: &SessionClaims, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("Should encode token")
    }

    fn claims_expiring_in(seconds: i64) -> SessionClaims {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        SessionClaims {
            sub: "user_2abc123".to_string(),
            exp: now + seconds,
            iat: now,
            org_id: Some("org_2xyz789".to_string()),
            org_role: Some("admin".to_string()),
            iss: Some("https://clerk.certiva.io".to_string()),
        }
    }

    #[test]
    fn test_fresh_token_verifies() {
        let jwt = JwtManager::with_shared_secret(TEST_SECRET);
        let token = encode_test_token(&claims_expiring_in(3600), TEST_SECRET);

        let claims = jwt.verify(&token).expect("Should be valid");
        assert_eq!(claims.sub, "user_2abc123");
        assert_eq!(claims.org_role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::with_shared_secret(TEST_SECRET);
        // Expired well beyond the 60s leeway
        let token = encode_test_token(&claims_expiring_in(-3600), TEST_SECRET);

        let result = jwt.verify(&token);
        assert!(matches!(result, Err(JwtError::Expired)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let jwt = JwtManager::with_shared_secret(TEST_SECRET);
        let token = encode_test_token(&claims_expiring_in(3600), "some-other-secret");

        let result = jwt.verify(&token);
        assert!(matches!(result, Err(JwtError::Invalid(_))));
    }

    #[test]
    fn test_token_without_org_context() {
        let jwt = JwtManager::with_shared_secret(TEST_SECRET);
        let mut claims = claims_expiring_in(3600);
        claims.org_id = None;
        claims.org_role = None;
        let token = encode_test_token(&claims, TEST_SECRET);

        let verified = jwt.verify(&token).expect("Should be valid");
        assert!(verified.org_id.is_none());
        assert!(verified.org_role.is_none());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let jwt = JwtManager::with_shared_secret(TEST_SECRET);

        assert!(jwt.verify("not.a.valid.token").is_err());
        assert!(jwt.verify("completely-invalid").is_err());
        assert!(jwt.verify("").is_err());
    }
}
