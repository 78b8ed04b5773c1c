//! Credential verification
//!
//! Authentication is a black box to this service: a bearer token is
//! verified and yields an identity. Token issuance lives elsewhere.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Claims carried by an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Local user id
    pub sub: i64,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: i64,
}

/// Verify a bearer token and return its claims
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, ApiError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::InvalidToken)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret-key-for-token-verification";

    fn make_token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
            + 3600
    }

    #[test]
    fn test_valid_token_roundtrip() {
        let claims = Claims {
            sub: 42,
            role: Some("admin".to_string()),
            email: Some("admin@example.com".to_string()),
            exp: future_exp(),
        };
        let token = make_token(&claims, SECRET);

        let verified = verify_token(&token, SECRET).unwrap();
        assert_eq!(verified.sub, 42);
        assert_eq!(verified.role.as_deref(), Some("admin"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = Claims {
            sub: 1,
            role: None,
            email: None,
            exp: future_exp(),
        };
        let token = make_token(&claims, SECRET);
        assert!(verify_token(&token, "another-secret-key-of-enough-length").is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let claims = Claims {
            sub: 1,
            role: None,
            email: None,
            exp: 1_000,
        };
        let token = make_token(&claims, SECRET);
        assert!(verify_token(&token, SECRET).is_err());
    }
}
