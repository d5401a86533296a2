//! JWT Token Handler

use anyhow::{Context, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Token claims. `sub` is the user id issued by the external auth service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub name: String,
    pub exp: usize,
}

/// Validates bearer tokens against the shared secret.
pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Validate a token and extract its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        debug!("Validated JWT for user {}", decoded.claims.sub);

        Ok(decoded.claims)
    }

    /// Issue a token for a user id. The real issuer is the external auth
    /// service; this exists for local development and tests.
    pub fn issue_token(&self, user_id: Uuid, name: &str, ttl_hours: i64) -> Result<String> {
        let exp = chrono::Utc::now()
            .checked_add_signed(chrono::Duration::hours(ttl_hours))
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: user_id.to_string(),
            name: name.to_string(),
            exp,
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate_roundtrip() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        let user_id = Uuid::new_v4();

        let token = handler.issue_token(user_id, "organizer", 24).unwrap();
        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.name, "organizer");
    }

    #[test]
    fn test_invalid_token_rejected() {
        let handler = JwtHandler::new("test-secret-key-12345".to_string());
        assert!(handler.validate_token("invalid.token.here").is_err());
    }

    #[test]
    fn test_different_secrets_reject() {
        let handler1 = JwtHandler::new("secret1".to_string());
        let handler2 = JwtHandler::new("secret2".to_string());

        let token = handler1.issue_token(Uuid::new_v4(), "x", 24).unwrap();
        assert!(handler2.validate_token(&token).is_err());
    }
}
