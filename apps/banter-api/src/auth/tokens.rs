//! Connect-token verification.
//!
//! Token issuance (login, registration) lives outside this service; the
//! gateway only validates what it is handed during the handshake.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// The authenticated identity extracted from a valid connect token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub display_name: String,
}

/// Validates a client-supplied credential token.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Returns the authenticated user, or `None` for an invalid or expired
    /// token. Infrastructure failures also read as `None` — the connection
    /// is refused either way, before any session state exists.
    async fn verify(&self, token: &str) -> Option<AuthUser>;
}

/// Claims embedded in a connect token.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConnectClaims {
    /// Subject — the user's prefixed ULID.
    pub sub: String,
    /// Display name shown to other room members.
    pub name: String,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

/// HS256 JWT validator.
pub struct JwtValidator {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl AuthValidator for JwtValidator {
    async fn verify(&self, token: &str) -> Option<AuthUser> {
        let data = jsonwebtoken::decode::<ConnectClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| {
                tracing::debug!(?e, "connect token rejected");
                e
            })
            .ok()?;

        Some(AuthUser {
            user_id: data.claims.sub,
            display_name: data.claims.name,
        })
    }
}
