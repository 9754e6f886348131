use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Claims carried by a session-registration token. Issuance happens
/// elsewhere; this service only verifies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Recipient identity (UUID).
    pub sub: String,
    /// Expiration time (unix timestamp).
    pub exp: i64,
}

/// Validate signature + expiry and extract claims (HS256).
pub fn verify_session_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthorized)
}

/// Parse the recipient identity out of verified claims.
pub fn recipient_identity(claims: &Claims) -> Result<Uuid, AppError> {
    Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)
}
