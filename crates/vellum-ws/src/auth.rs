use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vellum_models::{TenantId, UserId};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Claims minted by the external identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayClaims {
    pub sub: UserId,
    pub tenant_id: TenantId,
    pub exp: usize,
    pub iat: usize,
}

pub fn create_token(
    user_id: UserId,
    tenant_id: TenantId,
    secret: &str,
    expiry_secs: u64,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = GatewayClaims {
        sub: user_id,
        tenant_id,
        iat: now,
        exp: now + expiry_secs as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Internal(e.to_string()))
}

pub fn validate_token(token: &str, secret: &str) -> Result<GatewayClaims, AuthError> {
    let claims = decode::<GatewayClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })?;
    if claims.sub <= 0 || claims.tenant_id <= 0 {
        return Err(AuthError::InvalidToken);
    }
    Ok(claims)
}
