use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const USER_ACCESS: &str = "access";

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token validation failed: {0}")]
    Validation(#[from] jsonwebtoken::errors::Error),
    #[error("Token has the wrong audience")]
    WrongAudience,
    #[error("Token subject is not a user id")]
    InvalidSubject,
}

/// Session claims issued by the sign-in service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
    #[serde(default = "default_aud")]
    pub aud: String,
}

fn default_aud() -> String {
    USER_ACCESS.to_string()
}

/// Validates an HS256 session token and returns the user id it was issued for.
pub fn validate_token(token: &str, secret: &str, expected_aud: &str) -> Result<Uuid, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.validate_aud = false;
    validation.leeway = 30;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;

    if token_data.claims.aud != expected_aud {
        tracing::warn!(
            "Token audience mismatch: expected '{}', got '{}'",
            expected_aud,
            token_data.claims.aud
        );
        return Err(JwtError::WrongAudience);
    }

    Uuid::parse_str(&token_data.claims.sub).map_err(|_| JwtError::InvalidSubject)
}

#[cfg(test)]
pub fn issue_test_token(user_id: Uuid, secret: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + ttl_secs).max(0) as usize,
        iat: now as usize,
        aud: USER_ACCESS.to_string(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
