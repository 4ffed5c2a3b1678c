use std::time::Duration;

use coderoom_core::{Role, UserIdentity};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::AuthError;

/// Lifetime of tokens minted by the login endpoint.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub username: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// HS256 issue/verify pair derived from the shared symmetric secret.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn issue(&self, user: &UserIdentity, ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: user.user_id.clone(),
            username: user.username.clone(),
            role: user.role,
            exp: Some(unix_now().saturating_add(ttl.as_secs())),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| AuthError::InvalidToken)
    }

    /// Succeeds iff the signature validates and the claims carry a user id,
    /// a username, and a known role. Expiry is honored when present.
    pub fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::InvalidToken)?;
        let claims = data.claims;

        if let Some(exp) = claims.exp {
            if unix_now() > exp {
                return Err(AuthError::ExpiredToken);
            }
        }
        if claims.user_id.is_empty() || claims.username.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        Ok(UserIdentity {
            user_id: claims.user_id,
            username: claims.username,
            role: claims.role,
        })
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
