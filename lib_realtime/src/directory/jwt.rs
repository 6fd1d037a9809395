//! # JWT Authenticator
//!
//! Validates HS256 tokens signed with a shared secret. The user id comes
//! from a numeric `user_id` claim, or from `sub` when that parses as an
//! integer.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Authenticator, DirectoryError, Identity, UserId};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: i64,
}

pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new_with_secret(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn validate(&self, credential: &str) -> Result<Identity, DirectoryError> {
        let token = decode::<Claims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| DirectoryError::Rejected(e.to_string()))?;

        let claims = token.claims;
        let user_id = claims
            .user_id
            .or_else(|| claims.sub.as_deref().and_then(|sub| sub.parse().ok()))
            .ok_or_else(|| DirectoryError::Rejected("token carries no user id".into()))?;

        debug!(user_id, "Token validated");
        Ok(Identity { user_id })
    }
}
