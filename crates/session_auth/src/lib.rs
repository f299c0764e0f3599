use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    kind: TokenKind,
    iat: i64,
    exp: i64,
    jti: String,
}

#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSession {
    pub user_id: UserId,
    pub display_name: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("credential is missing or malformed")]
    Malformed,
    #[error("credential signature is invalid")]
    InvalidSignature,
    #[error("credential has expired")]
    Expired,
    #[error("expected a {expected:?} token")]
    WrongKind { expected: TokenKind },
    #[error("failed to sign token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

/// Mints and checks HS256 session tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    config: TokenConfig,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

pub fn subject_for_user(user_id: UserId) -> String {
    format!("user:{}", user_id.0)
}

impl TokenIssuer {
    pub fn new(config: TokenConfig) -> Self {
        let encoding = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config,
            encoding,
            decoding,
        }
    }

    pub fn issue(&self, user_id: UserId, display_name: &str) -> Result<IssuedTokens, TokenError> {
        let now = Utc::now();
        let access_expires_at = now + Duration::seconds(self.config.access_ttl_seconds);
        let access_token = self.mint(user_id, display_name, TokenKind::Access, now, access_expires_at)?;
        let refresh_token = self.mint(
            user_id,
            display_name,
            TokenKind::Refresh,
            now,
            now + Duration::seconds(self.config.refresh_ttl_seconds),
        )?;
        Ok(IssuedTokens {
            access_token,
            refresh_token,
            access_expires_at,
        })
    }

    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<VerifiedSession, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Malformed);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|err| {
            match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    TokenError::InvalidSignature
                }
                _ => TokenError::Malformed,
            }
        })?;
        let claims = data.claims;

        if claims.kind != expected {
            return Err(TokenError::WrongKind { expected });
        }
        let user_id = claims
            .sub
            .strip_prefix("user:")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(UserId)
            .ok_or(TokenError::Malformed)?;
        let expires_at = Utc
            .timestamp_opt(claims.exp, 0)
            .single()
            .ok_or(TokenError::Malformed)?;

        Ok(VerifiedSession {
            user_id,
            display_name: claims.name,
            expires_at,
        })
    }

    fn mint(
        &self,
        user_id: UserId,
        display_name: &str,
        kind: TokenKind,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let claims = Claims {
            sub: subject_for_user(user_id),
            name: display_name.to_string(),
            kind,
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(TokenError::Signing)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
