//! Workspace access tokens.
//!
//! Tokens are HS256 JWTs whose subject is the workspace id. They are issued
//! at login and checked on every authenticated request, including the
//! WebSocket upgrade.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::WorkspaceId;

/// Issuer stamped on and required from every token
pub const ISSUER: &str = "rtsync";

/// Errors that can occur during token operations
#[derive(Error, Debug)]
pub enum TokenError {
    #[error("JWT error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Token subject is not a workspace id: {0}")]
    InvalidSubject(String),

    #[error("Missing access token")]
    MissingToken,
}

/// Configuration for token issuance
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC signing secret
    pub secret: String,
    /// Token lifetime in seconds
    pub ttl_seconds: u64,
    /// Clock skew tolerated when validating, in seconds
    pub leeway_seconds: u64,
}

impl TokenConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds: 24 * 60 * 60,
            leeway_seconds: 5,
        }
    }

    pub fn validate(&self) -> Result<(), TokenError> {
        if self.secret.is_empty() {
            return Err(TokenError::InvalidConfig("JWT secret is empty".to_string()));
        }
        Ok(())
    }
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Issuer
    pub iss: String,
    /// Subject (workspace id)
    pub sub: String,
    /// Issued at timestamp
    pub iat: u64,
    /// Expiration timestamp
    pub exp: u64,
    /// Not before timestamp
    pub nbf: u64,
    /// JWT ID
    pub jti: String,
}

/// Issued token with its expiry
#[derive(Debug, Clone, Serialize)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: u64,
}

/// Issues and verifies workspace tokens
pub struct TokenService {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Result<Self, TokenError> {
        config.validate()?;
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Ok(Self {
            config,
            encoding_key,
            decoding_key,
        })
    }

    /// Issue a token for a workspace
    pub fn issue(&self, workspace_id: WorkspaceId) -> Result<AccessToken, TokenError> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let exp = now + self.config.ttl_seconds;

        let claims = Claims {
            iss: ISSUER.to_string(),
            sub: workspace_id.to_string(),
            iat: now,
            exp,
            nbf: now,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(AccessToken {
            token,
            expires_at: exp,
        })
    }

    /// Check signature, issuer and validity window, and return the workspace id
    pub fn verify(&self, token: &str) -> Result<WorkspaceId, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = self.config.leeway_seconds;
        validation.validate_nbf = true;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        data.claims
            .sub
            .parse()
            .map_err(|_| TokenError::InvalidSubject(data.claims.sub.clone()))
    }
}
