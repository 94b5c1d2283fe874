//! JWT Credentials
//!
//! Host-side adapter: accepts a provider JWT as the `userData` credential and
//! yields its `sub` claim as the user id. The in-memory backend also uses it
//! to mint HS256 tokens for users found by biometric lookup.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{CapabilityError, CredentialValidator};

/// Keys and expected claims.
#[derive(Clone, Debug, Default)]
pub struct JwtConfig {
    /// Required `iss`, if any.
    pub issuer: Option<String>,
    /// Required `aud`, if any.
    pub audience: Option<String>,
    /// RS256 public key (PEM). Takes precedence over `secret` for verifying.
    pub public_key_pem: Option<String>,
    /// HS256 shared secret. Needed for issuing.
    pub secret: Option<String>,
}

/// Claims read from and written to credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id.
    pub sub: String,
    /// Expiry, Unix seconds.
    #[serde(default)]
    pub exp: u64,
    /// Issue time, Unix seconds.
    #[serde(default)]
    pub iat: u64,
    /// Issuing provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// A string or an array, depending on the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<serde_json::Value>,
}

/// Credential verification and issuing failures.
#[derive(Debug, Error)]
pub enum JwtError {
    /// Neither a public key nor a secret is set.
    #[error("authentication not configured")]
    NotConfigured,
    /// The configured public key could not be parsed.
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    /// `exp` is in the past.
    #[error("token expired")]
    Expired,
    /// Signature does not match the configured key.
    #[error("invalid signature")]
    InvalidSignature,
    /// `iss` or `aud` differs from the configured value.
    #[error("unexpected {0} claim")]
    ClaimMismatch(&'static str),
    /// Empty `sub`.
    #[error("token has no subject")]
    MissingSubject,
    /// Not a JWT, or claims of the wrong shape.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// Signing failed.
    #[error("failed to issue token: {0}")]
    Issue(String),
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer => Self::ClaimMismatch("iss"),
            ErrorKind::InvalidAudience => Self::ClaimMismatch("aud"),
            _ => Self::Malformed(err.to_string()),
        }
    }
}

impl JwtConfig {
    /// Read `AUTH_ISSUER`, `AUTH_AUDIENCE`, `AUTH_PUBLIC_KEY_PEM` and `AUTH_SECRET`.
    pub fn from_env() -> Self {
        Self {
            issuer: std::env::var("AUTH_ISSUER").ok(),
            audience: std::env::var("AUTH_AUDIENCE").ok(),
            public_key_pem: std::env::var("AUTH_PUBLIC_KEY_PEM").ok(),
            secret: std::env::var("AUTH_SECRET").ok(),
        }
    }

    /// A key to verify with is present.
    pub fn is_configured(&self) -> bool {
        self.public_key_pem.is_some() || self.secret.is_some()
    }

    fn decoding_key(&self) -> Result<(Algorithm, DecodingKey), JwtError> {
        match (&self.public_key_pem, &self.secret) {
            (Some(pem), _) => DecodingKey::from_rsa_pem(pem.as_bytes())
                .map(|key| (Algorithm::RS256, key))
                .map_err(|e| JwtError::InvalidKey(e.to_string())),
            (None, Some(secret)) => {
                Ok((Algorithm::HS256, DecodingKey::from_secret(secret.as_bytes())))
            }
            (None, None) => Err(JwtError::NotConfigured),
        }
    }

    fn validation(&self, algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.required_spec_claims = HashSet::new();
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }

    /// Verify `token` and return its claims.
    pub fn verify(&self, token: &str) -> Result<TokenClaims, JwtError> {
        let (algorithm, key) = self.decoding_key()?;
        let claims = jsonwebtoken::decode::<TokenClaims>(token, &key, &self.validation(algorithm))?
            .claims;
        if claims.sub.is_empty() {
            return Err(JwtError::MissingSubject);
        }
        Ok(claims)
    }

    /// Mint an HS256 token for `user_id`, valid for `ttl`.
    pub fn issue(&self, user_id: &str, ttl: Duration) -> Result<String, JwtError> {
        let secret = self.secret.as_ref().ok_or(JwtError::NotConfigured)?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = TokenClaims {
            sub: user_id.to_string(),
            exp: now + ttl.as_secs(),
            iat: now,
            iss: self.issuer.clone(),
            aud: self.audience.clone().map(serde_json::Value::String),
        };
        jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| JwtError::Issue(e.to_string()))
    }
}

/// [`CredentialValidator`] accepting provider JWTs.
#[derive(Debug, Clone)]
pub struct JwtValidator {
    config: JwtConfig,
}

impl JwtValidator {
    #[allow(missing_docs)]
    pub fn new(config: JwtConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CredentialValidator for JwtValidator {
    async fn validate(&self, user_data: &str) -> Result<String, CapabilityError> {
        self.config.verify(user_data).map(|claims| claims.sub).map_err(|e| {
            debug!(error = %e, "jwt credential rejected");
            CapabilityError::Rejected(e.to_string())
        })
    }
}
