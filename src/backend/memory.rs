//! In-memory capability backend.
//!
//! Holds credentials and biometric enrolments in process memory. Used by the
//! demo binary and by tests, which inspect the call counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::jwt::JwtConfig;
use super::{
    BiometricActivator, BiometricTokenLookup, CapabilityError, CredentialValidator, StatusChecker,
};

/// Lifetime of tokens minted for biometric lookups.
const ISSUED_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// In-memory implementation of all four capabilities.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    /// Credential -> user id.
    credentials: Mutex<BTreeMap<String, String>>,
    /// Biometric id -> user id.
    enrolments: Mutex<BTreeMap<String, String>>,
    /// Mints JWTs for lookups when set; otherwise the user id is returned.
    issuer: Option<JwtConfig>,
    /// Make activation report failure.
    fail_activation: Mutex<bool>,
    validate_calls: AtomicUsize,
    activate_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
}

impl MemoryBackend {
    /// Empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign looked-up tokens with this JWT config.
    pub fn with_issuer(mut self, issuer: JwtConfig) -> Self {
        self.issuer = Some(issuer);
        self
    }

    /// Accept `credential` as user `user_id`.
    pub fn add_credential(&self, credential: &str, user_id: &str) {
        self.credentials
            .lock()
            .insert(credential.to_string(), user_id.to_string());
    }

    /// Enrol `bio_id` for `user_id`.
    pub fn enrol(&self, bio_id: &str, user_id: &str) {
        self.enrolments
            .lock()
            .insert(bio_id.to_string(), user_id.to_string());
    }

    /// Make subsequent activations fail.
    pub fn set_fail_activation(&self, fail: bool) {
        *self.fail_activation.lock() = fail;
    }

    /// Number of credential validations.
    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::Relaxed)
    }

    /// Number of activation calls.
    pub fn activate_calls(&self) -> usize {
        self.activate_calls.load(Ordering::Relaxed)
    }

    /// Number of token lookups.
    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CredentialValidator for MemoryBackend {
    async fn validate(&self, user_data: &str) -> Result<String, CapabilityError> {
        self.validate_calls.fetch_add(1, Ordering::Relaxed);
        self.credentials
            .lock()
            .get(user_data)
            .cloned()
            .ok_or_else(|| CapabilityError::Rejected(format!("unknown credential {user_data}")))
    }
}

#[async_trait]
impl StatusChecker for MemoryBackend {
    async fn is_active(&self, user_id: &str) -> Result<bool, CapabilityError> {
        Ok(self.enrolments.lock().values().any(|u| u == user_id))
    }
}

#[async_trait]
impl BiometricActivator for MemoryBackend {
    async fn activate(&self, user_id: &str, bio_id: &str) -> Result<bool, CapabilityError> {
        self.activate_calls.fetch_add(1, Ordering::Relaxed);
        if *self.fail_activation.lock() {
            return Err(CapabilityError::Unavailable("activation store offline".into()));
        }
        self.enrol(bio_id, user_id);
        Ok(true)
    }
}

#[async_trait]
impl BiometricTokenLookup for MemoryBackend {
    async fn token_for(&self, bio_id: &str) -> Result<Option<String>, CapabilityError> {
        self.lookup_calls.fetch_add(1, Ordering::Relaxed);
        let Some(user_id) = self.enrolments.lock().get(bio_id).cloned() else {
            return Ok(None);
        };
        match &self.issuer {
            Some(config) => config
                .issue(&user_id, ISSUED_TOKEN_TTL)
                .map(Some)
                .map_err(|e| CapabilityError::Unavailable(e.to_string())),
            None => Ok(Some(user_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_credentials() {
        let backend = MemoryBackend::new();
        backend.add_credential("tok1", "u1");

        assert_eq!(backend.validate("tok1").await.unwrap(), "u1");
        assert!(backend.validate("nope").await.is_err());
        assert_eq!(backend.validate_calls(), 2);
    }

    #[tokio::test]
    async fn test_activation_enrols() {
        let backend = MemoryBackend::new();
        assert!(!backend.is_active("u1").await.unwrap());

        assert!(backend.activate("u1", "bio-1").await.unwrap());
        assert!(backend.is_active("u1").await.unwrap());
        assert_eq!(backend.token_for("bio-1").await.unwrap().as_deref(), Some("u1"));
        assert_eq!(backend.token_for("bio-2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failing_activation() {
        let backend = MemoryBackend::new();
        backend.set_fail_activation(true);
        assert!(backend.activate("u1", "bio-1").await.is_err());
        assert_eq!(backend.activate_calls(), 1);
        assert!(!backend.is_active("u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_issuer_mints_jwt() {
        let config = JwtConfig {
            secret: Some("issuer-secret-issuer-secret!!".into()),
            ..Default::default()
        };
        let backend = MemoryBackend::new().with_issuer(config.clone());
        backend.enrol("bio-1", "u9");

        let token = backend.token_for("bio-1").await.unwrap().unwrap();
        assert_eq!(config.verify(&token).unwrap().sub, "u9");
    }
}
