//! External Capabilities
//!
//! The pairing core never validates credentials or stores biometric
//! enrolments itself. Hosts inject these four operations.

pub mod jwt;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use jwt::{JwtConfig, JwtValidator};
pub use memory::MemoryBackend;

/// Resolves an opaque credential to a user id.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Fails if the credential is invalid or unrecognized.
    async fn validate(&self, user_data: &str) -> Result<String, CapabilityError>;
}

/// Reports whether biometric authentication is active for a user.
#[async_trait]
pub trait StatusChecker: Send + Sync {
    /// Current activation status.
    async fn is_active(&self, user_id: &str) -> Result<bool, CapabilityError>;
}

/// Enrols a biometric id for a user.
#[async_trait]
pub trait BiometricActivator: Send + Sync {
    /// Returns the resulting activation status.
    async fn activate(&self, user_id: &str, bio_id: &str) -> Result<bool, CapabilityError>;
}

/// Looks up the user token bound to a biometric id.
#[async_trait]
pub trait BiometricTokenLookup: Send + Sync {
    /// `None` when the biometric id is not enrolled.
    async fn token_for(&self, bio_id: &str) -> Result<Option<String>, CapabilityError>;
}

/// The four capabilities the dispatcher calls into.
#[derive(Clone)]
pub struct Backend {
    /// Credential validation.
    pub validator: Arc<dyn CredentialValidator>,
    /// Status lookup.
    pub status: Arc<dyn StatusChecker>,
    /// Biometric activation.
    pub activator: Arc<dyn BiometricActivator>,
    /// Token lookup by biometric id.
    pub lookup: Arc<dyn BiometricTokenLookup>,
}

impl Backend {
    /// Use one implementation for all four capabilities.
    pub fn from_shared<T>(shared: Arc<T>) -> Self
    where
        T: CredentialValidator
            + StatusChecker
            + BiometricActivator
            + BiometricTokenLookup
            + 'static,
    {
        Self {
            validator: shared.clone(),
            status: shared.clone(),
            activator: shared.clone(),
            lookup: shared,
        }
    }

    /// Replace the credential validator.
    pub fn with_validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// Capability failures.
#[derive(Debug, Clone, Error)]
pub enum CapabilityError {
    /// Credential not recognized.
    #[error("credential rejected: {0}")]
    Rejected(String),
    /// Backing service failed.
    #[error("{0}")]
    Unavailable(String),
}
