//! Pairing Token Codec
//!
//! Tokens carry `sessionId|callbackUrl|command` to the secondary device.
//! Encryption is ChaCha20-Poly1305 with a synthetic nonce derived from the
//! key and the plaintext, so the same input always yields the same token.
//! Only holders of the shared secret can decrypt.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator between the token fields.
pub const TOKEN_SEPARATOR: &str = "|";

const NONCE_LEN: usize = 12;

/// Deterministic keyed token codec.
#[derive(Clone)]
pub struct TokenCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Build a codec from raw secret bytes of any length.
    pub fn new(secret: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"ENFACE_TOKEN_KEY_V1");
        hasher.update(secret);
        Self {
            key: hasher.finalize().into(),
        }
    }

    /// Encrypt `plaintext` into a hex token.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, TokenError> {
        let nonce_bytes = self.synthetic_nonce(plaintext.as_bytes());
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|_| TokenError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    /// Decrypt a hex token produced by [`TokenCodec::encrypt`].
    pub fn decrypt(&self, token: &str) -> Result<String, TokenError> {
        let combined = hex::decode(token).map_err(|_| TokenError::InvalidEncoding)?;
        if combined.len() < NONCE_LEN {
            return Err(TokenError::InvalidEncoding);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| TokenError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| TokenError::InvalidUtf8)
    }

    /// Join the token fields and encrypt them.
    pub fn seal(
        &self,
        session_id: &str,
        callback_url: &str,
        command: &str,
    ) -> Result<String, TokenError> {
        self.encrypt(&[session_id, callback_url, command].join(TOKEN_SEPARATOR))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }

    fn synthetic_nonce(&self, plaintext: &[u8]) -> [u8; NONCE_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(b"ENFACE_TOKEN_NONCE_V1");
        hasher.update(self.key);
        hasher.update(plaintext);
        let hash = hasher.finalize();

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&hash[..NONCE_LEN]);
        nonce
    }
}

/// Token codec errors.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Cipher rejected the input.
    #[error("encryption failed")]
    EncryptionFailed,
    /// Wrong key or tampered token.
    #[error("decryption failed")]
    DecryptionFailed,
    /// Not a hex token.
    #[error("invalid token encoding")]
    InvalidEncoding,
    /// Decrypted bytes are not UTF-8.
    #[error("invalid UTF-8 in token")]
    InvalidUtf8,
}
