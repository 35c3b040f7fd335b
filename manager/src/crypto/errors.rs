//! Cryptographic error types
//!
//! Failures reported by the [`CryptoProvider`](crate::crypto::CryptoProvider)
//! capability. These never carry key material.

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Failed to derive a shared secret
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    KdfError(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Decryption failed (wrong key, tampered ciphertext or associated data)
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Wire message could not be decoded
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::DecryptionError("AES-GCM operation failed".to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for CryptoError {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        CryptoError::SignatureError(e.to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
