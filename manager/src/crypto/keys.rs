//! Key types and generation
//!
//! - Identity keys (Ed25519) for long-term identity and signing
//! - Curve25519 keys for Diffie-Hellman key exchange
//! - Signed prekeys for medium-term key exchange
//! - One-time prekeys for forward secrecy

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};

/// Long-term identity key pair (Ed25519)
///
/// Used for:
/// - Signing prekeys to prove ownership
/// - Long-term identity verification
/// - Key fingerprint generation for verification
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from the 32-byte secret seed
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let seed: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;
        Ok(Self {
            secret: SigningKey::from_bytes(&seed),
        })
    }

    /// Sign a message with this identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.secret.verifying_key().to_bytes().to_vec()
    }

    /// Get the secret key bytes (for sealed storage)
    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Compute a fingerprint for key verification
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &hex::encode(self.public_key_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Short hex fingerprint of a public key
pub fn fingerprint(public_key: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..8])
}

/// Parse an Ed25519 public key
pub fn parse_identity_key(bytes: &[u8]) -> CryptoResult<VerifyingKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Identity key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid identity key: {}", e)))
}

/// Verify an Ed25519 signature made by `identity_key`
pub fn verify_signature(identity_key: &[u8], message: &[u8], signature: &[u8]) -> CryptoResult<()> {
    let key = parse_identity_key(identity_key)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| CryptoError::SignatureError(format!("Invalid signature format: {}", e)))?;
    key.verify(message, &signature)?;
    Ok(())
}

/// Curve25519 key pair for Diffie-Hellman key exchange
///
/// Used for ephemeral keys, signed prekeys and one-time prekeys.
#[derive(Clone)]
pub struct Curve25519KeyPair {
    /// Public key (safe to share)
    pub public: X25519PublicKey,
    /// Secret key (never leaves device)
    secret: StaticSecret,
}

impl Curve25519KeyPair {
    /// Generate a new random Curve25519 key pair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from the secret bytes; the public key is recomputed
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = secret_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?;
        let secret = StaticSecret::from(arr);
        let public = X25519PublicKey::from(&secret);
        Ok(Self { public, secret })
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.diffie_hellman(their_public).to_bytes())
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Get the secret key bytes (for sealed storage)
    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }
}

impl std::fmt::Debug for Curve25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Parse a Curve25519 public key
pub fn parse_curve_key(bytes: &[u8]) -> CryptoResult<X25519PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Key must be 32 bytes".to_string()))?;
    Ok(X25519PublicKey::from(arr))
}

/// Signed prekey (rotated periodically, typically every ~7 days)
///
/// A Curve25519 key pair with a signature from the identity key,
/// proving that the prekey belongs to the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPreKey {
    /// Unique identifier for this prekey
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 signature of the public key
    pub signature: Vec<u8>,
    /// Unix timestamp when this prekey was created
    pub created_at: i64,
}

impl SignedPreKey {
    /// Create a new signed prekey
    pub fn new(key_id: u32, key_pair: &Curve25519KeyPair, identity: &IdentityKeyPair) -> Self {
        let public_key = key_pair.public_key_bytes();
        let signature = identity.sign(&public_key);

        Self {
            key_id,
            public_key,
            signature,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Verify the signature with the identity public key
    pub fn verify(&self, identity_key: &[u8]) -> CryptoResult<()> {
        verify_signature(identity_key, &self.public_key, &self.signature)
    }

    /// Check if this prekey has expired (older than max_age_days)
    pub fn is_expired(&self, max_age_days: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        let age_seconds = now - self.created_at;
        let max_age_seconds = max_age_days * 24 * 60 * 60;
        age_seconds > max_age_seconds
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<X25519PublicKey> {
        parse_curve_key(&self.public_key)
    }
}

/// One-time prekey (single use, provides forward secrecy)
///
/// Consumed after a single use to provide forward secrecy for the initial message.
/// Should be replenished when count falls below threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKey {
    /// Unique identifier for this prekey
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
}

impl OneTimePreKey {
    /// Create a new one-time prekey
    pub fn new(key_id: u32, key_pair: &Curve25519KeyPair) -> Self {
        Self {
            key_id,
            public_key: key_pair.public_key_bytes(),
        }
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<X25519PublicKey> {
        parse_curve_key(&self.public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_generation() {
        let key = IdentityKeyPair::generate();
        assert_eq!(key.public_key_bytes().len(), 32);
        assert_eq!(key.secret_key_bytes().len(), 32);
    }

    #[test]
    fn test_identity_key_signing() {
        let key = IdentityKeyPair::generate();
        let message = b"test message";
        let signature = key.sign(message);
        assert_eq!(signature.len(), 64);

        assert!(verify_signature(&key.public_key_bytes(), message, &signature).is_ok());
        assert!(verify_signature(&key.public_key_bytes(), b"other", &signature).is_err());
    }

    #[test]
    fn test_identity_restore() {
        let key = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_secret_bytes(&key.secret_key_bytes()).unwrap();
        assert_eq!(key.public_key_bytes(), restored.public_key_bytes());
        assert!(IdentityKeyPair::from_secret_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = Curve25519KeyPair::generate();
        let bob = Curve25519KeyPair::generate();

        let shared_alice = alice.diffie_hellman(&bob.public);
        let shared_bob = bob.diffie_hellman(&alice.public);

        assert_eq!(*shared_alice, *shared_bob);
    }

    #[test]
    fn test_curve_restore() {
        let key = Curve25519KeyPair::generate();
        let restored = Curve25519KeyPair::from_secret_bytes(&key.secret_key_bytes()).unwrap();
        assert_eq!(key.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_signed_prekey() {
        let identity = IdentityKeyPair::generate();
        let prekey_pair = Curve25519KeyPair::generate();
        let signed_prekey = SignedPreKey::new(1, &prekey_pair, &identity);

        assert_eq!(signed_prekey.key_id, 1);
        assert!(signed_prekey.verify(&identity.public_key_bytes()).is_ok());

        let other = IdentityKeyPair::generate();
        assert!(signed_prekey.verify(&other.public_key_bytes()).is_err());
    }

    #[test]
    fn test_signed_prekey_expiry() {
        let identity = IdentityKeyPair::generate();
        let prekey_pair = Curve25519KeyPair::generate();
        let mut signed_prekey = SignedPreKey::new(1, &prekey_pair, &identity);

        assert!(!signed_prekey.is_expired(7));

        signed_prekey.created_at = chrono::Utc::now().timestamp() - (8 * 24 * 60 * 60);
        assert!(signed_prekey.is_expired(7));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let key = IdentityKeyPair::generate();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains(&hex::encode(key.secret_key_bytes().as_slice())));
    }
}
