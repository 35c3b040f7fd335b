//! The cryptographic capability consumed by the session layer
//!
//! Everything that touches key material lives behind [`CryptoProvider`]: key
//! generation, X3DH, chain key derivation and message encryption. The session
//! layer only moves opaque keys between the store and these calls.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair};
use crate::crypto::x3dh::{self, PreKeyBundle, SharedSecret, X3dhHeader, X3dhResult};

/// Which side of the key agreement a session was created on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Key of a symmetric ratchet chain
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey([u8; 32]);

impl ChainKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ChainKey([REDACTED])")
    }
}

/// Single-use key for one message
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey([REDACTED])")
    }
}

/// Sending and receiving chains seeded from one shared secret
#[derive(Debug, Clone)]
pub struct ChainPair {
    pub sending: ChainKey,
    pub receiving: ChainKey,
}

/// Cryptographic operations required by the manager
///
/// Implementations must be pure: the same inputs give the same outputs, except
/// for key generation and the initiator's ephemeral key.
pub trait CryptoProvider: Send + Sync {
    /// Generate a long-term identity key pair
    fn generate_identity(&self) -> IdentityKeyPair;

    /// Generate a Curve25519 key pair for pre-keys
    fn generate_key_pair(&self) -> Curve25519KeyPair;

    /// Run the initiator side of the key agreement against a bundle
    fn initiate(&self, ours: &IdentityKeyPair, bundle: &PreKeyBundle) -> CryptoResult<X3dhResult>;

    /// Run the responder side of the key agreement
    fn respond(
        &self,
        ours: &IdentityKeyPair,
        signed_prekey: &Curve25519KeyPair,
        one_time_prekey: Option<&Curve25519KeyPair>,
        header: &X3dhHeader,
    ) -> CryptoResult<SharedSecret>;

    /// Split a shared secret into the chains for `role`
    fn derive_chains(&self, shared: &SharedSecret, role: Role) -> CryptoResult<ChainPair>;

    /// Advance a chain by one step
    fn chain_step(&self, chain: &ChainKey) -> CryptoResult<(ChainKey, MessageKey)>;

    fn encrypt(&self, key: &MessageKey, aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>>;

    fn decrypt(&self, key: &MessageKey, aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Default provider: X3DH over Curve25519/Ed25519, HKDF-SHA256 chains and
/// AES-256-GCM message encryption
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalCrypto;

const CHAIN_INFO: &[u8] = b"NoChat Chains v1";
const CHAIN_STEP_INFO: &[u8] = b"NoChat Chain Step v1";
const MESSAGE_KEY_INFO: &[u8] = b"NoChat Message Key v1";
const MESSAGE_CIPHER_INFO: &[u8] = b"NoChat Message Cipher v1";

impl SignalCrypto {
    fn expand(prk: &[u8; 32], info: &[u8], out: &mut [u8]) -> CryptoResult<()> {
        let hkdf = Hkdf::<Sha256>::from_prk(prk)
            .map_err(|e| CryptoError::KdfError(format!("Invalid chain key: {}", e)))?;
        hkdf.expand(info, out)
            .map_err(|e| CryptoError::KdfError(format!("HKDF expansion failed: {}", e)))
    }

    /// AES key and nonce for one message key. Each message key encrypts
    /// exactly one message, so a derived nonce never repeats under a key.
    fn message_cipher(key: &MessageKey) -> CryptoResult<(Aes256Gcm, [u8; 12])> {
        let mut material = Zeroizing::new([0u8; 44]);
        Self::expand(key.as_bytes(), MESSAGE_CIPHER_INFO, &mut *material)?;

        let cipher = Aes256Gcm::new_from_slice(&material[..32])
            .map_err(|e| CryptoError::InvalidKey(format!("Invalid AES key: {}", e)))?;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&material[32..]);
        Ok((cipher, nonce))
    }
}

impl CryptoProvider for SignalCrypto {
    fn generate_identity(&self) -> IdentityKeyPair {
        IdentityKeyPair::generate()
    }

    fn generate_key_pair(&self) -> Curve25519KeyPair {
        Curve25519KeyPair::generate()
    }

    fn initiate(&self, ours: &IdentityKeyPair, bundle: &PreKeyBundle) -> CryptoResult<X3dhResult> {
        x3dh::x3dh_initiate(ours, bundle)
    }

    fn respond(
        &self,
        ours: &IdentityKeyPair,
        signed_prekey: &Curve25519KeyPair,
        one_time_prekey: Option<&Curve25519KeyPair>,
        header: &X3dhHeader,
    ) -> CryptoResult<SharedSecret> {
        x3dh::x3dh_respond(ours, signed_prekey, one_time_prekey, header)
    }

    fn derive_chains(&self, shared: &SharedSecret, role: Role) -> CryptoResult<ChainPair> {
        let hkdf = Hkdf::<Sha256>::new(None, &shared[..]);
        let mut okm = Zeroizing::new([0u8; 64]);
        hkdf.expand(CHAIN_INFO, &mut *okm)
            .map_err(|e| CryptoError::KdfError(format!("HKDF expansion failed: {}", e)))?;

        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        first.copy_from_slice(&okm[..32]);
        second.copy_from_slice(&okm[32..]);
        // The initiator sends on the first chain, the responder on the second
        let (initiator, responder) = (ChainKey(first), ChainKey(second));

        Ok(match role {
            Role::Initiator => ChainPair {
                sending: initiator,
                receiving: responder,
            },
            Role::Responder => ChainPair {
                sending: responder,
                receiving: initiator,
            },
        })
    }

    fn chain_step(&self, chain: &ChainKey) -> CryptoResult<(ChainKey, MessageKey)> {
        let mut next = [0u8; 32];
        let mut message = [0u8; 32];
        Self::expand(chain.as_bytes(), CHAIN_STEP_INFO, &mut next)?;
        Self::expand(chain.as_bytes(), MESSAGE_KEY_INFO, &mut message)?;
        Ok((ChainKey(next), MessageKey(message)))
    }

    fn encrypt(&self, key: &MessageKey, aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        let (cipher, nonce) = Self::message_cipher(key)?;
        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionError("AES-GCM encryption failed".to_string()))
    }

    fn decrypt(&self, key: &MessageKey, aad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let (cipher, nonce) = Self::message_cipher(key)?;
        Ok(cipher.decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{OneTimePreKey, SignedPreKey};
    use crate::models::DeviceAddress;

    fn agreed_chains() -> (ChainPair, ChainPair) {
        let crypto = SignalCrypto;
        let alice = crypto.generate_identity();
        let bob = crypto.generate_identity();
        let signed = crypto.generate_key_pair();
        let otk = crypto.generate_key_pair();
        let bundle = PreKeyBundle {
            address: DeviceAddress::new("bob", 1),
            identity_key: bob.public_key_bytes(),
            signed_prekey: SignedPreKey::new(1, &signed, &bob),
            one_time_prekey: Some(OneTimePreKey::new(1, &otk)),
        };

        let result = crypto.initiate(&alice, &bundle).unwrap();
        let secret = crypto
            .respond(&bob, &signed, Some(&otk), &result.header)
            .unwrap();

        (
            crypto.derive_chains(&result.shared_secret, Role::Initiator).unwrap(),
            crypto.derive_chains(&secret, Role::Responder).unwrap(),
        )
    }

    #[test]
    fn test_chains_mirror_each_other() {
        let (alice, bob) = agreed_chains();
        assert_eq!(alice.sending, bob.receiving);
        assert_eq!(alice.receiving, bob.sending);
        assert_ne!(alice.sending, alice.receiving);
    }

    #[test]
    fn test_chain_step_is_deterministic_and_moves_forward() {
        let crypto = SignalCrypto;
        let (alice, _) = agreed_chains();

        let (next_a, key_a) = crypto.chain_step(&alice.sending).unwrap();
        let (next_b, key_b) = crypto.chain_step(&alice.sending).unwrap();
        assert_eq!(next_a, next_b);
        assert_eq!(key_a, key_b);
        assert_ne!(next_a, alice.sending);

        let (_, key_c) = crypto.chain_step(&next_a).unwrap();
        assert_ne!(key_a, key_c);
    }

    #[test]
    fn test_encrypt_decrypt_with_associated_data() {
        let crypto = SignalCrypto;
        let (alice, bob) = agreed_chains();
        let (_, send_key) = crypto.chain_step(&alice.sending).unwrap();
        let (_, recv_key) = crypto.chain_step(&bob.receiving).unwrap();

        let ciphertext = crypto.encrypt(&send_key, b"header", b"hello").unwrap();
        assert_ne!(ciphertext, b"hello".to_vec());
        assert_eq!(
            crypto.decrypt(&recv_key, b"header", &ciphertext).unwrap(),
            b"hello".to_vec()
        );

        let tampered_aad = crypto.decrypt(&recv_key, b"other", &ciphertext);
        assert!(matches!(tampered_aad, Err(CryptoError::DecryptionError(_))));
    }

    #[test]
    fn test_keys_debug_redacted() {
        let (alice, _) = agreed_chains();
        assert_eq!(format!("{:?}", alice.sending), "ChainKey([REDACTED])");
    }

    #[test]
    fn test_provider_is_object_safe() {
        let provider: std::sync::Arc<dyn CryptoProvider> = std::sync::Arc::new(SignalCrypto);
        assert_eq!(provider.generate_key_pair().public_key_bytes().len(), 32);
    }
}
