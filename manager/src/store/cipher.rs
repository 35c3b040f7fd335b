//! Sealing of secret columns
//!
//! Private keys, session records and retained plaintext are stored as
//! `nonce || AES-256-GCM(ciphertext)` under the account's pickle key. Each
//! record is bound to a label naming its row, so a sealed value copied into a
//! different row does not open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::CryptoError;
use crate::error::{ManagerError, ManagerResult};

/// 32-byte key protecting everything the store seals
pub type PickleKey = [u8; 32];

const NONCE_LEN: usize = 12;

pub(crate) struct RecordCipher {
    cipher: Aes256Gcm,
}

impl RecordCipher {
    pub(crate) fn new(key: &PickleKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub(crate) fn seal(&self, label: &str, plaintext: &[u8]) -> ManagerResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: label.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionError(format!("failed to seal {}", label)))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Open a sealed value. Failure means the row was tampered with or the
    /// pickle key is wrong, both reported as corruption.
    pub(crate) fn open(&self, label: &str, sealed: &[u8]) -> ManagerResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN {
            return Err(ManagerError::StoreCorrupt(format!(
                "sealed {} is truncated",
                label
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: label.as_bytes(),
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| ManagerError::StoreCorrupt(format!("cannot unseal {}", label)))
    }

    pub(crate) fn seal_json<T: serde::Serialize>(
        &self,
        label: &str,
        value: &T,
    ) -> ManagerResult<Vec<u8>> {
        let json = Zeroizing::new(serde_json::to_vec(value)?);
        self.seal(label, &json)
    }

    pub(crate) fn open_json<T: serde::de::DeserializeOwned>(
        &self,
        label: &str,
        sealed: &[u8],
    ) -> ManagerResult<T> {
        let json = self.open(label, sealed)?;
        serde_json::from_slice(&json)
            .map_err(|e| ManagerError::StoreCorrupt(format!("undecodable {}: {}", label, e)))
    }
}

/// Derive a pickle key from the user's password or device secret
pub fn derive_pickle_key(secret: &[u8], salt: &[u8]) -> ManagerResult<PickleKey> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"NoChat Pickle Key v1", &mut key)
        .map_err(|e| CryptoError::KdfError(format!("HKDF expansion failed: {}", e)))?;
    Ok(key)
}

/// Generate a random pickle key (for new accounts)
pub fn generate_pickle_key() -> PickleKey {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
