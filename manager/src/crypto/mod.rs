//! Cryptography for the session layer
//!
//! Key material and the math on it stay behind [`CryptoProvider`]; the rest of
//! the crate moves opaque keys between the store and the provider.
//!
//! ## Components
//!
//! - **keys**: Identity, signed prekey and one-time prekey types
//! - **x3dh**: Extended Triple Diffie-Hellman for asynchronous key agreement
//! - **provider**: The [`CryptoProvider`] capability and its default implementation
//! - **prekeys**: Store-backed prekey generation, rotation and consumption
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nochat_manager::crypto::{CryptoProvider, Role, SignalCrypto};
//!
//! let crypto = SignalCrypto;
//! let result = crypto.initiate(&identity, &bundle)?;
//! let chains = crypto.derive_chains(&result.shared_secret, Role::Initiator)?;
//! let (next, message_key) = crypto.chain_step(&chains.sending)?;
//! let ciphertext = crypto.encrypt(&message_key, aad, plaintext)?;
//! ```

use std::sync::Arc;

use tokio::sync::RwLock;

pub mod errors;
pub mod keys;
pub mod prekeys;
pub mod provider;
pub mod x3dh;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use keys::{fingerprint, Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey};
pub use prekeys::{PreKeyManager, PreKeyStatus, PublishedKeys};
pub use provider::{ChainKey, ChainPair, CryptoProvider, MessageKey, Role, SignalCrypto};
pub use x3dh::{PreKeyBundle, SharedSecret, X3dhHeader, X3dhResult};

/// The local identity, shared by everything that signs or agrees keys.
/// Replaced in place when the account re-registers.
pub type SharedIdentity = Arc<RwLock<IdentityKeyPair>>;

pub fn shared_identity(identity: IdentityKeyPair) -> SharedIdentity {
    Arc::new(RwLock::new(identity))
}
