//! X3DH (Extended Triple Diffie-Hellman) Key Agreement
//!
//! X3DH lets two devices establish a shared secret while the responder is
//! offline, from a pre-key bundle the responder published earlier.
//!
//! ## Protocol Overview
//!
//! 1. Bob publishes his prekey bundle (identity key, signed prekey, one-time prekeys)
//! 2. Alice fetches one of Bob's bundles
//! 3. Alice performs X3DH calculations:
//!    - DH1 = DH(IK_A, SPK_B)
//!    - DH2 = DH(EK_A, IK_B)
//!    - DH3 = DH(EK_A, SPK_B)
//!    - DH4 = DH(EK_A, OPK_B) [optional, if one-time prekey available]
//! 4. Alice derives shared secret: SK = KDF(DH1 || DH2 || DH3 || DH4)
//! 5. Alice sends an [`X3dhHeader`] with her first message
//! 6. Bob performs the same DH calculations to derive the same shared secret

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519PublicKey;
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{
    parse_curve_key, Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey,
};
use crate::models::DeviceAddress;

/// 32-byte secret agreed by both sides
pub type SharedSecret = Zeroizing<[u8; 32]>;

/// Result of X3DH key agreement (initiator side)
pub struct X3dhResult {
    /// The derived shared secret (32 bytes)
    pub shared_secret: SharedSecret,
    /// What the responder needs to derive the same secret
    pub header: X3dhHeader,
}

impl X3dhResult {
    /// The ID of the one-time prekey that was used (if any)
    pub fn used_one_time_prekey(&self) -> Option<u32> {
        self.header.one_time_prekey_id
    }
}

impl std::fmt::Debug for X3dhResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X3dhResult")
            .field("shared_secret", &"[REDACTED]")
            .field("header", &self.header)
            .finish()
    }
}

/// Prekey bundle published by a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Device the bundle belongs to
    pub address: DeviceAddress,
    /// The responder's identity public key (Ed25519)
    pub identity_key: Vec<u8>,
    /// The responder's signed prekey
    pub signed_prekey: SignedPreKey,
    /// Optional one-time prekey (consumed after use)
    pub one_time_prekey: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Verify that the signed prekey has a valid signature from the identity key
    pub fn verify(&self) -> CryptoResult<()> {
        self.signed_prekey.verify(&self.identity_key)
    }
}

/// Information sent from initiator to responder with the first message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct X3dhHeader {
    /// Initiator's identity public key
    pub identity_key: Vec<u8>,
    /// Initiator's ephemeral public key
    pub ephemeral_key: Vec<u8>,
    /// ID of the signed prekey that was used
    pub signed_prekey_id: u32,
    /// ID of the one-time prekey that was used (if any)
    pub one_time_prekey_id: Option<u32>,
}

/// Perform X3DH key agreement (initiator side)
///
/// Verifies the bundle signature, generates an ephemeral key and derives the
/// shared secret against the responder's published keys.
pub fn x3dh_initiate(
    our_identity: &IdentityKeyPair,
    their_bundle: &PreKeyBundle,
) -> CryptoResult<X3dhResult> {
    their_bundle.verify()?;

    let ephemeral = Curve25519KeyPair::generate();

    let their_identity = identity_to_curve25519_public(&their_bundle.identity_key)?;
    let their_signed_prekey = their_bundle.signed_prekey.get_public_key()?;
    let our_identity_curve = identity_to_curve25519_secret(our_identity)?;

    // DH1 = DH(IK_A, SPK_B)
    let dh1 = our_identity_curve.diffie_hellman(&their_signed_prekey);
    // DH2 = DH(EK_A, IK_B)
    let dh2 = ephemeral.diffie_hellman(&their_identity);
    // DH3 = DH(EK_A, SPK_B)
    let dh3 = ephemeral.diffie_hellman(&their_signed_prekey);
    // DH4 = DH(EK_A, OPK_B)
    let dh4 = match their_bundle.one_time_prekey {
        Some(ref otk) => Some(ephemeral.diffie_hellman(&otk.get_public_key()?)),
        None => None,
    };

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_deref())?;

    Ok(X3dhResult {
        shared_secret,
        header: X3dhHeader {
            identity_key: our_identity.public_key_bytes(),
            ephemeral_key: ephemeral.public_key_bytes(),
            signed_prekey_id: their_bundle.signed_prekey.key_id,
            one_time_prekey_id: their_bundle.one_time_prekey.as_ref().map(|k| k.key_id),
        },
    })
}

/// Perform X3DH key agreement (responder side)
///
/// `our_signed_prekey` and `our_one_time_prekey` must be the key pairs named
/// by the header.
pub fn x3dh_respond(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &Curve25519KeyPair,
    our_one_time_prekey: Option<&Curve25519KeyPair>,
    header: &X3dhHeader,
) -> CryptoResult<SharedSecret> {
    if header.one_time_prekey_id.is_some() != our_one_time_prekey.is_some() {
        return Err(CryptoError::KeyExchangeFailed(
            "one-time prekey does not match the header".to_string(),
        ));
    }

    let their_identity = identity_to_curve25519_public(&header.identity_key)?;
    let their_ephemeral = parse_curve_key(&header.ephemeral_key)?;
    let our_identity_curve = identity_to_curve25519_secret(our_identity)?;

    // DH1 = DH(SPK_B, IK_A)
    let dh1 = our_signed_prekey.diffie_hellman(&their_identity);
    // DH2 = DH(IK_B, EK_A)
    let dh2 = our_identity_curve.diffie_hellman(&their_ephemeral);
    // DH3 = DH(SPK_B, EK_A)
    let dh3 = our_signed_prekey.diffie_hellman(&their_ephemeral);
    // DH4 = DH(OPK_B, EK_A)
    let dh4 = our_one_time_prekey.map(|otk| otk.diffie_hellman(&their_ephemeral));

    kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_deref())
}

/// KDF for combining X3DH DH outputs into a shared secret
fn kdf_x3dh(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> CryptoResult<SharedSecret> {
    let mut input = Zeroizing::new(Vec::with_capacity(160));

    // 32 bytes of 0xFF domain separation
    input.extend_from_slice(&[0xFF; 32]);
    input.extend_from_slice(dh1);
    input.extend_from_slice(dh2);
    input.extend_from_slice(dh3);
    if let Some(dh4_bytes) = dh4 {
        input.extend_from_slice(dh4_bytes);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &input);
    let mut output = Zeroizing::new([0u8; 32]);
    hkdf.expand(b"NoChat X3DH v1", &mut *output)
        .map_err(|e| CryptoError::KdfError(format!("HKDF expansion failed: {}", e)))?;

    Ok(output)
}

/// Convert an Ed25519 identity secret to its Curve25519 equivalent
///
/// The X25519 scalar is the clamped first half of SHA-512(seed), the same
/// scalar Ed25519 signs with.
fn identity_to_curve25519_secret(identity: &IdentityKeyPair) -> CryptoResult<Curve25519KeyPair> {
    use sha2::{Digest, Sha512};

    let seed = identity.secret_key_bytes();
    let hash = Sha512::digest(seed.as_slice());

    let mut curve_secret = Zeroizing::new([0u8; 32]);
    curve_secret.copy_from_slice(&hash[..32]);
    curve_secret[0] &= 248;
    curve_secret[31] &= 127;
    curve_secret[31] |= 64;

    Curve25519KeyPair::from_secret_bytes(&*curve_secret)
}

/// Convert an Ed25519 public key to its Curve25519 (Montgomery) equivalent
fn identity_to_curve25519_public(ed_public: &[u8]) -> CryptoResult<X25519PublicKey> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(ed_public)
        .map_err(|e| CryptoError::InvalidKey(format!("Invalid Ed25519 public key: {:?}", e)))?;
    let point = compressed.decompress().ok_or_else(|| {
        CryptoError::InvalidKey("Failed to decompress Ed25519 public key".to_string())
    })?;

    Ok(X25519PublicKey::from(point.to_montgomery().to_bytes()))
}
