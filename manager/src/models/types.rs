//! Shared data types for the manager and its store

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Addressing
// ============================================================================

/// Opaque account identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device number within an account. The primary device is `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    pub const PRIMARY: DeviceId = DeviceId(1);
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An (account, device) pair. Sessions, devices and pending messages are all
/// keyed by address rather than by object reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub account: AccountId,
    pub device: DeviceId,
}

impl DeviceAddress {
    pub fn new(account: impl Into<String>, device: u32) -> Self {
        Self {
            account: AccountId::new(account),
            device: DeviceId(device),
        }
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.account, self.device)
    }
}

// ============================================================================
// Devices & identities
// ============================================================================

/// A device registered to an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub address: DeviceAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Identity public key the device speaks with
    pub identity_key: Vec<u8>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// False once the device has been revoked
    pub live: bool,
}

impl Device {
    /// A freshly linked, live device
    pub fn new(address: DeviceAddress, identity_key: Vec<u8>, name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            address,
            name,
            identity_key,
            registered_at: now,
            last_seen_at: now,
            live: true,
        }
    }
}

/// How far a remote identity key is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    TrustedUnverified,
    TrustedVerified,
}

impl TrustLevel {
    pub fn is_trusted(self) -> bool {
        matches!(self, TrustLevel::TrustedUnverified | TrustLevel::TrustedVerified)
    }

    pub(crate) fn to_db(self) -> i64 {
        match self {
            TrustLevel::Untrusted => 0,
            TrustLevel::TrustedUnverified => 1,
            TrustLevel::TrustedVerified => 2,
        }
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(TrustLevel::Untrusted),
            1 => Some(TrustLevel::TrustedUnverified),
            2 => Some(TrustLevel::TrustedVerified),
            _ => None,
        }
    }
}

/// Identity of a remote account as last observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub account: AccountId,
    pub public_key: Vec<u8>,
    pub trust_level: TrustLevel,
    pub added_at: DateTime<Utc>,
}

impl Identity {
    /// Short hex fingerprint for out-of-band comparison
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(&self.public_key);
        hex::encode(&hash[..8])
    }
}

/// Result of recording an observed identity key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityChange {
    /// First time this account was seen
    New,
    /// Same key as before
    Unchanged,
    /// Key differs from the stored one
    Changed,
}

// ============================================================================
// Sessions & messages
// ============================================================================

/// Lifecycle state of a stored session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// The single session used for new traffic with a peer device
    Active,
    /// Superseded; still decrypts late messages until expired
    Archived,
    /// Killed by device revocation or identity rotation; unusable
    Invalidated,
}

impl SessionStatus {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            SessionStatus::Active => 0,
            SessionStatus::Archived => 1,
            SessionStatus::Invalidated => 2,
        }
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(SessionStatus::Active),
            1 => Some(SessionStatus::Archived),
            2 => Some(SessionStatus::Invalidated),
            _ => None,
        }
    }
}

/// Which way a pending message travels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    Outbound,
    Inbound,
}

impl MessageDirection {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            MessageDirection::Outbound => 0,
            MessageDirection::Inbound => 1,
        }
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(MessageDirection::Outbound),
            1 => Some(MessageDirection::Inbound),
            _ => None,
        }
    }
}

/// A message awaiting acknowledgment (outbound) or retained for duplicate
/// detection (inbound).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub id: i64,
    pub peer: DeviceAddress,
    pub session_id: Uuid,
    pub direction: MessageDirection,
    /// Per-session, per-direction sequence number
    pub counter: u32,
    /// SHA-256 of the wire ciphertext
    pub digest: Vec<u8>,
    /// Outbound: wire ciphertext. Inbound: decrypted plaintext.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Lightweight description of a session, safe to share across devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub peer: DeviceAddress,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_key_id: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Groups
// ============================================================================

/// Locally stored group state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRecord {
    pub group_id: Vec<u8>,
    pub master_key: Vec<u8>,
    pub members: Vec<AccountId>,
    #[serde(default)]
    pub blocked: bool,
}

// ============================================================================
// Time helpers
// ============================================================================

/// Current time as unix milliseconds, the storage representation
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert stored unix milliseconds back to a timestamp
pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let address = DeviceAddress::new("alice", 2);
        assert_eq!(address.to_string(), "alice.2");
    }

    #[test]
    fn test_trust_level_round_trip_and_trust() {
        for level in [
            TrustLevel::Untrusted,
            TrustLevel::TrustedUnverified,
            TrustLevel::TrustedVerified,
        ] {
            assert_eq!(TrustLevel::from_db(level.to_db()), Some(level));
        }
        assert!(!TrustLevel::Untrusted.is_trusted());
        assert!(TrustLevel::TrustedVerified.is_trusted());
        assert_eq!(TrustLevel::from_db(9), None);
    }

    #[test]
    fn test_millis_conversion() {
        let now = now_millis();
        assert_eq!(from_millis(now).timestamp_millis(), now);
    }

    #[test]
    fn test_identity_fingerprint_length() {
        let identity = Identity {
            account: AccountId::new("bob"),
            public_key: vec![7u8; 32],
            trust_level: TrustLevel::TrustedUnverified,
            added_at: Utc::now(),
        };
        assert_eq!(identity.fingerprint().len(), 16);
    }
}
