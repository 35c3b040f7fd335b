//! Error types for the NoChat manager

use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::models::{AccountId, DeviceAddress};

/// Manager-wide error type
#[derive(Error, Debug)]
pub enum ManagerError {
    /// Connection pool exhausted or database locked. Retry with backoff.
    #[error("Store busy: no connection available within the acquisition timeout")]
    StoreBusy,

    /// Schema or data invariant violation. Processing for the account must stop.
    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    /// Session establishment needs a pre-key that is not available
    #[error("No pre-key available: {0}")]
    NoPreKeyAvailable(String),

    /// A one-time pre-key was offered or referenced after it had been consumed
    #[error("One-time pre-key {key_id} of {owner} was already consumed")]
    PreKeyReused { owner: DeviceAddress, key_id: u32 },

    /// The receiving chain would have to skip more keys than allowed
    #[error("Ratchet exhausted: gap of {gap} exceeds maximum skip of {max_skip}")]
    RatchetExhausted { gap: u64, max_skip: u32 },

    /// Decryption failed in a way that needs a new session
    #[error("Session with {0} must be re-established")]
    SessionResetRequired(DeviceAddress),

    /// Message already processed. Not a failure: receiving is idempotent.
    #[error("Duplicate message with counter {counter}")]
    DuplicateMessage { counter: u32 },

    /// Counter regressed outside the replay window, or its key is gone
    #[error("Message counter {counter} rejected (next expected {expected})")]
    ReplayRejected { counter: u32, expected: u32 },

    /// Another writer advanced the session since the caller's snapshot
    #[error("Session {0} was modified concurrently")]
    StaleSession(Uuid),

    #[error("No session with {0}")]
    SessionNotFound(DeviceAddress),

    #[error("Device {0} is revoked; its sessions were invalidated")]
    DeviceRevoked(DeviceAddress),

    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceAddress),

    #[error("Identity of {0} is not trusted")]
    UntrustedIdentity(AccountId),

    #[error("Identity key mismatch for {0}")]
    IdentityMismatch(DeviceAddress),

    #[error("Invalid device link: {0}")]
    InvalidLink(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// Errors the caller should retry with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ManagerError::StoreBusy | ManagerError::NoPreKeyAvailable(_)
        )
    }

    /// Errors that halt processing for the account until repaired
    pub fn is_fatal(&self) -> bool {
        matches!(self, ManagerError::StoreCorrupt(_))
    }
}

// SQLite primary result codes for SQLITE_BUSY and SQLITE_LOCKED
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for ManagerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => ManagerError::StoreBusy,
            sqlx::Error::Database(ref db) if is_busy_code(db.code().as_deref()) => {
                ManagerError::StoreBusy
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                ManagerError::StoreCorrupt(e.to_string())
            }
            other => ManagerError::Database(other),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for ManagerError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        ManagerError::StoreCorrupt(format!("migration failed: {}", e))
    }
}

fn is_busy_code(code: Option<&str>) -> bool {
    // Extended codes carry the primary code in the low byte
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

/// Result type alias for manager operations
pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_timeout_is_store_busy() {
        let err: ManagerError = sqlx::Error::PoolTimedOut.into();
        assert!(matches!(err, ManagerError::StoreBusy));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_busy_codes() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517"))); // SQLITE_BUSY_SNAPSHOT
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("19"))); // SQLITE_CONSTRAINT
        assert!(!is_busy_code(None));
    }

    #[test]
    fn test_classification() {
        assert!(ManagerError::StoreCorrupt("bad".into()).is_fatal());
        assert!(ManagerError::NoPreKeyAvailable("bob.1".into()).is_retryable());
        assert!(!ManagerError::SessionResetRequired(DeviceAddress::new("bob", 1)).is_retryable());
    }
}
