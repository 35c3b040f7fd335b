//! Manager configuration
//!
//! All options have conservative defaults; a config file only needs to name the
//! values it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, ManagerResult};

/// Top-level configuration for one account manager instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
    pub store: StoreConfig,
    pub windows: WindowConfig,
    pub sessions: SessionConfig,
    pub pre_keys: PreKeyConfig,
    pub trust_new_identities: TrustNewIdentity,
    /// Keep outbound ciphertexts until acknowledged so they can be resent
    pub record_outbound: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            windows: WindowConfig::default(),
            sessions: SessionConfig::default(),
            pre_keys: PreKeyConfig::default(),
            trust_new_identities: TrustNewIdentity::default(),
            record_outbound: true,
        }
    }
}

impl ManagerConfig {
    /// Config with every default and the database at `path`
    pub fn with_store_path(path: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                path: path.into(),
                ..StoreConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse a JSON config document
    pub fn from_json_str(json: &str) -> ManagerResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: impl AsRef<Path>) -> ManagerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Reject values the manager cannot operate with
    pub fn validate(&self) -> ManagerResult<()> {
        if self.store.max_connections == 0 {
            return Err(ManagerError::Config(
                "store.maxConnections must be at least 1".to_string(),
            ));
        }
        if self.store.min_connections > self.store.max_connections {
            return Err(ManagerError::Config(format!(
                "store.minConnections ({}) exceeds store.maxConnections ({})",
                self.store.min_connections, self.store.max_connections
            )));
        }
        if self.windows.replay_window == 0 {
            return Err(ManagerError::Config(
                "windows.replayWindow must be at least 1".to_string(),
            ));
        }
        if self.windows.max_skip == 0 {
            return Err(ManagerError::Config(
                "windows.maxSkip must be at least 1".to_string(),
            ));
        }
        if self.pre_keys.replenishment_batch_size == 0 {
            return Err(ManagerError::Config(
                "preKeys.replenishmentBatchSize must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Database location and connection pool bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// SQLite database file, created if missing
    pub path: PathBuf,
    pub min_connections: u32,
    pub max_connections: u32,
    /// How long a caller waits for a pooled connection before `StoreBusy`
    pub acquire_timeout_ms: u64,
    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nochat-manager.db"),
            min_connections: 1,
            max_connections: 4,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 2_000,
        }
    }
}

/// Replay and skip windows for receiving chains
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WindowConfig {
    /// How many recent counters are remembered for duplicate detection
    pub replay_window: u32,
    /// Largest forward gap a receiving chain may skip in one step
    pub max_skip: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            replay_window: 128,
            max_skip: 1000,
        }
    }
}

/// Retention of superseded sessions
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Archived sessions older than this are purged
    pub archive_retention_secs: u64,
    /// Archived sessions kept per peer device, newest first
    pub max_archived_per_peer: u32,
}

impl SessionConfig {
    pub fn archive_retention(&self) -> Duration {
        Duration::from_secs(self.archive_retention_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            archive_retention_secs: 30 * 24 * 60 * 60,
            max_archived_per_peer: 40,
        }
    }
}

/// Configuration for prekey management
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PreKeyConfig {
    /// Number of one-time prekeys to generate initially
    pub initial_batch_size: u32,
    /// Number of one-time prekeys to generate when replenishing
    pub replenishment_batch_size: u32,
    /// Minimum number of prekeys before triggering replenishment
    pub min_prekey_count: u32,
    /// Maximum age of signed prekey in days before rotation
    pub signed_prekey_max_age_days: i64,
    /// Signed prekeys kept after rotation, for in-flight establishments
    pub signed_prekey_retention: u32,
}

impl Default for PreKeyConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: 100,
            replenishment_batch_size: 100,
            min_prekey_count: 25,
            signed_prekey_max_age_days: 7,
            signed_prekey_retention: 3,
        }
    }
}

/// Trust assigned to identity keys seen for the first time or after a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustNewIdentity {
    /// Trust every key, including changed ones
    Always,
    /// Trust the first key seen for an account; changed keys are untrusted
    #[default]
    OnFirstUse,
    /// Never trust a key until it is explicitly trusted
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::with_store_path("/tmp/x.db");
        assert!(config.validate().is_ok());
        assert!(config.record_outbound);
        assert_eq!(config.windows.max_skip, 1000);
        assert_eq!(config.trust_new_identities, TrustNewIdentity::OnFirstUse);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ManagerConfig::from_json_str(
            r#"{ "store": { "path": "/data/a.db", "maxConnections": 2 },
                 "windows": { "replayWindow": 16 },
                 "trustNewIdentities": "always" }"#,
        )
        .unwrap();

        assert_eq!(config.store.path, PathBuf::from("/data/a.db"));
        assert_eq!(config.store.max_connections, 2);
        assert_eq!(config.store.acquire_timeout_ms, 5_000);
        assert_eq!(config.windows.replay_window, 16);
        assert_eq!(config.windows.max_skip, 1000);
        assert_eq!(config.trust_new_identities, TrustNewIdentity::Always);
        assert!(config.record_outbound);
    }

    #[test]
    fn test_invalid_pool_bounds_rejected() {
        let err = ManagerConfig::from_json_str(
            r#"{ "store": { "minConnections": 5, "maxConnections": 2 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ManagerError::Config(_)));

        let err = ManagerConfig::from_json_str(r#"{ "windows": { "maxSkip": 0 } }"#).unwrap_err();
        assert!(matches!(err, ManagerError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.json");
        std::fs::write(&path, r#"{ "recordOutbound": false }"#).unwrap();

        let config = ManagerConfig::load(&path).unwrap();
        assert!(!config.record_outbound);
    }
}
