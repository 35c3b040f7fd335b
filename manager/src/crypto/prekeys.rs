//! Prekey Bundle Management
//!
//! Generation, storage and replenishment of this device's prekeys:
//!
//! - **Signed Prekeys**: Rotated periodically (~7 days), signed by identity key.
//!   The last few are retained so establishments in flight still complete.
//! - **One-Time Prekeys**: Single-use keys for forward secrecy, replenished as
//!   needed. Consumed keys leave a tombstone so a second use is recognized.
//!
//! All state lives in the store; every operation runs inside the caller's
//! transaction.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PreKeyConfig;
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey};
use crate::crypto::provider::CryptoProvider;
use crate::crypto::x3dh::PreKeyBundle;
use crate::crypto::SharedIdentity;
use crate::error::{ManagerError, ManagerResult};
use crate::models::DeviceAddress;
use crate::store::StoreTx;

/// Keys to hand to the directory that serves bundles to other devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedKeys {
    pub address: DeviceAddress,
    pub identity_key: Vec<u8>,
    pub signed_prekey: SignedPreKey,
    pub one_time_prekeys: Vec<OneTimePreKey>,
}

/// Snapshot of the local prekey supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreKeyStatus {
    pub available_one_time: u32,
    pub signed_prekey_id: Option<u32>,
    pub needs_replenishment: bool,
    pub needs_rotation: bool,
}

/// Manages prekey generation and lifecycle
pub struct PreKeyManager {
    /// The device these keys belong to
    local: DeviceAddress,
    /// Our identity key pair (for signing prekeys)
    identity: SharedIdentity,
    crypto: Arc<dyn CryptoProvider>,
    config: PreKeyConfig,
}

impl PreKeyManager {
    pub fn new(
        local: DeviceAddress,
        identity: SharedIdentity,
        crypto: Arc<dyn CryptoProvider>,
        config: PreKeyConfig,
    ) -> Self {
        Self {
            local,
            identity,
            crypto,
            config,
        }
    }

    /// Make sure a signed prekey exists and the one-time supply is topped up
    pub async fn ensure_initialized(&self, tx: &mut StoreTx) -> ManagerResult<PreKeyStatus> {
        if tx.latest_signed_pre_key().await?.is_none() {
            self.rotate_signed_prekey(tx).await?;
        }
        if tx.max_pre_key_id().await?.is_none() {
            self.generate(tx, self.config.initial_batch_size).await?;
        }
        self.maintain(tx).await
    }

    /// Replenish and rotate as the configuration demands
    pub async fn maintain(&self, tx: &mut StoreTx) -> ManagerResult<PreKeyStatus> {
        let status = self.status(tx).await?;
        if status.needs_replenishment {
            self.replenish(tx).await?;
        }
        if status.needs_rotation {
            self.rotate_signed_prekey(tx).await?;
        }
        self.status(tx).await
    }

    pub async fn status(&self, tx: &mut StoreTx) -> ManagerResult<PreKeyStatus> {
        let available_one_time = tx.count_available_pre_keys().await?;
        let signed = tx.latest_signed_pre_key().await?;

        Ok(PreKeyStatus {
            available_one_time,
            signed_prekey_id: signed.as_ref().map(|s| s.signed.key_id),
            needs_replenishment: available_one_time < self.config.min_prekey_count,
            needs_rotation: signed
                .map(|s| s.signed.is_expired(self.config.signed_prekey_max_age_days))
                .unwrap_or(true),
        })
    }

    /// Generate more one-time prekeys
    ///
    /// Returns the new prekeys for publishing.
    pub async fn replenish(&self, tx: &mut StoreTx) -> ManagerResult<Vec<OneTimePreKey>> {
        let keys = self
            .generate(tx, self.config.replenishment_batch_size)
            .await?;
        tracing::info!(
            "Generated {} one-time prekeys for {}",
            keys.len(),
            self.local
        );
        Ok(keys)
    }

    async fn generate(&self, tx: &mut StoreTx, count: u32) -> ManagerResult<Vec<OneTimePreKey>> {
        let start_id = match tx.max_pre_key_id().await? {
            Some(max) => max.checked_add(1).ok_or_else(|| {
                ManagerError::InvalidOperation("one-time prekey ids exhausted".to_string())
            })?,
            None => 1,
        };

        let keys: Vec<(u32, Curve25519KeyPair)> = (0..count)
            .map(|i| (start_id.saturating_add(i), self.crypto.generate_key_pair()))
            .collect();
        tx.insert_pre_keys(&keys).await?;

        Ok(keys
            .iter()
            .map(|(id, kp)| OneTimePreKey::new(*id, kp))
            .collect())
    }

    /// Rotate the signed prekey
    ///
    /// Returns the new signed prekey for publishing.
    pub async fn rotate_signed_prekey(&self, tx: &mut StoreTx) -> ManagerResult<SignedPreKey> {
        let identity = self.identity.read().await.clone();
        self.rotate_signed_prekey_for(tx, &identity).await
    }

    async fn rotate_signed_prekey_for(
        &self,
        tx: &mut StoreTx,
        identity: &IdentityKeyPair,
    ) -> ManagerResult<SignedPreKey> {
        let key_id = match tx.latest_signed_pre_key().await? {
            Some(latest) => latest.signed.key_id.wrapping_add(1).max(1),
            None => 1,
        };

        let key_pair = self.crypto.generate_key_pair();
        let signed = SignedPreKey::new(key_id, &key_pair, identity);
        tx.insert_signed_pre_key(&signed, &key_pair).await?;
        let pruned = tx
            .prune_signed_pre_keys(self.config.signed_prekey_retention.max(1))
            .await?;

        tracing::info!(
            "Rotated signed prekey for {} to id {} ({} retired)",
            self.local,
            key_id,
            pruned
        );
        Ok(signed)
    }

    /// Retire every prekey and start over under `identity`, which replaces
    /// the current one once `tx` commits
    pub async fn reset(
        &self,
        tx: &mut StoreTx,
        identity: &IdentityKeyPair,
    ) -> ManagerResult<PreKeyStatus> {
        tx.retire_pre_keys().await?;
        self.rotate_signed_prekey_for(tx, identity).await?;
        tx.prune_signed_pre_keys(1).await?;
        self.generate(tx, self.config.initial_batch_size).await?;
        self.status(tx).await
    }

    /// Our current bundle, offering the oldest available one-time key
    pub async fn bundle(&self, tx: &mut StoreTx) -> ManagerResult<PreKeyBundle> {
        let signed = tx.latest_signed_pre_key().await?.ok_or_else(|| {
            ManagerError::NoPreKeyAvailable(format!("{} has no signed prekey", self.local))
        })?;
        let one_time_prekey = tx.available_pre_keys(false).await?.into_iter().next();

        Ok(PreKeyBundle {
            address: self.local.clone(),
            identity_key: self.identity.read().await.public_key_bytes(),
            signed_prekey: signed.signed,
            one_time_prekey,
        })
    }

    /// Keys not yet handed to the directory
    pub async fn publishable_keys(&self, tx: &mut StoreTx) -> ManagerResult<PublishedKeys> {
        let signed = tx.latest_signed_pre_key().await?.ok_or_else(|| {
            ManagerError::NoPreKeyAvailable(format!("{} has no signed prekey", self.local))
        })?;

        Ok(PublishedKeys {
            address: self.local.clone(),
            identity_key: self.identity.read().await.public_key_bytes(),
            signed_prekey: signed.signed,
            one_time_prekeys: tx.available_pre_keys(true).await?,
        })
    }

    pub async fn mark_published(&self, tx: &mut StoreTx, key_ids: &[u32]) -> ManagerResult<()> {
        tx.mark_pre_keys_published(key_ids).await
    }

    /// Consume a one-time prekey named by an incoming key agreement
    ///
    /// Returns the key pair; a second consumption of the same key fails with
    /// `PreKeyReused`, an id never issued with `NoPreKeyAvailable`.
    pub async fn consume(&self, tx: &mut StoreTx, key_id: u32) -> ManagerResult<Curve25519KeyPair> {
        let record = tx.get_pre_key(key_id).await?.ok_or_else(|| {
            ManagerError::NoPreKeyAvailable(format!(
                "one-time prekey {} of {} is unknown",
                key_id, self.local
            ))
        })?;

        let key_pair = match record.key_pair {
            Some(key_pair) if tx.mark_pre_key_consumed(key_id).await? => key_pair,
            _ => {
                tracing::warn!("One-time prekey {} of {} offered again", key_id, self.local);
                return Err(ManagerError::PreKeyReused {
                    owner: self.local.clone(),
                    key_id,
                });
            }
        };

        Ok(key_pair)
    }

    /// The private half of a retained signed prekey
    pub async fn signed_key_pair(
        &self,
        tx: &mut StoreTx,
        key_id: u32,
    ) -> ManagerResult<Curve25519KeyPair> {
        tx.get_signed_pre_key(key_id)
            .await?
            .map(|stored| stored.key_pair)
            .ok_or_else(|| {
                ManagerError::NoPreKeyAvailable(format!(
                    "signed prekey {} of {} is no longer retained",
                    key_id, self.local
                ))
            })
    }

    /// Get the identity key fingerprint for verification
    pub async fn fingerprint(&self) -> String {
        self.identity.read().await.fingerprint()
    }
}
