//! Account manager
//!
//! Wires one account's store, crypto, sessions, device registry, sync and
//! message pipeline together. Nothing is shared between two managers: each
//! owns its own pool, locks and device cache.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::ManagerConfig;
use crate::crypto::{
    shared_identity, CryptoProvider, IdentityKeyPair, PreKeyManager, PreKeyStatus, PublishedKeys,
    SharedIdentity, SignalCrypto,
};
use crate::error::{ManagerError, ManagerResult};
use crate::link::DeviceLinkInfo;
use crate::models::{AccountId, Device, DeviceAddress, GroupRecord, Identity, TrustLevel};
use crate::pipeline::MessagePipeline;
use crate::registry::DeviceRegistry;
use crate::session_manager::{PreKeySource, SessionManager};
use crate::store::{PickleKey, Store};
use crate::sync::{SyncCoordinator, SyncDelivery, SyncEvent, SyncMessage, SyncSnapshot};

/// Options for opening an [`AccountManager`]
pub struct AccountManagerBuilder {
    config: ManagerConfig,
    pickle_key: PickleKey,
    local: DeviceAddress,
    device_name: Option<String>,
    identity: Option<IdentityKeyPair>,
    crypto: Arc<dyn CryptoProvider>,
    directory: Option<Arc<dyn PreKeySource>>,
    transport: Option<mpsc::Sender<SyncDelivery>>,
}

impl AccountManagerBuilder {
    /// Use an existing identity instead of generating one on first open
    pub fn identity(mut self, identity: IdentityKeyPair) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn crypto(mut self, crypto: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Where bundles of remote devices are fetched from
    pub fn directory(mut self, directory: Arc<dyn PreKeySource>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Channel to the transport that carries sync messages to the account's
    /// other devices
    pub fn transport(mut self, transport: mpsc::Sender<SyncDelivery>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Open the store, creating the identity and prekeys on first use
    pub async fn open(self) -> ManagerResult<AccountManager> {
        self.config.validate()?;
        let store = Store::open(&self.config.store, self.pickle_key).await?;

        match self.init(store.clone()).await {
            Ok(manager) => Ok(manager),
            Err(e) => {
                store.close().await;
                Err(e)
            }
        }
    }

    async fn init(self, store: Store) -> ManagerResult<AccountManager> {
        let Self {
            config,
            local,
            device_name,
            identity,
            crypto,
            directory,
            transport,
            ..
        } = self;

        let mut tx = store.begin().await?;
        let key_pair = match tx.load_local_identity().await? {
            Some(stored) => {
                if stored.account != local.account {
                    return Err(ManagerError::InvalidOperation(format!(
                        "store belongs to account {}, not {}",
                        stored.account, local.account
                    )));
                }
                if let Some(imported) = &identity {
                    if imported.public_key_bytes() != stored.key_pair.public_key_bytes() {
                        return Err(ManagerError::IdentityMismatch(local));
                    }
                }
                stored.key_pair
            }
            None => {
                let key_pair = identity.unwrap_or_else(|| crypto.generate_identity());
                tx.save_local_identity(&local.account, &key_pair).await?;
                tracing::info!(
                    "Created identity {} for {}",
                    key_pair.fingerprint(),
                    local
                );
                key_pair
            }
        };

        match tx.get_device(&local).await? {
            Some(device) if !device.live => {
                tracing::warn!("Opening {} which was revoked", local);
            }
            Some(_) => tx.touch_device(&local).await?,
            None => {
                tx.upsert_device(&Device::new(
                    local.clone(),
                    key_pair.public_key_bytes(),
                    device_name,
                ))
                .await?;
            }
        }

        let identity = shared_identity(key_pair);
        let pre_keys = Arc::new(PreKeyManager::new(
            local.clone(),
            identity.clone(),
            crypto.clone(),
            config.pre_keys,
        ));
        let status = pre_keys.ensure_initialized(&mut tx).await?;
        tx.commit().await?;
        tracing::debug!(
            "{} has {} one-time prekeys available",
            local,
            status.available_one_time
        );

        let sync = Arc::new(SyncCoordinator::new(local.clone(), store.clone(), transport));
        let sessions = Arc::new(SessionManager::new(
            local.clone(),
            store.clone(),
            crypto.clone(),
            identity.clone(),
            pre_keys.clone(),
            directory,
            config.windows,
            config.sessions,
            config.trust_new_identities,
        ));
        let registry = Arc::new(DeviceRegistry::new(
            local.clone(),
            store.clone(),
            sessions.clone(),
            sync.clone(),
        ));
        let pipeline = MessagePipeline::new(
            local.clone(),
            store.clone(),
            sessions.clone(),
            registry.clone(),
            sync.clone(),
            config.record_outbound,
        );

        tracing::info!("Opened account manager for {}", local);
        Ok(AccountManager {
            local,
            store,
            crypto,
            identity,
            pre_keys,
            sessions,
            registry,
            sync,
            pipeline,
        })
    }
}

/// Session, device and identity management for one device of one account
pub struct AccountManager {
    local: DeviceAddress,
    store: Store,
    crypto: Arc<dyn CryptoProvider>,
    identity: SharedIdentity,
    pre_keys: Arc<PreKeyManager>,
    sessions: Arc<SessionManager>,
    registry: Arc<DeviceRegistry>,
    sync: Arc<SyncCoordinator>,
    pipeline: MessagePipeline,
}

impl AccountManager {
    pub fn builder(
        config: ManagerConfig,
        pickle_key: PickleKey,
        local: DeviceAddress,
    ) -> AccountManagerBuilder {
        AccountManagerBuilder {
            config,
            pickle_key,
            local,
            device_name: None,
            identity: None,
            crypto: Arc::new(SignalCrypto),
            directory: None,
            transport: None,
        }
    }

    pub fn local(&self) -> &DeviceAddress {
        &self.local
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn sync(&self) -> &Arc<SyncCoordinator> {
        &self.sync
    }

    pub fn pipeline(&self) -> &MessagePipeline {
        &self.pipeline
    }

    pub fn pre_keys(&self) -> &Arc<PreKeyManager> {
        &self.pre_keys
    }

    /// Public half of the account identity
    pub async fn identity_key(&self) -> Vec<u8> {
        self.identity.read().await.public_key_bytes()
    }

    /// Get the identity key fingerprint for verification
    pub async fn fingerprint(&self) -> String {
        self.identity.read().await.fingerprint()
    }

    // ========================================================================
    // Prekeys
    // ========================================================================

    pub async fn pre_key_status(&self) -> ManagerResult<PreKeyStatus> {
        let mut tx = self.store.begin().await?;
        self.pre_keys.status(&mut tx).await
    }

    /// Replenish one-time prekeys and rotate the signed prekey as needed
    pub async fn maintain_pre_keys(&self) -> ManagerResult<PreKeyStatus> {
        let mut tx = self.store.begin().await?;
        let status = self.pre_keys.maintain(&mut tx).await?;
        tx.commit().await?;
        Ok(status)
    }

    /// Keys the directory does not have yet
    pub async fn publishable_keys(&self) -> ManagerResult<PublishedKeys> {
        let mut tx = self.store.begin().await?;
        self.pre_keys.publishable_keys(&mut tx).await
    }

    pub async fn mark_pre_keys_published(&self, key_ids: &[u32]) -> ManagerResult<()> {
        let mut tx = self.store.begin().await?;
        self.pre_keys.mark_published(&mut tx, key_ids).await?;
        tx.commit().await
    }

    // ========================================================================
    // Identities
    // ========================================================================

    /// Last identity observed for a remote account
    pub async fn identity(&self, account: &AccountId) -> ManagerResult<Option<Identity>> {
        let mut tx = self.store.begin().await?;
        tx.get_identity(account).await
    }

    /// Set how far a remote account's current identity key is trusted.
    /// Returns false if no identity is known for the account.
    pub async fn trust(&self, account: &AccountId, level: TrustLevel) -> ManagerResult<bool> {
        let mut tx = self.store.begin().await?;
        let updated = tx.set_trust(account, level).await?;
        tx.commit().await?;

        if updated {
            tracing::info!("Trust of {} set to {:?}", account, level);
        }
        Ok(updated)
    }

    /// Replace the account identity
    ///
    /// Every session is invalidated and every prekey retired; peers must
    /// establish new sessions against the new keys. The new identity is
    /// announced to the account's other devices. The identity in use changes
    /// only together with the commit, so a failed or cancelled call keeps the
    /// old one in memory and on disk.
    pub async fn reregister(&self) -> ManagerResult<()> {
        let new_identity = self.crypto.generate_identity();

        let mut tx = self.store.begin().await?;
        tx.save_local_identity(&self.local.account, &new_identity)
            .await?;
        let invalidated = tx.invalidate_all_sessions().await?;
        self.pre_keys.reset(&mut tx, &new_identity).await?;

        tx.upsert_device(&Device::new(
            self.local.clone(),
            new_identity.public_key_bytes(),
            None,
        ))
        .await?;
        let device = tx
            .get_device(&self.local)
            .await?
            .ok_or_else(|| ManagerError::DeviceNotFound(self.local.clone()))?;

        {
            let mut current = self.identity.write().await;
            tx.commit().await?;
            *current = new_identity.clone();
        }
        tracing::info!("Invalidated {} sessions for identity rotation", invalidated);

        self.registry.invalidate(&self.local.account).await;
        self.sync
            .publish(SyncEvent::DeviceLinked { device })
            .await?;
        tracing::info!(
            "Re-registered {} with identity {}",
            self.local,
            new_identity.fingerprint()
        );
        Ok(())
    }

    // ========================================================================
    // Devices & sync
    // ========================================================================

    /// Link the device presenting `uri` under the account's next device id
    pub async fn link_device(&self, uri: &str, name: Option<&str>) -> ManagerResult<Device> {
        let info = DeviceLinkInfo::parse(uri)?;

        let mut tx = self.store.begin().await?;
        let device_id = tx.next_device_id(&self.local.account).await?;
        drop(tx);

        let address = DeviceAddress {
            account: self.local.account.clone(),
            device: device_id,
        };
        tracing::info!(
            "Linking device {} ({}) as {}",
            info.device_identifier,
            crate::crypto::fingerprint(&info.device_key),
            address
        );
        self.registry
            .link(Device::new(address, info.device_key, name.map(str::to_string)))
            .await
    }

    /// Apply a sync message from another device of this account
    pub async fn handle_sync(&self, from: &DeviceAddress, bytes: &[u8]) -> ManagerResult<()> {
        let message = SyncMessage::from_bytes(bytes)?;
        if message.origin != *from || from.account != self.local.account || *from == self.local {
            return Err(ManagerError::InvalidOperation(format!(
                "sync message from {} claiming origin {}",
                from, message.origin
            )));
        }
        match self.registry.device(from).await? {
            Some(device) if !device.live => return Err(ManagerError::DeviceRevoked(from.clone())),
            Some(_) => {}
            None => return Err(ManagerError::DeviceNotFound(from.clone())),
        }

        match message.event.clone() {
            SyncEvent::DeviceLinked { device } => {
                if device.address.account != self.local.account {
                    return Err(ManagerError::InvalidOperation(format!(
                        "{} announced foreign device {}",
                        from, device.address
                    )));
                }
                self.registry.apply_linked(device).await?;
            }
            SyncEvent::DeviceRevoked { address } => {
                if address.account != self.local.account {
                    return Err(ManagerError::InvalidOperation(format!(
                        "{} revoked foreign device {}",
                        from, address
                    )));
                }
                self.registry.apply_revoked(&address).await?;
            }
            SyncEvent::SnapshotRequest => {
                self.sync.respond_to_snapshot_request(from).await?;
            }
            SyncEvent::Snapshot { snapshot } => {
                self.apply_snapshot(snapshot).await?;
            }
            SyncEvent::SessionEstablished { .. } | SyncEvent::ReadReceipt { .. } => {
                self.sync.relay_local(message);
            }
        }
        Ok(())
    }

    /// Reconcile this device's view of the account's devices with a snapshot
    /// from another device. Returns the number of devices changed.
    pub async fn apply_snapshot(&self, snapshot: SyncSnapshot) -> ManagerResult<usize> {
        let mut changed = 0;
        for device in &snapshot.devices {
            if device.address.account != self.local.account || device.address == self.local {
                continue;
            }
            let known = self.registry.device(&device.address).await?;

            if device.live {
                let current = known
                    .as_ref()
                    .map(|k| k.live && k.identity_key == device.identity_key)
                    .unwrap_or(false);
                if current {
                    continue;
                }
                match self.registry.apply_linked(device.clone()).await {
                    Ok(_) => changed += 1,
                    Err(ManagerError::IdentityMismatch(address)) => {
                        tracing::warn!("Snapshot key for {} differs from ours; kept ours", address);
                    }
                    Err(e) => return Err(e),
                }
            } else if known.map(|k| k.live).unwrap_or(false) {
                self.registry.apply_revoked(&device.address).await?;
                changed += 1;
            }
        }

        self.sync.notify_local(SyncEvent::Snapshot { snapshot });
        tracing::info!("Applied sync snapshot: {} devices changed", changed);
        Ok(changed)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    pub async fn save_group(&self, group: &GroupRecord) -> ManagerResult<()> {
        let mut tx = self.store.begin().await?;
        tx.upsert_group(group).await?;
        tx.commit().await
    }

    pub async fn group(&self, group_id: &[u8]) -> ManagerResult<Option<GroupRecord>> {
        let mut tx = self.store.begin().await?;
        tx.get_group(group_id).await
    }

    pub async fn groups(&self) -> ManagerResult<Vec<GroupRecord>> {
        let mut tx = self.store.begin().await?;
        tx.list_groups().await
    }

    pub async fn delete_group(&self, group_id: &[u8]) -> ManagerResult<bool> {
        let mut tx = self.store.begin().await?;
        let deleted = tx.delete_group(group_id).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    /// Close the store. The manager must not be used afterwards.
    pub async fn close(&self) {
        self.store.close().await;
        tracing::info!("Closed account manager for {}", self.local);
    }
}
