//! Device registry
//!
//! The authoritative list of devices per account. Reads are served from a
//! cache that is dropped whenever a sync event reports a device change; it is
//! never refreshed on a timer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::error::{ManagerError, ManagerResult};
use crate::models::{AccountId, Device, DeviceAddress, DeviceId};
use crate::session_manager::SessionManager;
use crate::store::{Store, StoreTx};
use crate::sync::{SyncCoordinator, SyncEvent, SyncMessage};

#[derive(Debug, Default)]
struct CachedDevices {
    accounts: HashMap<AccountId, Vec<Device>>,
    /// Bumped on every invalidation
    generation: u64,
}

impl CachedDevices {
    fn remove(&mut self, account: &AccountId) {
        self.accounts.remove(account);
        self.generation = self.generation.wrapping_add(1);
    }

    fn clear(&mut self) {
        self.accounts.clear();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Cache a list read from the store at `generation`. Refused if an
    /// invalidation happened since, as the list may already be stale.
    fn fill(&mut self, account: AccountId, devices: Vec<Device>, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.accounts.insert(account, devices);
        true
    }
}

type DeviceCache = Arc<RwLock<CachedDevices>>;

pub struct DeviceRegistry {
    local: DeviceAddress,
    store: Store,
    sessions: Arc<SessionManager>,
    sync: Arc<SyncCoordinator>,
    cache: DeviceCache,
    invalidator: JoinHandle<()>,
}

impl DeviceRegistry {
    /// Must be called inside a tokio runtime: the cache listens to sync
    /// events on a background task
    pub fn new(
        local: DeviceAddress,
        store: Store,
        sessions: Arc<SessionManager>,
        sync: Arc<SyncCoordinator>,
    ) -> Self {
        let cache = DeviceCache::default();
        let invalidator = tokio::spawn(invalidate_on_events(sync.subscribe(), cache.clone()));

        Self {
            local,
            store,
            sessions,
            sync,
            cache,
            invalidator,
        }
    }

    /// Every device of `account`, live or revoked
    pub async fn devices(&self, account: &AccountId) -> ManagerResult<Vec<Device>> {
        let generation = {
            let cache = self.cache.read().await;
            if let Some(devices) = cache.accounts.get(account) {
                return Ok(devices.clone());
            }
            cache.generation
        };

        let mut tx = self.store.begin().await?;
        let devices = tx.list_devices(account).await?;
        drop(tx);

        self.cache
            .write()
            .await
            .fill(account.clone(), devices.clone(), generation);
        Ok(devices)
    }

    pub async fn live_devices(&self, account: &AccountId) -> ManagerResult<Vec<Device>> {
        Ok(self
            .devices(account)
            .await?
            .into_iter()
            .filter(|device| device.live)
            .collect())
    }

    pub async fn device(&self, address: &DeviceAddress) -> ManagerResult<Option<Device>> {
        Ok(self
            .devices(&address.account)
            .await?
            .into_iter()
            .find(|device| device.address == *address))
    }

    /// Drop the cached devices of `account`
    pub async fn invalidate(&self, account: &AccountId) {
        self.cache.write().await.remove(account);
    }

    /// Add a device, or revive a revoked one, and announce it to the
    /// account's other devices if it is one of ours
    ///
    /// A live device keeps its identity key; linking it again with a
    /// different key fails with `IdentityMismatch`.
    pub async fn link(&self, device: Device) -> ManagerResult<Device> {
        let linked = self.store_linked(&device).await?;

        if linked.address.account == self.local.account {
            self.sync
                .publish(SyncEvent::DeviceLinked {
                    device: linked.clone(),
                })
                .await?;
        }
        tracing::info!("Linked device {}", linked.address);
        Ok(linked)
    }

    /// Apply a link announced by another of the account's devices
    pub async fn apply_linked(&self, device: Device) -> ManagerResult<Device> {
        let linked = self.store_linked(&device).await?;
        self.sync.notify_local(SyncEvent::DeviceLinked {
            device: linked.clone(),
        });
        Ok(linked)
    }

    async fn store_linked(&self, device: &Device) -> ManagerResult<Device> {
        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.get_device(&device.address).await? {
            if existing.live && existing.identity_key != device.identity_key {
                return Err(ManagerError::IdentityMismatch(device.address.clone()));
            }
        }
        let mut device = device.clone();
        device.live = true;
        tx.upsert_device(&device).await?;
        let stored = tx
            .get_device(&device.address)
            .await?
            .ok_or_else(|| ManagerError::DeviceNotFound(device.address.clone()))?;
        tx.commit().await?;

        self.invalidate(&stored.address.account).await;
        Ok(stored)
    }

    /// Revoke one of this account's other devices
    ///
    /// The device is marked dead and all sessions with it are invalidated in
    /// the same transaction, then the revocation is announced.
    pub async fn revoke(&self, device_id: DeviceId) -> ManagerResult<()> {
        let address = DeviceAddress {
            account: self.local.account.clone(),
            device: device_id,
        };
        if address == self.local {
            return Err(ManagerError::InvalidOperation(
                "a device cannot revoke itself".to_string(),
            ));
        }

        self.store_revoked(&address).await?;
        self.sync
            .publish(SyncEvent::DeviceRevoked {
                address: address.clone(),
            })
            .await?;
        tracing::info!("Revoked device {}", address);
        Ok(())
    }

    /// Apply a revocation announced by another of the account's devices, or
    /// by a remote account about one of its devices
    pub async fn apply_revoked(&self, address: &DeviceAddress) -> ManagerResult<()> {
        if *address == self.local {
            tracing::error!("Another device revoked this device ({})", address);
        }
        self.store_revoked(address).await?;
        self.sync.notify_local(SyncEvent::DeviceRevoked {
            address: address.clone(),
        });
        Ok(())
    }

    async fn store_revoked(&self, address: &DeviceAddress) -> ManagerResult<()> {
        let _guard = self.sessions.lock(address).await;
        let mut tx = self.store.begin().await?;
        if !tx.set_device_live(address, false).await? {
            return Err(ManagerError::DeviceNotFound(address.clone()));
        }
        self.sessions.invalidate_device(&mut tx, address).await?;
        tx.commit().await?;

        self.invalidate(&address.account).await;
        Ok(())
    }

    /// Register a device first heard from through a session, or bump its
    /// last-seen time. Returns true if the device was new.
    pub(crate) async fn observe_device(
        &self,
        tx: &mut StoreTx,
        address: &DeviceAddress,
        identity_key: &[u8],
    ) -> ManagerResult<bool> {
        match tx.get_device(address).await? {
            Some(_) => {
                tx.touch_device(address).await?;
                Ok(false)
            }
            None => {
                tx.upsert_device(&Device::new(address.clone(), identity_key.to_vec(), None))
                    .await?;
                tracing::debug!("Registered device {}", address);
                Ok(true)
            }
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.invalidator.abort();
    }
}

async fn invalidate_on_events(
    mut events: broadcast::Receiver<SyncMessage>,
    cache: DeviceCache,
) {
    loop {
        match events.recv().await {
            Ok(message) => {
                let account = match &message.event {
                    SyncEvent::DeviceLinked { device } => device.address.account.clone(),
                    SyncEvent::DeviceRevoked { address } => address.account.clone(),
                    SyncEvent::SessionEstablished { session } => session.peer.account.clone(),
                    SyncEvent::Snapshot { .. } => {
                        cache.write().await.clear();
                        continue;
                    }
                    _ => continue,
                };
                cache.write().await.remove(&account);
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!("Device cache missed {} sync events; clearing", missed);
                cache.write().await.clear();
            }
            Err(RecvError::Closed) => break,
        }
    }
}
