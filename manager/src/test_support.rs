//! Helpers shared by the crate's tests: an in-memory prekey directory and
//! accounts opened on temporary databases.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{ManagerConfig, PreKeyConfig};
use crate::crypto::{PreKeyBundle, PublishedKeys};
use crate::error::ManagerResult;
use crate::link::DeviceLinkInfo;
use crate::manager::AccountManager;
use crate::models::DeviceAddress;
use crate::session_manager::{BoxFuture, PreKeySource};

/// Serves published keys, handing out each one-time prekey once
#[derive(Clone, Default)]
pub(crate) struct MemoryDirectory {
    keys: Arc<Mutex<HashMap<DeviceAddress, PublishedKeys>>>,
}

impl MemoryDirectory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Replace the identity and signed prekey of a device and add its
    /// one-time prekeys
    pub(crate) fn publish(&self, keys: PublishedKeys) {
        let mut directory = self.keys.lock().unwrap();
        match directory.get_mut(&keys.address) {
            Some(existing) if existing.identity_key == keys.identity_key => {
                existing.signed_prekey = keys.signed_prekey;
                existing.one_time_prekeys.extend(keys.one_time_prekeys);
            }
            _ => {
                directory.insert(keys.address.clone(), keys);
            }
        }
    }

    pub(crate) fn available(&self, address: &DeviceAddress) -> usize {
        self.keys
            .lock()
            .unwrap()
            .get(address)
            .map(|keys| keys.one_time_prekeys.len())
            .unwrap_or(0)
    }

    fn take_bundle(&self, address: &DeviceAddress) -> Option<PreKeyBundle> {
        let mut directory = self.keys.lock().unwrap();
        let keys = directory.get_mut(address)?;
        let one_time_prekey = if keys.one_time_prekeys.is_empty() {
            None
        } else {
            Some(keys.one_time_prekeys.remove(0))
        };
        Some(PreKeyBundle {
            address: address.clone(),
            identity_key: keys.identity_key.clone(),
            signed_prekey: keys.signed_prekey.clone(),
            one_time_prekey,
        })
    }
}

impl PreKeySource for MemoryDirectory {
    fn fetch_bundle<'a>(
        &'a self,
        device: &'a DeviceAddress,
    ) -> BoxFuture<'a, ManagerResult<Option<PreKeyBundle>>> {
        let bundle = self.take_bundle(device);
        Box::pin(async move { Ok(bundle) })
    }
}

pub(crate) fn test_config(dir: &tempfile::TempDir, account: &str, device: u32) -> ManagerConfig {
    ManagerConfig {
        pre_keys: PreKeyConfig {
            initial_batch_size: 10,
            replenishment_batch_size: 10,
            min_prekey_count: 3,
            ..PreKeyConfig::default()
        },
        ..ManagerConfig::with_store_path(dir.path().join(format!("{}-{}.db", account, device)))
    }
}

/// Open `account.device` with a fresh identity and publish its keys
pub(crate) async fn open_account(
    dir: &tempfile::TempDir,
    account: &str,
    device: u32,
    directory: &MemoryDirectory,
) -> AccountManager {
    let manager = AccountManager::builder(
        test_config(dir, account, device),
        [7; 32],
        DeviceAddress::new(account, device),
    )
    .directory(Arc::new(directory.clone()))
    .open()
    .await
    .unwrap();

    publish(&manager, directory).await;
    manager
}

pub(crate) async fn publish(manager: &AccountManager, directory: &MemoryDirectory) {
    let keys = manager.publishable_keys().await.unwrap();
    let ids: Vec<u32> = keys.one_time_prekeys.iter().map(|k| k.key_id).collect();
    directory.publish(keys);
    manager.mark_pre_keys_published(&ids).await.unwrap();
}

/// Open a new device of `primary`'s account and link it the way a user
/// would: the new device shows its link URI and the primary scans it
pub(crate) async fn open_linked(
    dir: &tempfile::TempDir,
    primary: &AccountManager,
    device: u32,
    directory: &MemoryDirectory,
) -> AccountManager {
    let account = primary.local().account.as_str().to_string();
    let linked = open_account(dir, &account, device, directory).await;

    let uri = DeviceLinkInfo::new(format!("provision-{}", device), linked.identity_key().await).to_uri();
    let device = primary.link_device(&uri, Some("linked")).await.unwrap();
    assert_eq!(device.address, *linked.local());

    let snapshot = primary.sync().snapshot().await.unwrap();
    linked.apply_snapshot(snapshot).await.unwrap();
    linked
}
