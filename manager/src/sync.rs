//! Propagation of account state across this account's own devices
//!
//! Events are delivered two ways: to local subscribers over a broadcast
//! channel, and to every other live device of the account through the
//! transport channel. Transport delivery is best effort. A device that missed
//! events asks for a [`SyncSnapshot`] instead of a replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::crypto::CryptoError;
use crate::error::ManagerResult;
use crate::models::{Device, DeviceAddress, SessionSummary};
use crate::store::Store;

const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// A state change worth telling the account's other devices about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    SessionEstablished { session: SessionSummary },
    DeviceLinked { device: Device },
    DeviceRevoked { address: DeviceAddress },
    ReadReceipt { peer: DeviceAddress, counter: u32 },
    SnapshotRequest,
    Snapshot { snapshot: SyncSnapshot },
}

/// Full device and session state of one device, for reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub devices: Vec<Device>,
    pub sessions: Vec<SessionSummary>,
    pub taken_at: DateTime<Utc>,
}

/// An event and the device it originated on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub origin: DeviceAddress,
    pub event: SyncEvent,
}

impl SyncMessage {
    pub fn to_bytes(&self) -> ManagerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ManagerResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::MalformedMessage(format!("sync message: {}", e)).into())
    }
}

/// A sync message bound for one of the account's devices. The transport
/// encrypts it for `recipient` like any other message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDelivery {
    pub recipient: DeviceAddress,
    pub message: SyncMessage,
}

/// Which devices a publish reached the transport for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub queued: Vec<DeviceAddress>,
    /// Devices whose delivery was dropped because the transport was full or gone
    pub dropped: Vec<DeviceAddress>,
}

pub struct SyncCoordinator {
    local: DeviceAddress,
    store: Store,
    local_events: broadcast::Sender<SyncMessage>,
    transport: Option<mpsc::Sender<SyncDelivery>>,
}

impl SyncCoordinator {
    pub fn new(
        local: DeviceAddress,
        store: Store,
        transport: Option<mpsc::Sender<SyncDelivery>>,
    ) -> Self {
        let (local_events, _) = broadcast::channel(LOCAL_CHANNEL_CAPACITY);
        Self {
            local,
            store,
            local_events,
            transport,
        }
    }

    pub fn local(&self) -> &DeviceAddress {
        &self.local
    }

    /// Receive every event published or applied on this device
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.local_events.subscribe()
    }

    /// Announce an event locally and to every other live device of the account
    pub async fn publish(&self, event: SyncEvent) -> ManagerResult<BroadcastReport> {
        let message = self.notify_local(event);

        let mut tx = self.store.begin().await?;
        let devices = tx.list_devices(&self.local.account).await?;
        drop(tx);

        let recipients = devices
            .into_iter()
            .filter(|device| device.live && device.address != self.local)
            .map(|device| device.address);

        Ok(self.deliver(recipients, &message))
    }

    /// Announce an event to local subscribers only, e.g. one that arrived
    /// from another device and must not be sent on again
    pub fn notify_local(&self, event: SyncEvent) -> SyncMessage {
        let message = SyncMessage {
            origin: self.local.clone(),
            event,
        };
        // No subscribers is fine
        let _ = self.local_events.send(message.clone());
        message
    }

    /// Relay a message from another device to local subscribers
    pub(crate) fn relay_local(&self, message: SyncMessage) {
        let _ = self.local_events.send(message);
    }

    /// Ask the account's other devices for their state
    pub async fn request_snapshot(&self) -> ManagerResult<BroadcastReport> {
        tracing::info!("Requesting sync snapshot for {}", self.local);
        self.publish(SyncEvent::SnapshotRequest).await
    }

    /// This device's view of the account's devices and its active sessions
    pub async fn snapshot(&self) -> ManagerResult<SyncSnapshot> {
        let mut tx = self.store.begin().await?;
        Ok(SyncSnapshot {
            devices: tx.list_devices(&self.local.account).await?,
            sessions: tx.list_active_sessions().await?,
            taken_at: Utc::now(),
        })
    }

    /// Send our snapshot to the device that asked for it. Returns false if
    /// the transport could not take it.
    pub async fn respond_to_snapshot_request(
        &self,
        requester: &DeviceAddress,
    ) -> ManagerResult<bool> {
        let message = SyncMessage {
            origin: self.local.clone(),
            event: SyncEvent::Snapshot {
                snapshot: self.snapshot().await?,
            },
        };
        let report = self.deliver(std::iter::once(requester.clone()), &message);
        Ok(report.dropped.is_empty() && !report.queued.is_empty())
    }

    fn deliver(
        &self,
        recipients: impl IntoIterator<Item = DeviceAddress>,
        message: &SyncMessage,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for recipient in recipients {
            let Some(transport) = &self.transport else {
                report.dropped.push(recipient);
                continue;
            };
            let delivery = SyncDelivery {
                recipient: recipient.clone(),
                message: message.clone(),
            };
            match transport.try_send(delivery) {
                Ok(()) => report.queued.push(recipient),
                Err(e) => {
                    tracing::warn!("Dropped sync message for {}: {}", recipient, e);
                    report.dropped.push(recipient);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::open_temp;

    async fn with_devices(store: &Store, devices: &[(u32, bool)]) {
        let mut tx = store.begin().await.unwrap();
        for (id, live) in devices {
            let mut device = Device::new(DeviceAddress::new("alice", *id), vec![*id as u8; 32], None);
            device.live = *live;
            tx.upsert_device(&device).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_live_own_devices() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        with_devices(&store, &[(1, true), (2, true), (3, false), (4, true)]).await;

        let (sender, mut receiver) = mpsc::channel(1);
        let sync = SyncCoordinator::new(DeviceAddress::new("alice", 1), store, Some(sender));
        let mut local = sync.subscribe();

        let event = SyncEvent::DeviceRevoked {
            address: DeviceAddress::new("alice", 3),
        };
        let report = sync.publish(event.clone()).await.unwrap();

        // Capacity 1: device 2 is queued, device 4 is dropped
        assert_eq!(report.queued, vec![DeviceAddress::new("alice", 2)]);
        assert_eq!(report.dropped, vec![DeviceAddress::new("alice", 4)]);

        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.message.event, event);
        assert_eq!(delivery.message.origin, DeviceAddress::new("alice", 1));
        assert_eq!(local.recv().await.unwrap().event, event);
    }

    #[tokio::test]
    async fn test_snapshot_request_and_response() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        with_devices(&store, &[(1, true), (2, true)]).await;

        let (sender, mut receiver) = mpsc::channel(8);
        let sync = SyncCoordinator::new(DeviceAddress::new("alice", 1), store, Some(sender));

        let requester = DeviceAddress::new("alice", 2);
        assert!(sync.respond_to_snapshot_request(&requester).await.unwrap());

        let delivery = receiver.recv().await.unwrap();
        assert_eq!(delivery.recipient, requester);
        let SyncEvent::Snapshot { snapshot } = delivery.message.event else {
            panic!("expected a snapshot");
        };
        assert_eq!(snapshot.devices.len(), 2);
        assert!(snapshot.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_without_transport_everything_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        with_devices(&store, &[(1, true), (2, true)]).await;

        let sync = SyncCoordinator::new(DeviceAddress::new("alice", 1), store, None);
        let report = sync.request_snapshot().await.unwrap();
        assert!(report.queued.is_empty());
        assert_eq!(report.dropped.len(), 1);
    }

    #[test]
    fn test_message_wire_form() {
        let message = SyncMessage {
            origin: DeviceAddress::new("alice", 2),
            event: SyncEvent::ReadReceipt {
                peer: DeviceAddress::new("bob", 1),
                counter: 7,
            },
        };
        let bytes = message.to_bytes().unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"type\":\"read_receipt\""));
        assert_eq!(SyncMessage::from_bytes(&bytes).unwrap(), message);
        assert!(SyncMessage::from_bytes(b"{}").is_err());
    }
}
