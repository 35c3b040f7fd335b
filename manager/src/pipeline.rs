//! Message pipeline
//!
//! Entry point for outbound and inbound traffic. A send or receive takes the
//! peer's session lock, then does all of its work in one store transaction:
//! session lookup or establishment, the ratchet step, encryption or
//! decryption and the pending message record commit together or not at all.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::crypto::{CryptoError, PreKeyBundle, X3dhHeader};
use crate::error::{ManagerError, ManagerResult};
use crate::models::{
    now_millis, DeviceAddress, MessageDirection, PendingMessage, SessionStatus, SessionSummary,
};
use crate::registry::DeviceRegistry;
use crate::session::{Direction, Session};
use crate::session_manager::SessionManager;
use crate::store::{NewPendingMessage, Store, StoreTx};
use crate::sync::{SyncCoordinator, SyncEvent};

/// Wire format version of [`Envelope`]
pub const ENVELOPE_VERSION: u8 = 1;

const AAD_PREFIX: &[u8] = b"NoChat Envelope v1";

/// What travels over the transport for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: u8,
    pub sender: DeviceAddress,
    pub recipient: DeviceAddress,
    pub session_id: Uuid,
    pub counter: u32,
    /// Key agreement header, present until the recipient has answered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<X3dhHeader>,
    /// Session the sender reset and this one takes over from, sent along
    /// with the key agreement header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces: Option<Uuid>,
    #[serde(with = "base64_body")]
    pub body: Vec<u8>,
}

mod base64_body {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    pub fn to_bytes(&self) -> ManagerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ManagerResult<Self> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::MalformedMessage(format!("envelope: {}", e)))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(CryptoError::MalformedMessage(format!(
                "unsupported envelope version {}",
                envelope.version
            ))
            .into());
        }
        Ok(envelope)
    }

    /// Associated data binding the ciphertext to its routing fields
    fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(AAD_PREFIX.len() + 64);
        aad.extend_from_slice(AAD_PREFIX);
        aad.extend_from_slice(self.session_id.as_bytes());
        aad.extend_from_slice(self.sender.to_string().as_bytes());
        aad.push(0);
        aad.extend_from_slice(self.recipient.to_string().as_bytes());
        aad.push(0);
        aad.extend_from_slice(&self.counter.to_be_bytes());
        if let Some(previous) = &self.replaces {
            aad.push(1);
            aad.extend_from_slice(previous.as_bytes());
        }
        aad
    }
}

/// An encrypted message ready for the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub recipient: DeviceAddress,
    pub session_id: Uuid,
    pub counter: u32,
    /// Serialized [`Envelope`]
    pub bytes: Vec<u8>,
}

/// A decrypted inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub sender: DeviceAddress,
    pub session_id: Uuid,
    pub counter: u32,
    pub plaintext: Vec<u8>,
    /// The same ciphertext had been received before; nothing changed
    pub duplicate: bool,
    /// The message established a new session
    pub established: bool,
}

pub struct MessagePipeline {
    local: DeviceAddress,
    store: Store,
    sessions: Arc<SessionManager>,
    registry: Arc<DeviceRegistry>,
    sync: Arc<SyncCoordinator>,
    record_outbound: bool,
}

impl MessagePipeline {
    pub fn new(
        local: DeviceAddress,
        store: Store,
        sessions: Arc<SessionManager>,
        registry: Arc<DeviceRegistry>,
        sync: Arc<SyncCoordinator>,
        record_outbound: bool,
    ) -> Self {
        Self {
            local,
            store,
            sessions,
            registry,
            sync,
            record_outbound,
        }
    }

    /// Encrypt `plaintext` for `remote`, establishing a session from a
    /// fetched bundle if there is none
    pub async fn send(&self, remote: &DeviceAddress, plaintext: &[u8]) -> ManagerResult<Ciphertext> {
        self.send_inner(remote, None, plaintext).await
    }

    /// Like [`MessagePipeline::send`], establishing from `bundle` if needed
    pub async fn send_with_bundle(
        &self,
        remote: &DeviceAddress,
        bundle: PreKeyBundle,
        plaintext: &[u8],
    ) -> ManagerResult<Ciphertext> {
        self.send_inner(remote, Some(bundle), plaintext).await
    }

    async fn send_inner(
        &self,
        remote: &DeviceAddress,
        bundle: Option<PreKeyBundle>,
        plaintext: &[u8],
    ) -> ManagerResult<Ciphertext> {
        if *remote == self.local {
            return Err(ManagerError::InvalidOperation(
                "cannot send to this device".to_string(),
            ));
        }

        let _guard = self.sessions.lock(remote).await;
        let mut tx = self.store.begin().await?;
        ensure_not_revoked(&mut tx, remote).await?;

        let (session, established) = self
            .sessions
            .get_or_create_session(&mut tx, remote, bundle)
            .await?;
        self.sessions.ensure_trusted(&mut tx, &remote.account).await?;

        let advance = self
            .sessions
            .advance_in(&mut tx, &session, Direction::Sending)
            .await?;
        let mut envelope = Envelope {
            version: ENVELOPE_VERSION,
            sender: self.local.clone(),
            recipient: remote.clone(),
            session_id: advance.session.id(),
            counter: advance.counter,
            pre_key: advance.session.pending_header().cloned(),
            replaces: advance
                .session
                .pending_header()
                .and(advance.session.replaces()),
            body: Vec::new(),
        };
        envelope.body =
            self.sessions
                .crypto()
                .encrypt(&advance.message_key, &envelope.aad(), plaintext)?;
        let bytes = envelope.to_bytes()?;

        if self.record_outbound {
            let digest = Sha256::digest(&bytes);
            tx.insert_pending(&NewPendingMessage {
                peer: remote,
                session_id: envelope.session_id,
                direction: MessageDirection::Outbound,
                counter: envelope.counter,
                digest: &digest[..],
                payload: &bytes,
            })
            .await?;
        }
        let new_device = if established {
            self.registry
                .observe_device(&mut tx, remote, advance.session.remote_identity())
                .await?
        } else {
            false
        };
        tx.commit().await?;

        if new_device {
            self.registry.invalidate(&remote.account).await;
        }
        if established {
            self.announce(advance.session.summary()).await;
        }
        tracing::debug!("Sent message {} to {}", envelope.counter, remote);

        Ok(Ciphertext {
            recipient: remote.clone(),
            session_id: envelope.session_id,
            counter: envelope.counter,
            bytes,
        })
    }

    /// Decrypt a message `sender` delivered
    ///
    /// Redelivery of an already received ciphertext returns the original
    /// plaintext with `duplicate` set, or an empty one once the pending
    /// record is pruned. A message that cannot belong to any
    /// usable session, or fails to decrypt on the active session, archives
    /// that session and fails with `SessionResetRequired`; the message is lost.
    pub async fn receive(&self, sender: &DeviceAddress, bytes: &[u8]) -> ManagerResult<Received> {
        let envelope = Envelope::from_bytes(bytes)?;
        if envelope.sender != *sender || envelope.recipient != self.local {
            return Err(ManagerError::InvalidOperation(format!(
                "envelope from {} to {} delivered by {} to {}",
                envelope.sender, envelope.recipient, sender, self.local
            )));
        }
        let digest = Sha256::digest(bytes).to_vec();

        let _guard = self.sessions.lock(sender).await;
        let mut tx = self.store.begin().await?;
        ensure_not_revoked(&mut tx, sender).await?;

        let (session, established) = match tx.session_by_id(&envelope.session_id).await? {
            Some(session) if session.remote() != sender => {
                return Err(ManagerError::InvalidOperation(format!(
                    "session {} does not belong to {}",
                    envelope.session_id, sender
                )));
            }
            Some(session) => (session, false),
            None => match &envelope.pre_key {
                Some(header) => {
                    let session = self
                        .sessions
                        .establish_inbound(
                            &mut tx,
                            sender,
                            envelope.session_id,
                            header,
                            envelope.replaces,
                        )
                        .await?;
                    (session, true)
                }
                None => {
                    tracing::warn!(
                        "Message from {} for unknown session {}",
                        sender,
                        envelope.session_id
                    );
                    self.sessions.reset_in(&mut tx, sender).await?;
                    tx.commit().await?;
                    return Err(ManagerError::SessionResetRequired(sender.clone()));
                }
            },
        };

        if let Some(previous) = tx
            .find_pending(&session.id(), MessageDirection::Inbound, envelope.counter)
            .await?
        {
            if previous.digest != digest {
                return Err(ManagerError::ReplayRejected {
                    counter: envelope.counter,
                    expected: session.receiving_counter(),
                });
            }
            tracing::debug!("Duplicate message {} from {}", envelope.counter, sender);
            return Ok(Received {
                sender: sender.clone(),
                session_id: session.id(),
                counter: envelope.counter,
                plaintext: previous.payload,
                duplicate: true,
                established: false,
            });
        }

        let advance = match self
            .sessions
            .advance_in(&mut tx, &session, Direction::Receiving(envelope.counter))
            .await
        {
            Ok(advance) => advance,
            // Still in the replay window, but its pending record was pruned
            Err(ManagerError::DuplicateMessage { counter }) => {
                tracing::debug!("Duplicate message {} from {}", counter, sender);
                return Ok(Received {
                    sender: sender.clone(),
                    session_id: session.id(),
                    counter,
                    plaintext: Vec::new(),
                    duplicate: true,
                    established: false,
                });
            }
            Err(e) => return Err(e),
        };
        let plaintext = match self.sessions.crypto().decrypt(
            &advance.message_key,
            &envelope.aad(),
            &envelope.body,
        ) {
            Ok(plaintext) => plaintext,
            Err(e) => return Err(self.decrypt_failed(tx, &session, established, e).await),
        };

        tx.insert_pending(&NewPendingMessage {
            peer: sender,
            session_id: session.id(),
            direction: MessageDirection::Inbound,
            counter: envelope.counter,
            digest: &digest,
            payload: &plaintext,
        })
        .await?;
        tx.prune_inbound_window(&session.id(), advance.session.replay_window().lowest_kept())
            .await?;
        let new_device = self
            .registry
            .observe_device(&mut tx, sender, advance.session.remote_identity())
            .await?;
        tx.commit().await?;

        if new_device {
            self.registry.invalidate(&sender.account).await;
        }
        if established && advance.session.status() == SessionStatus::Active {
            self.announce(advance.session.summary()).await;
        }
        tracing::debug!("Received message {} from {}", envelope.counter, sender);

        Ok(Received {
            sender: sender.clone(),
            session_id: session.id(),
            counter: envelope.counter,
            plaintext,
            duplicate: false,
            established,
        })
    }

    /// The uncommitted ratchet step is discarded with `tx`. Only a failure on
    /// the active session of an earlier exchange resets it.
    async fn decrypt_failed(
        &self,
        tx: StoreTx,
        session: &Session,
        established: bool,
        error: CryptoError,
    ) -> ManagerError {
        let sender = session.remote().clone();
        tracing::warn!(
            "Decryption failed on session {} with {}: {}",
            session.id(),
            sender,
            error
        );
        if established || session.status() != SessionStatus::Active {
            return error.into();
        }

        if let Err(e) = tx.rollback().await {
            return e;
        }
        let reset = async {
            let mut tx = self.store.begin().await?;
            self.sessions.reset_in(&mut tx, &sender).await?;
            tx.commit().await
        };
        match reset.await {
            Ok(()) => ManagerError::SessionResetRequired(sender),
            Err(e) => e,
        }
    }

    /// Forget an outbound message the peer acknowledged
    pub async fn acknowledge(&self, session_id: &Uuid, counter: u32) -> ManagerResult<bool> {
        let mut tx = self.store.begin().await?;
        let removed = tx
            .delete_pending(session_id, MessageDirection::Outbound, counter)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Unacknowledged outbound messages to `peer`, oldest first
    pub async fn pending_outbound(&self, peer: &DeviceAddress) -> ManagerResult<Vec<PendingMessage>> {
        let mut tx = self.store.begin().await?;
        tx.list_pending(peer, MessageDirection::Outbound).await
    }

    /// Drop pending messages of both directions older than `older_than`
    pub async fn prune_pending(&self, older_than: Duration) -> ManagerResult<u64> {
        let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(age);

        let mut tx = self.store.begin().await?;
        let pruned = tx.prune_pending(cutoff).await?;
        tx.commit().await?;
        Ok(pruned)
    }

    /// Tell the account's other devices that messages from `peer` up to
    /// `counter` have been read
    pub async fn mark_read(&self, peer: &DeviceAddress, counter: u32) -> ManagerResult<()> {
        self.sync
            .publish(SyncEvent::ReadReceipt {
                peer: peer.clone(),
                counter,
            })
            .await?;
        Ok(())
    }

    async fn announce(&self, session: SessionSummary) {
        if let Err(e) = self
            .sync
            .publish(SyncEvent::SessionEstablished { session })
            .await
        {
            tracing::warn!("Failed to announce new session: {}", e);
        }
    }
}

async fn ensure_not_revoked(tx: &mut StoreTx, address: &DeviceAddress) -> ManagerResult<()> {
    match tx.get_device(address).await? {
        Some(device) if !device.live => Err(ManagerError::DeviceRevoked(address.clone())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceId;
    use crate::test_support::{open_account, MemoryDirectory};

    #[tokio::test]
    async fn test_first_contact_hello() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let keys_before = bob.pre_key_status().await.unwrap().available_one_time;
        let c1 = alice.pipeline().send(&bob_addr, b"hello").await.unwrap();
        assert_eq!(c1.counter, 0);

        let received = bob.pipeline().receive(&alice_addr, &c1.bytes).await.unwrap();
        assert_eq!(received.plaintext, b"hello".to_vec());
        assert!(received.established);
        assert!(!received.duplicate);

        // Exactly one one-time prekey of bob's was consumed
        let keys_after = bob.pre_key_status().await.unwrap().available_one_time;
        assert_eq!(keys_after, keys_before - 1);

        // Mirrored sessions share an id
        let bob_session = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();
        assert_eq!(bob_session.id(), c1.session_id);
        assert_eq!(bob_session.receiving_counter(), 1);

        // Bob now knows alice's device
        assert!(bob.registry().device(&alice_addr).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_conversation_counters_increase() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let mut last = None;
        for round in 0..3u32 {
            let to_bob = alice.pipeline().send(&bob_addr, b"ping").await.unwrap();
            assert_eq!(to_bob.counter, round);
            bob.pipeline().receive(&alice_addr, &to_bob.bytes).await.unwrap();

            let to_alice = bob.pipeline().send(&alice_addr, b"pong").await.unwrap();
            assert_eq!(to_alice.counter, round);
            let received = alice.pipeline().receive(&bob_addr, &to_alice.bytes).await.unwrap();
            assert_eq!(received.plaintext, b"pong".to_vec());
            last = Some(to_bob);
        }

        // After bob answered, alice stops sending the key agreement header
        let envelope = Envelope::from_bytes(&last.unwrap().bytes).unwrap();
        assert!(envelope.pre_key.is_none());

        let session = alice.sessions().active_session(&bob_addr).await.unwrap().unwrap();
        assert_eq!(session.sending_counter(), 3);
        assert_eq!(session.receiving_counter(), 3);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let first = alice.pipeline().send(&bob_addr, b"one").await.unwrap();
        let second = alice.pipeline().send(&bob_addr, b"two").await.unwrap();
        bob.pipeline().receive(&alice_addr, &first.bytes).await.unwrap();
        bob.pipeline().receive(&alice_addr, &second.bytes).await.unwrap();
        let before = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();

        let again = bob.pipeline().receive(&alice_addr, &first.bytes).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.plaintext, b"one".to_vec());

        let after = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();
        assert_eq!(after.version(), before.version());
        assert_eq!(after.receiving_counter(), before.receiving_counter());
    }

    #[tokio::test]
    async fn test_redelivery_after_prune_is_still_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let messages = send_many(&alice, &bob_addr, 2).await;
        for message in &messages {
            bob.pipeline().receive(&alice_addr, &message.bytes).await.unwrap();
        }
        let before = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bob.pipeline().prune_pending(Duration::ZERO).await.unwrap(), 2);

        let again = bob
            .pipeline()
            .receive(&alice_addr, &messages[0].bytes)
            .await
            .unwrap();
        assert!(again.duplicate);
        assert_eq!(again.counter, 0);
        assert!(again.plaintext.is_empty());

        let after = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();
        assert_eq!(after.version(), before.version());
    }

    #[tokio::test]
    async fn test_out_of_order_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let messages: Vec<_> = send_many(&alice, &bob_addr, 4).await;
        for index in [0usize, 3, 1, 2] {
            let received = bob
                .pipeline()
                .receive(&alice_addr, &messages[index].bytes)
                .await
                .unwrap();
            assert_eq!(received.counter, index as u32);
        }
    }

    async fn send_many(
        from: &crate::AccountManager,
        to: &DeviceAddress,
        count: u32,
    ) -> Vec<Ciphertext> {
        let mut sent = Vec::new();
        for i in 0..count {
            sent.push(
                from.pipeline()
                    .send(to, format!("m{}", i).as_bytes())
                    .await
                    .unwrap(),
            );
        }
        sent
    }

    #[tokio::test]
    async fn test_tampered_message_resets_session() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let first = alice.pipeline().send(&bob_addr, b"one").await.unwrap();
        bob.pipeline().receive(&alice_addr, &first.bytes).await.unwrap();

        let second = alice.pipeline().send(&bob_addr, b"two").await.unwrap();
        let mut envelope = Envelope::from_bytes(&second.bytes).unwrap();
        envelope.body[0] ^= 0xFF;
        let tampered = envelope.to_bytes().unwrap();

        let err = bob.pipeline().receive(&alice_addr, &tampered).await.unwrap_err();
        assert!(matches!(err, ManagerError::SessionResetRequired(ref a) if *a == alice_addr));
        assert!(bob.sessions().active_session(&alice_addr).await.unwrap().is_none());
        let summaries = bob.sessions().sessions_for(&alice_addr).await.unwrap();
        assert_eq!(summaries[0].status, SessionStatus::Archived);
    }

    #[tokio::test]
    async fn test_new_session_after_reset_replaces_confirmed_one() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let first = alice.pipeline().send(&bob_addr, b"one").await.unwrap();
        bob.pipeline().receive(&alice_addr, &first.bytes).await.unwrap();
        let reply = bob.pipeline().send(&alice_addr, b"reply").await.unwrap();
        alice.pipeline().receive(&bob_addr, &reply.bytes).await.unwrap();
        let original = first.session_id;

        let second = alice.pipeline().send(&bob_addr, b"two").await.unwrap();
        let mut envelope = Envelope::from_bytes(&second.bytes).unwrap();
        envelope.body[0] ^= 0xFF;
        bob.pipeline()
            .receive(&alice_addr, &envelope.to_bytes().unwrap())
            .await
            .unwrap_err();

        // Bob starts over; alice still considers the old session confirmed
        let fresh = bob.pipeline().send(&alice_addr, b"again").await.unwrap();
        assert_ne!(fresh.session_id, original);
        let envelope = Envelope::from_bytes(&fresh.bytes).unwrap();
        assert_eq!(envelope.replaces, Some(original));

        let received = alice.pipeline().receive(&bob_addr, &fresh.bytes).await.unwrap();
        assert!(received.established);

        let alice_active = alice.sessions().active_session(&bob_addr).await.unwrap().unwrap();
        let bob_active = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();
        assert_eq!(alice_active.id(), fresh.session_id);
        assert_eq!(bob_active.id(), fresh.session_id);
    }

    #[tokio::test]
    async fn test_crossed_first_messages_settle_on_one_session() {
        // Which session wins depends on random ids; repeat to see both
        for _ in 0..6 {
            let dir = tempfile::tempdir().unwrap();
            let directory = MemoryDirectory::new();
            let alice = open_account(&dir, "alice", 1, &directory).await;
            let bob = open_account(&dir, "bob", 1, &directory).await;
            let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

            // Both start a session before seeing the other's; alice's first
            // message is held back
            let from_alice = alice.pipeline().send(&bob_addr, b"hi bob").await.unwrap();
            let from_bob = bob.pipeline().send(&alice_addr, b"hi alice").await.unwrap();
            assert_ne!(from_alice.session_id, from_bob.session_id);

            alice.pipeline().receive(&bob_addr, &from_bob.bytes).await.unwrap();
            let follow_up = alice.pipeline().send(&bob_addr, b"still there").await.unwrap();
            let received = bob.pipeline().receive(&alice_addr, &follow_up.bytes).await.unwrap();
            assert_eq!(received.plaintext, b"still there".to_vec());

            let mut events = bob.sync().subscribe();
            let late = bob.pipeline().receive(&alice_addr, &from_alice.bytes).await.unwrap();
            assert_eq!(late.plaintext, b"hi bob".to_vec());

            let alice_active = alice.sessions().active_session(&bob_addr).await.unwrap().unwrap();
            let bob_active = bob.sessions().active_session(&alice_addr).await.unwrap().unwrap();
            assert_eq!(alice_active.id(), bob_active.id());
            assert_eq!(alice_active.id(), follow_up.session_id);

            // The late message never announces a session that lost
            while let Ok(message) = events.try_recv() {
                if let SyncEvent::SessionEstablished { session } = message.event {
                    assert_eq!(session.session_id, bob_active.id());
                }
            }

            // Traffic keeps flowing on the shared session
            let answer = bob.pipeline().send(&alice_addr, b"yes").await.unwrap();
            assert_eq!(answer.session_id, bob_active.id());
            alice.pipeline().receive(&bob_addr, &answer.bytes).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unknown_session_requires_reset() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let (alice_addr, bob_addr) = (alice.local().clone(), bob.local().clone());

        let first = alice.pipeline().send(&bob_addr, b"one").await.unwrap();
        let mut envelope = Envelope::from_bytes(&first.bytes).unwrap();
        envelope.pre_key = None;
        envelope.session_id = Uuid::new_v4();

        let err = bob
            .pipeline()
            .receive(&alice_addr, &envelope.to_bytes().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::SessionResetRequired(_)));
    }

    #[tokio::test]
    async fn test_send_after_revoke_fails() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let laptop = crate::test_support::open_linked(&dir, &alice, 2, &directory).await;
        let laptop_addr = laptop.local().clone();

        alice.pipeline().send(&laptop_addr, b"hi").await.unwrap();
        alice.registry().revoke(DeviceId(2)).await.unwrap();

        // Sessions with the revoked device are invalidated at once
        assert!(alice.sessions().active_session(&laptop_addr).await.unwrap().is_none());
        let summaries = alice.sessions().sessions_for(&laptop_addr).await.unwrap();
        assert!(summaries.iter().all(|s| s.status == SessionStatus::Invalidated));

        assert!(matches!(
            alice.pipeline().send(&laptop_addr, b"still there?").await,
            Err(ManagerError::DeviceRevoked(ref a)) if *a == laptop_addr
        ));
    }

    #[tokio::test]
    async fn test_outbound_log_and_acknowledge() {
        let dir = tempfile::tempdir().unwrap();
        let directory = MemoryDirectory::new();
        let alice = open_account(&dir, "alice", 1, &directory).await;
        let bob = open_account(&dir, "bob", 1, &directory).await;
        let bob_addr = bob.local().clone();

        let first = alice.pipeline().send(&bob_addr, b"one").await.unwrap();
        alice.pipeline().send(&bob_addr, b"two").await.unwrap();

        let pending = alice.pipeline().pending_outbound(&bob_addr).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload, first.bytes);

        assert!(alice.pipeline().acknowledge(&first.session_id, 0).await.unwrap());
        assert!(!alice.pipeline().acknowledge(&first.session_id, 0).await.unwrap());
        assert_eq!(alice.pipeline().pending_outbound(&bob_addr).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(alice.pipeline().prune_pending(Duration::ZERO).await.unwrap(), 1);
    }

    #[test]
    fn test_envelope_rejects_unknown_version() {
        let envelope = Envelope {
            version: 9,
            sender: DeviceAddress::new("alice", 1),
            recipient: DeviceAddress::new("bob", 1),
            session_id: Uuid::new_v4(),
            counter: 0,
            pre_key: None,
            replaces: None,
            body: vec![1, 2, 3],
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(ManagerError::Crypto(CryptoError::MalformedMessage(_)))
        ));
    }
}
