//! Per-device-pair session state
//!
//! A [`Session`] holds the symmetric chains derived from one key agreement,
//! the counters of both directions, message keys skipped by out-of-order
//! delivery and the window of recently received counters. It is plain data:
//! the store seals it as one record and [`SessionManager`] serializes writers.
//!
//! [`SessionManager`]: crate::session_manager::SessionManager

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::{ChainKey, ChainPair, CryptoProvider, MessageKey, Role, X3dhHeader};
use crate::error::{ManagerError, ManagerResult};
use crate::models::{DeviceAddress, SessionStatus, SessionSummary};

/// Which chain a ratchet step advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    /// Receiving the message with this counter
    Receiving(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainState {
    key: ChainKey,
    /// Counter of the next message on this chain
    next: u32,
}

/// Recently received counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayWindow {
    size: u32,
    highest: Option<u32>,
    seen: BTreeSet<u32>,
}

impl ReplayWindow {
    pub fn new(size: u32) -> Self {
        Self {
            size: size.max(1),
            highest: None,
            seen: BTreeSet::new(),
        }
    }

    /// Lowest counter still tracked; anything below it is too old to accept
    pub fn lowest_kept(&self) -> u32 {
        self.highest
            .map(|highest| highest.saturating_sub(self.size - 1))
            .unwrap_or(0)
    }

    pub fn contains(&self, counter: u32) -> bool {
        self.seen.contains(&counter)
    }

    pub fn is_too_old(&self, counter: u32) -> bool {
        self.highest.is_some() && counter < self.lowest_kept()
    }

    fn insert(&mut self, counter: u32) {
        if self.highest.map_or(true, |highest| counter > highest) {
            self.highest = Some(counter);
        }
        self.seen.insert(counter);
        let lowest = self.lowest_kept();
        self.seen = self.seen.split_off(&lowest);
    }
}

/// Cryptographic state shared with one remote device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub(crate) id: Uuid,
    pub(crate) local: DeviceAddress,
    pub(crate) remote: DeviceAddress,
    pub(crate) role: Role,
    pub(crate) status: SessionStatus,
    /// One-time prekey consumed by the agreement, if any
    pub(crate) pre_key_id: Option<u32>,
    pub(crate) remote_identity: Vec<u8>,
    /// Bumped on every ratchet step
    pub(crate) version: u64,
    pub(crate) created_at: DateTime<Utc>,
    /// Archived session with the same peer this one took over from
    #[serde(default)]
    pub(crate) replaces: Option<Uuid>,
    /// Sent with every message until the peer answers
    pending_header: Option<X3dhHeader>,
    sending: ChainState,
    receiving: ChainState,
    skipped: BTreeMap<u32, MessageKey>,
    window: ReplayWindow,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        local: DeviceAddress,
        remote: DeviceAddress,
        role: Role,
        pre_key_id: Option<u32>,
        remote_identity: Vec<u8>,
        chains: ChainPair,
        pending_header: Option<X3dhHeader>,
        replay_window: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            local,
            remote,
            role,
            status: SessionStatus::Active,
            pre_key_id,
            remote_identity,
            version: 0,
            created_at: Utc::now(),
            replaces: None,
            pending_header,
            sending: ChainState {
                key: chains.sending,
                next: 0,
            },
            receiving: ChainState {
                key: chains.receiving,
                next: 0,
            },
            skipped: BTreeMap::new(),
            window: ReplayWindow::new(replay_window),
        }
    }

    /// Responders adopt the id the initiator chose
    pub(crate) fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub(crate) fn replacing(mut self, previous: Option<Uuid>) -> Self {
        self.replaces = previous;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local(&self) -> &DeviceAddress {
        &self.local
    }

    pub fn remote(&self) -> &DeviceAddress {
        &self.remote
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn pre_key_id(&self) -> Option<u32> {
        self.pre_key_id
    }

    pub fn remote_identity(&self) -> &[u8] {
        &self.remote_identity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Counter the next sent message will carry
    pub fn sending_counter(&self) -> u32 {
        self.sending.next
    }

    /// Next in-order counter expected from the peer
    pub fn receiving_counter(&self) -> u32 {
        self.receiving.next
    }

    pub fn replay_window(&self) -> &ReplayWindow {
        &self.window
    }

    pub fn skipped_keys(&self) -> usize {
        self.skipped.len()
    }

    pub fn pending_header(&self) -> Option<&X3dhHeader> {
        self.pending_header.as_ref()
    }

    pub fn replaces(&self) -> Option<Uuid> {
        self.replaces
    }

    /// Whether both sides are known to hold this session
    pub fn is_confirmed(&self) -> bool {
        match self.role {
            Role::Initiator => self.pending_header.is_none(),
            Role::Responder => self.sending.next > 0,
        }
    }

    /// Order used to settle two sessions established concurrently for the
    /// same device pair: the higher prekey id wins, then the higher id.
    /// Both devices see the same two values, so both pick the same winner.
    pub(crate) fn establishment_rank(&self) -> (Option<u32>, Uuid) {
        (self.pre_key_id, self.id)
    }

    /// Advance the sending chain, returning the counter and key of the
    /// message being sent
    pub(crate) fn step_sending(
        &mut self,
        crypto: &dyn CryptoProvider,
    ) -> ManagerResult<(u32, MessageKey)> {
        let counter = self.sending.next;
        let next = counter
            .checked_add(1)
            .ok_or(ManagerError::RatchetExhausted {
                gap: u64::from(counter) + 1,
                max_skip: u32::MAX,
            })?;

        let (key, message_key) = crypto.chain_step(&self.sending.key)?;
        self.sending = ChainState { key, next };
        self.version += 1;
        Ok((counter, message_key))
    }

    /// Produce the key for the received message with `counter`
    ///
    /// Keys skipped on the way are retained, at most `max_skip` of them.
    /// Counters already in the replay window fail with `DuplicateMessage`;
    /// counters below it, or whose key is gone, with `ReplayRejected`.
    pub(crate) fn step_receiving(
        &mut self,
        crypto: &dyn CryptoProvider,
        counter: u32,
        max_skip: u32,
    ) -> ManagerResult<MessageKey> {
        let expected = self.receiving.next;
        if self.window.contains(counter) {
            return Err(ManagerError::DuplicateMessage { counter });
        }
        if self.window.is_too_old(counter) {
            return Err(ManagerError::ReplayRejected { counter, expected });
        }

        let message_key = if counter >= expected {
            let gap = u64::from(counter - expected);
            if gap > u64::from(max_skip) {
                return Err(ManagerError::RatchetExhausted { gap, max_skip });
            }
            let next = counter
                .checked_add(1)
                .ok_or(ManagerError::RatchetExhausted { gap, max_skip })?;

            while self.receiving.next < counter {
                let (key, skipped) = crypto.chain_step(&self.receiving.key)?;
                self.skipped.insert(self.receiving.next, skipped);
                self.receiving = ChainState {
                    key,
                    next: self.receiving.next + 1,
                };
            }
            let (key, message_key) = crypto.chain_step(&self.receiving.key)?;
            self.receiving = ChainState { key, next };
            message_key
        } else {
            self.skipped
                .remove(&counter)
                .ok_or(ManagerError::ReplayRejected { counter, expected })?
        };

        self.window.insert(counter);
        self.skipped = self.skipped.split_off(&self.window.lowest_kept());
        while self.skipped.len() > max_skip as usize {
            self.skipped.pop_first();
        }

        // The peer answered, so it holds the session
        self.pending_header = None;
        self.version += 1;
        Ok(message_key)
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.id,
            peer: self.remote.clone(),
            status: self.status,
            pre_key_id: self.pre_key_id,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignalCrypto;

    fn pair(window: u32) -> (Session, Session) {
        let alice = DeviceAddress::new("alice", 1);
        let bob = DeviceAddress::new("bob", 1);
        let shared = zeroize::Zeroizing::new([9u8; 32]);
        let crypto = SignalCrypto;

        let initiator = Session::new(
            alice.clone(),
            bob.clone(),
            Role::Initiator,
            Some(1),
            vec![2; 32],
            crypto.derive_chains(&shared, Role::Initiator).unwrap(),
            None,
            window,
        );
        let responder = Session::new(
            bob,
            alice,
            Role::Responder,
            Some(1),
            vec![1; 32],
            crypto.derive_chains(&shared, Role::Responder).unwrap(),
            None,
            window,
        )
        .with_id(initiator.id);
        (initiator, responder)
    }

    #[test]
    fn test_in_order_keys_match() {
        let (mut alice, mut bob) = pair(16);
        for expected in 0..5 {
            let (counter, sent) = alice.step_sending(&SignalCrypto).unwrap();
            assert_eq!(counter, expected);
            let received = bob.step_receiving(&SignalCrypto, counter, 10).unwrap();
            assert_eq!(sent, received);
        }
        assert_eq!(alice.sending_counter(), 5);
        assert_eq!(bob.receiving_counter(), 5);
        assert_eq!(bob.version(), 5);
    }

    #[test]
    fn test_out_of_order_uses_skipped_keys() {
        let (mut alice, mut bob) = pair(16);
        let keys: Vec<_> = (0..4)
            .map(|_| alice.step_sending(&SignalCrypto).unwrap().1)
            .collect();

        assert_eq!(bob.step_receiving(&SignalCrypto, 3, 10).unwrap(), keys[3]);
        assert_eq!(bob.skipped_keys(), 3);
        assert_eq!(bob.step_receiving(&SignalCrypto, 1, 10).unwrap(), keys[1]);
        assert_eq!(bob.step_receiving(&SignalCrypto, 0, 10).unwrap(), keys[0]);
        assert_eq!(bob.skipped_keys(), 1);
        assert_eq!(bob.receiving_counter(), 4);
    }

    #[test]
    fn test_duplicate_and_replay() {
        let (mut alice, mut bob) = pair(4);
        for _ in 0..10 {
            let (counter, _) = alice.step_sending(&SignalCrypto).unwrap();
            bob.step_receiving(&SignalCrypto, counter, 10).unwrap();
        }

        assert!(matches!(
            bob.step_receiving(&SignalCrypto, 9, 10),
            Err(ManagerError::DuplicateMessage { counter: 9 })
        ));
        assert!(matches!(
            bob.step_receiving(&SignalCrypto, 2, 10),
            Err(ManagerError::ReplayRejected {
                counter: 2,
                expected: 10
            })
        ));
        assert_eq!(bob.replay_window().lowest_kept(), 6);
    }

    #[test]
    fn test_gap_beyond_max_skip() {
        let (_, mut bob) = pair(16);
        let before = bob.clone();

        let err = bob.step_receiving(&SignalCrypto, 50, 10).unwrap_err();
        assert!(matches!(
            err,
            ManagerError::RatchetExhausted {
                gap: 50,
                max_skip: 10
            }
        ));
        assert_eq!(bob.receiving_counter(), before.receiving_counter());
        assert_eq!(bob.version(), before.version());
    }

    #[test]
    fn test_confirmation() {
        let (mut alice, mut bob) = pair(16);
        alice.pending_header = Some(X3dhHeader {
            identity_key: vec![1; 32],
            ephemeral_key: vec![4; 32],
            signed_prekey_id: 1,
            one_time_prekey_id: Some(1),
        });
        assert!(!alice.is_confirmed());
        assert!(!bob.is_confirmed());

        let (counter, _) = bob.step_sending(&SignalCrypto).unwrap();
        assert!(bob.is_confirmed());
        alice.step_receiving(&SignalCrypto, counter, 10).unwrap();
        assert!(alice.is_confirmed());
        assert!(alice.pending_header().is_none());
    }

    #[test]
    fn test_record_round_trip_keeps_chains() {
        let (mut alice, mut bob) = pair(16);
        alice.step_sending(&SignalCrypto).unwrap();
        let json = serde_json::to_vec(&alice).unwrap();
        let mut restored: Session = serde_json::from_slice(&json).unwrap();

        let (counter, key) = restored.step_sending(&SignalCrypto).unwrap();
        assert_eq!(counter, 1);
        bob.step_receiving(&SignalCrypto, 0, 10).unwrap();
        assert_eq!(bob.step_receiving(&SignalCrypto, 1, 10).unwrap(), key);
    }
}
