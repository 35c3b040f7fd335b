//! Session lifecycle per remote device
//!
//! The [`SessionManager`] creates sessions from prekey bundles (as initiator)
//! or from the key agreement header of a first message (as responder),
//! advances their chains, and archives them on reset. Writers to the sessions
//! of one remote device are serialized by a per-device lock; every operation
//! that changes a session runs inside one store transaction, so a failed or
//! cancelled call leaves nothing behind.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::config::{SessionConfig, TrustNewIdentity, WindowConfig};
use crate::crypto::{
    CryptoProvider, MessageKey, PreKeyBundle, PreKeyManager, Role, SharedIdentity, X3dhHeader,
};
use crate::error::{ManagerError, ManagerResult};
use crate::models::{
    AccountId, DeviceAddress, Identity, IdentityChange, SessionStatus, SessionSummary, TrustLevel,
};
use crate::session::{Direction, Session};
use crate::store::{Store, StoreTx};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Where prekey bundles of remote devices come from, typically a key
/// directory reached over the network
pub trait PreKeySource: Send + Sync {
    /// Fetch a bundle for `device`, or `None` if it has none to offer
    fn fetch_bundle<'a>(
        &'a self,
        device: &'a DeviceAddress,
    ) -> BoxFuture<'a, ManagerResult<Option<PreKeyBundle>>>;
}

/// Outcome of one ratchet step
#[derive(Debug)]
pub struct Advance {
    /// The session after the step, as committed
    pub session: Session,
    /// Counter of the message the key belongs to
    pub counter: u32,
    pub message_key: MessageKey,
}

pub struct SessionManager {
    local: DeviceAddress,
    store: Store,
    crypto: Arc<dyn CryptoProvider>,
    identity: SharedIdentity,
    pre_keys: Arc<PreKeyManager>,
    directory: Option<Arc<dyn PreKeySource>>,
    windows: WindowConfig,
    config: SessionConfig,
    trust_new: TrustNewIdentity,
    locks: Mutex<HashMap<DeviceAddress, Arc<Mutex<()>>>>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: DeviceAddress,
        store: Store,
        crypto: Arc<dyn CryptoProvider>,
        identity: SharedIdentity,
        pre_keys: Arc<PreKeyManager>,
        directory: Option<Arc<dyn PreKeySource>>,
        windows: WindowConfig,
        config: SessionConfig,
        trust_new: TrustNewIdentity,
    ) -> Self {
        Self {
            local,
            store,
            crypto,
            identity,
            pre_keys,
            directory,
            windows,
            config,
            trust_new,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &DeviceAddress {
        &self.local
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn windows(&self) -> WindowConfig {
        self.windows
    }

    pub fn pre_keys(&self) -> &Arc<PreKeyManager> {
        &self.pre_keys
    }

    /// Take the single-writer lock for sessions with `peer`. Held across the
    /// whole transaction of a send or receive.
    pub async fn lock(&self, peer: &DeviceAddress) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(peer.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// The active session with `remote`, if any
    pub async fn active_session(&self, remote: &DeviceAddress) -> ManagerResult<Option<Session>> {
        let mut tx = self.store.begin().await?;
        tx.active_session(remote).await
    }

    /// Every session with `remote`, newest first
    pub async fn sessions_for(&self, remote: &DeviceAddress) -> ManagerResult<Vec<SessionSummary>> {
        let mut tx = self.store.begin().await?;
        tx.list_sessions(remote).await
    }

    /// Return the active session with `remote`, establishing one if needed
    ///
    /// Establishment uses `bundle` when given, otherwise one fetched from the
    /// configured [`PreKeySource`]. The flag is true if the session is new.
    /// Callers hold [`SessionManager::lock`] for `remote`.
    pub async fn get_or_create_session(
        &self,
        tx: &mut StoreTx,
        remote: &DeviceAddress,
        bundle: Option<PreKeyBundle>,
    ) -> ManagerResult<(Session, bool)> {
        if let Some(session) = tx.active_session(remote).await? {
            return Ok((session, false));
        }

        let bundle = match bundle {
            Some(bundle) => bundle,
            None => self.fetch_bundle(remote).await?,
        };
        let session = self.establish_outbound(tx, remote, &bundle).await?;
        Ok((session, true))
    }

    async fn fetch_bundle(&self, remote: &DeviceAddress) -> ManagerResult<PreKeyBundle> {
        let directory = self.directory.as_ref().ok_or_else(|| {
            ManagerError::NoPreKeyAvailable(format!(
                "no bundle supplied for {} and no prekey source configured",
                remote
            ))
        })?;

        directory.fetch_bundle(remote).await?.ok_or_else(|| {
            ManagerError::NoPreKeyAvailable(format!("{} has no prekey bundle", remote))
        })
    }

    async fn establish_outbound(
        &self,
        tx: &mut StoreTx,
        remote: &DeviceAddress,
        bundle: &PreKeyBundle,
    ) -> ManagerResult<Session> {
        if bundle.address != *remote {
            return Err(ManagerError::InvalidOperation(format!(
                "bundle for {} offered for {}",
                bundle.address, remote
            )));
        }
        if let Some(one_time) = &bundle.one_time_prekey {
            if !tx.record_remote_pre_key_use(remote, one_time.key_id).await? {
                tracing::warn!(
                    "Bundle for {} re-offers consumed one-time prekey {}",
                    remote,
                    one_time.key_id
                );
                return Err(ManagerError::PreKeyReused {
                    owner: remote.clone(),
                    key_id: one_time.key_id,
                });
            }
        }

        let result = {
            let identity = self.identity.read().await;
            self.crypto.initiate(&identity, bundle)?
        };
        self.observe_identity(tx, remote, &bundle.identity_key)
            .await?;
        let chains = self
            .crypto
            .derive_chains(&result.shared_secret, Role::Initiator)?;
        let previous = tx.last_archived_session(remote).await?;

        let session = Session::new(
            self.local.clone(),
            remote.clone(),
            Role::Initiator,
            result.used_one_time_prekey(),
            bundle.identity_key.clone(),
            chains,
            Some(result.header),
            self.windows.replay_window,
        )
        .replacing(previous);
        tx.insert_session(&session).await?;

        tracing::info!(
            "Established session {} with {} (one-time prekey {:?})",
            session.id,
            remote,
            session.pre_key_id
        );
        Ok(session)
    }

    /// Create the responder side of a session from the key agreement header
    /// carried by a first message
    ///
    /// Consumes the named one-time prekey. If `replaces` names the session
    /// active with `remote`, the peer reset it and the new session takes
    /// over. Any other active session was established concurrently: the two
    /// are ranked and the loser is archived.
    pub async fn establish_inbound(
        &self,
        tx: &mut StoreTx,
        remote: &DeviceAddress,
        session_id: Uuid,
        header: &X3dhHeader,
        replaces: Option<Uuid>,
    ) -> ManagerResult<Session> {
        let signed = self
            .pre_keys
            .signed_key_pair(tx, header.signed_prekey_id)
            .await?;
        let one_time = match header.one_time_prekey_id {
            Some(key_id) => Some(self.pre_keys.consume(tx, key_id).await?),
            None => None,
        };

        self.observe_identity(tx, remote, &header.identity_key)
            .await?;
        let shared = {
            let identity = self.identity.read().await;
            self.crypto
                .respond(&identity, &signed, one_time.as_ref(), header)?
        };
        let chains = self.crypto.derive_chains(&shared, Role::Responder)?;

        let mut session = Session::new(
            self.local.clone(),
            remote.clone(),
            Role::Responder,
            header.one_time_prekey_id,
            header.identity_key.clone(),
            chains,
            None,
            self.windows.replay_window,
        )
        .with_id(session_id)
        .replacing(replaces);

        match tx.active_session(remote).await? {
            Some(existing)
                if replaces != Some(existing.id)
                    && existing.establishment_rank() > session.establishment_rank() =>
            {
                tracing::info!(
                    "Concurrent session {} with {} loses to {}; archived",
                    session.id,
                    remote,
                    existing.id
                );
                session.status = SessionStatus::Archived;
            }
            Some(existing) => {
                tx.archive_active_session(remote).await?;
                tracing::info!(
                    "Session {} with {} superseded by {}",
                    existing.id,
                    remote,
                    session.id
                );
            }
            None => {}
        }
        tx.insert_session(&session).await?;

        tracing::info!(
            "Accepted session {} from {} (one-time prekey {:?})",
            session.id,
            remote,
            session.pre_key_id
        );
        Ok(session)
    }

    /// Apply one ratchet step to `session` and commit it
    ///
    /// `session` is the caller's snapshot; if another writer advanced it in
    /// the meantime the call fails with `StaleSession` and nothing changes.
    pub async fn advance(&self, session: &Session, direction: Direction) -> ManagerResult<Advance> {
        let _guard = self.lock(&session.remote).await;
        let mut tx = self.store.begin().await?;
        let advance = self.advance_in(&mut tx, session, direction).await?;
        tx.commit().await?;
        Ok(advance)
    }

    /// [`SessionManager::advance`] inside the caller's transaction. Callers
    /// hold the lock for the session's remote device.
    pub async fn advance_in(
        &self,
        tx: &mut StoreTx,
        session: &Session,
        direction: Direction,
    ) -> ManagerResult<Advance> {
        let mut current = tx
            .session_by_id(&session.id)
            .await?
            .ok_or_else(|| ManagerError::SessionNotFound(session.remote.clone()))?;
        if current.version != session.version {
            return Err(ManagerError::StaleSession(session.id));
        }

        let (counter, message_key) = match direction {
            Direction::Sending => {
                if current.status != SessionStatus::Active {
                    return Err(ManagerError::SessionNotFound(current.remote.clone()));
                }
                current.step_sending(self.crypto.as_ref())?
            }
            Direction::Receiving(counter) => {
                if current.status == SessionStatus::Invalidated {
                    return Err(ManagerError::SessionResetRequired(current.remote.clone()));
                }
                let key =
                    current.step_receiving(self.crypto.as_ref(), counter, self.windows.max_skip)?;
                (counter, key)
            }
        };
        tx.update_session(&current).await?;

        Ok(Advance {
            session: current,
            counter,
            message_key,
        })
    }

    /// Archive `session` if it is still the active one, so the next message
    /// establishes a fresh session
    pub async fn reset(&self, session: &Session) -> ManagerResult<bool> {
        let _guard = self.lock(&session.remote).await;
        let mut tx = self.store.begin().await?;

        let archived = match tx.session_by_id(&session.id).await? {
            Some(current) if current.status == SessionStatus::Active => {
                tx.set_session_status(&current.id, SessionStatus::Archived)
                    .await?
            }
            _ => false,
        };
        tx.commit().await?;

        if archived {
            tracing::info!("Reset session {} with {}", session.id, session.remote);
        }
        Ok(archived)
    }

    /// Archive the active session with `remote` inside the caller's
    /// transaction
    pub async fn reset_in(
        &self,
        tx: &mut StoreTx,
        remote: &DeviceAddress,
    ) -> ManagerResult<Option<Uuid>> {
        let archived = tx.archive_active_session(remote).await?;
        if let Some(id) = archived {
            tracing::info!("Reset session {} with {}", id, remote);
        }
        Ok(archived)
    }

    /// Invalidate every session with a revoked device
    pub async fn invalidate_device(
        &self,
        tx: &mut StoreTx,
        remote: &DeviceAddress,
    ) -> ManagerResult<u64> {
        let invalidated = tx.invalidate_sessions(remote).await?;
        tracing::info!("Invalidated {} sessions with {}", invalidated, remote);
        Ok(invalidated)
    }

    /// Purge archived sessions past retention and trim each peer's archive.
    /// Returns the number of sessions deleted.
    pub async fn expire(&self) -> ManagerResult<u64> {
        let retention = chrono::Duration::from_std(self.config.archive_retention())
            .map_err(|e| ManagerError::Config(format!("archive retention: {}", e)))?;
        let cutoff = (Utc::now() - retention).timestamp_millis();

        let mut tx = self.store.begin().await?;
        let purged = tx
            .purge_archived_sessions(cutoff, self.config.max_archived_per_peer)
            .await?;
        tx.commit().await?;

        // Locks nobody is holding or waiting on
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);

        if purged > 0 {
            tracing::debug!("Purged {} archived sessions", purged);
        }
        Ok(purged)
    }

    /// Record the identity key `remote` speaks with
    ///
    /// New accounts are trusted according to policy. A changed key is stored
    /// untrusted (unless policy trusts always) and archives every active
    /// session with the account.
    pub async fn observe_identity(
        &self,
        tx: &mut StoreTx,
        remote: &DeviceAddress,
        public_key: &[u8],
    ) -> ManagerResult<IdentityChange> {
        // Own devices speak with the account identity or the key they were
        // linked with
        if remote.account == self.local.account {
            let linked = tx.get_device(remote).await?.map(|device| device.identity_key);
            let ours = self.identity.read().await.public_key_bytes();
            if linked.as_deref() == Some(public_key) || ours == public_key {
                return Ok(IdentityChange::Unchanged);
            }
            return Err(ManagerError::IdentityMismatch(remote.clone()));
        }

        let (change, trust_level) = match tx.get_identity(&remote.account).await? {
            Some(existing) if existing.public_key == public_key => {
                return Ok(IdentityChange::Unchanged)
            }
            Some(_) => {
                let level = match self.trust_new {
                    TrustNewIdentity::Always => TrustLevel::TrustedUnverified,
                    _ => TrustLevel::Untrusted,
                };
                (IdentityChange::Changed, level)
            }
            None => {
                let level = match self.trust_new {
                    TrustNewIdentity::Never => TrustLevel::Untrusted,
                    _ => TrustLevel::TrustedUnverified,
                };
                (IdentityChange::New, level)
            }
        };

        tx.save_identity(&Identity {
            account: remote.account.clone(),
            public_key: public_key.to_vec(),
            trust_level,
            added_at: Utc::now(),
        })
        .await?;

        if change == IdentityChange::Changed {
            let archived = tx.archive_account_sessions(&remote.account).await?;
            tracing::warn!(
                "Identity key of {} changed; archived {} sessions",
                remote.account,
                archived
            );
        }
        Ok(change)
    }

    /// Fail with `UntrustedIdentity` unless messages may be sent to `account`
    pub async fn ensure_trusted(&self, tx: &mut StoreTx, account: &AccountId) -> ManagerResult<()> {
        if *account == self.local.account {
            return Ok(());
        }
        match tx.get_identity(account).await? {
            Some(identity) if !identity.trust_level.is_trusted() => {
                Err(ManagerError::UntrustedIdentity(account.clone()))
            }
            _ => Ok(()),
        }
    }
}
