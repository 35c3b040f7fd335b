//! NoChat Manager - Core library
//!
//! Session, device and identity management for end-to-end encrypted
//! messaging. One [`AccountManager`] owns everything for one device of one
//! account: the encrypted store, prekeys, pairwise sessions, the device
//! registry, multi-device sync and the message pipeline. Transport and
//! directory services are supplied by the embedding application.

pub mod config;
pub mod crypto;
pub mod error;
pub mod link;
pub mod manager;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod session_manager;
pub mod store;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ManagerConfig;
pub use crypto::{CryptoProvider, PreKeyBundle, PublishedKeys, SignalCrypto};
pub use error::{ManagerError, ManagerResult};
pub use link::DeviceLinkInfo;
pub use manager::{AccountManager, AccountManagerBuilder};
pub use models::{AccountId, Device, DeviceAddress, DeviceId, TrustLevel};
pub use pipeline::{Ciphertext, Envelope, MessagePipeline, Received};
pub use session_manager::PreKeySource;
pub use store::{PickleKey, Store};
pub use sync::{SyncDelivery, SyncEvent, SyncMessage, SyncSnapshot};

/// Install a `tracing` subscriber honoring `RUST_LOG`, defaulting to info for
/// this crate. Does nothing if the application already installed one.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nochat_manager=info".into()),
        )
        .try_init();
}
