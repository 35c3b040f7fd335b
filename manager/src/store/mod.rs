//! Durable, transactional persistence for one account
//!
//! A [`Store`] owns a bounded SQLite pool. All reads and writes go through a
//! [`StoreTx`], which rolls back when dropped without [`StoreTx::commit`], so
//! an error or a cancelled future never leaves partial state behind.
//!
//! CRUD is split by table family across the submodules, each adding methods to
//! `StoreTx`.

mod cipher;
mod devices;
mod groups;
mod identities;
mod pending;
mod prekeys;
mod sessions;

use std::sync::Arc;

use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::config::StoreConfig;
use crate::error::{ManagerError, ManagerResult};

pub use cipher::{derive_pickle_key, generate_pickle_key, PickleKey};
pub(crate) use cipher::RecordCipher;
pub use identities::LocalIdentity;
pub use pending::NewPendingMessage;
pub use prekeys::{PreKeyRecord, StoredSignedPreKey};

/// Schema version this build expects: the highest embedded migration
pub const SCHEMA_VERSION: i64 = 3;

static MIGRATOR: Migrator = sqlx::migrate!("../migrations");

/// Handle to one account's database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    cipher: Arc<RecordCipher>,
}

impl Store {
    /// Open (creating if missing) the database, apply migrations and verify
    /// the schema version. Any failure leaves the pool closed.
    pub async fn open(config: &StoreConfig, pickle_key: PickleKey) -> ManagerResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout())
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await?;

        if let Err(e) = MIGRATOR.run(&pool).await {
            tracing::error!("Migrations failed, refusing to serve: {}", e);
            pool.close().await;
            return Err(e.into());
        }

        let store = Self {
            pool,
            cipher: Arc::new(RecordCipher::new(&pickle_key)),
        };

        let version = match store.schema_version().await {
            Ok(version) => version,
            Err(e) => {
                store.close().await;
                return Err(e);
            }
        };
        if version != SCHEMA_VERSION {
            store.close().await;
            return Err(ManagerError::StoreCorrupt(format!(
                "schema version {} does not match expected {}",
                version, SCHEMA_VERSION
            )));
        }

        tracing::info!(
            "Store opened at {} (schema v{})",
            config.path.display(),
            version
        );

        Ok(store)
    }

    /// Begin a scoped transaction, waiting at most the pool's acquisition
    /// timeout for a connection.
    pub async fn begin(&self) -> ManagerResult<StoreTx> {
        let tx = self.pool.begin().await.map_err(|e| {
            let e = ManagerError::from(e);
            if matches!(e, ManagerError::StoreBusy) {
                tracing::warn!(
                    "Connection pool exhausted ({} connections)",
                    self.pool.size()
                );
            }
            e
        })?;

        Ok(StoreTx {
            tx,
            cipher: Arc::clone(&self.cipher),
        })
    }

    /// Highest successfully applied migration
    pub async fn schema_version(&self) -> ManagerResult<i64> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
                .fetch_one(&self.pool)
                .await?;

        version.ok_or_else(|| ManagerError::StoreCorrupt("no migrations applied".to_string()))
    }

    /// Close the pool, waiting for checked-out connections to return
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// A scoped transaction. Dropping it without committing rolls back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
    cipher: Arc<RecordCipher>,
}

impl StoreTx {
    pub async fn commit(self) -> ManagerResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> ManagerResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }

    fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }
}

fn to_u32(value: i64, column: &str) -> ManagerResult<u32> {
    u32::try_from(value)
        .map_err(|_| ManagerError::StoreCorrupt(format!("{} out of range: {}", column, value)))
}

fn parse_uuid(value: &str) -> ManagerResult<uuid::Uuid> {
    uuid::Uuid::parse_str(value)
        .map_err(|e| ManagerError::StoreCorrupt(format!("invalid session id {}: {}", value, e)))
}
