//! Local pre-keys and the record of remote one-time keys already consumed

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{to_u32, StoreTx};
use crate::crypto::{Curve25519KeyPair, OneTimePreKey, SignedPreKey};
use crate::error::{ManagerError, ManagerResult};
use crate::models::{from_millis, now_millis, DeviceAddress};

fn pre_key_label(key_id: u32) -> String {
    format!("pre_key:{}", key_id)
}

fn signed_pre_key_label(key_id: u32) -> String {
    format!("signed_pre_key:{}", key_id)
}

/// A local one-time pre-key. Consumed keys keep their row as a tombstone
/// with the private half wiped.
#[derive(Debug, Clone)]
pub struct PreKeyRecord {
    pub key_id: u32,
    pub public_key: Vec<u8>,
    /// `None` once consumed
    pub key_pair: Option<Curve25519KeyPair>,
    pub published: bool,
    pub consumed_at: Option<DateTime<Utc>>,
}

/// A local signed pre-key with its private half
#[derive(Debug, Clone)]
pub struct StoredSignedPreKey {
    pub signed: SignedPreKey,
    pub key_pair: Curve25519KeyPair,
}

impl StoreTx {
    fn signed_pre_key_from_row(&self, row: &SqliteRow) -> ManagerResult<StoredSignedPreKey> {
        let key_id = to_u32(row.try_get("key_id")?, "signed_pre_keys.key_id")?;
        let sealed: Vec<u8> = row.try_get("private_key")?;
        let secret = self.cipher.open(&signed_pre_key_label(key_id), &sealed)?;
        let key_pair = Curve25519KeyPair::from_secret_bytes(&secret)
            .map_err(|e| ManagerError::StoreCorrupt(format!("signed pre-key {}: {}", key_id, e)))?;
        let created_millis: i64 = row.try_get("created_at")?;

        Ok(StoredSignedPreKey {
            signed: SignedPreKey {
                key_id,
                public_key: row.try_get("public_key")?,
                signature: row.try_get("signature")?,
                created_at: created_millis / 1000,
            },
            key_pair,
        })
    }

    pub async fn insert_pre_keys(
        &mut self,
        keys: &[(u32, Curve25519KeyPair)],
    ) -> ManagerResult<()> {
        let now = now_millis();
        for (key_id, key_pair) in keys {
            let sealed = self
                .cipher
                .seal(&pre_key_label(*key_id), &key_pair.secret_key_bytes())?;

            sqlx::query(
                r#"
                INSERT INTO pre_keys (key_id, public_key, private_key, published, created_at)
                VALUES (?, ?, ?, 0, ?)
                "#,
            )
            .bind(*key_id as i64)
            .bind(key_pair.public_key_bytes())
            .bind(sealed)
            .bind(now)
            .execute(self.conn())
            .await?;
        }
        Ok(())
    }

    pub async fn get_pre_key(&mut self, key_id: u32) -> ManagerResult<Option<PreKeyRecord>> {
        let row = sqlx::query(
            "SELECT public_key, private_key, published, consumed_at FROM pre_keys WHERE key_id = ?",
        )
        .bind(key_id as i64)
        .fetch_optional(self.conn())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let consumed_at: Option<i64> = row.try_get("consumed_at")?;
        let published: i64 = row.try_get("published")?;
        let key_pair = match consumed_at {
            Some(_) => None,
            None => {
                let sealed: Vec<u8> = row.try_get("private_key")?;
                let secret = self.cipher.open(&pre_key_label(key_id), &sealed)?;
                Some(Curve25519KeyPair::from_secret_bytes(&secret).map_err(|e| {
                    ManagerError::StoreCorrupt(format!("pre-key {}: {}", key_id, e))
                })?)
            }
        };

        Ok(Some(PreKeyRecord {
            key_id,
            public_key: row.try_get("public_key")?,
            key_pair,
            published: published != 0,
            consumed_at: consumed_at.map(from_millis),
        }))
    }

    /// Tombstone a one-time key. Returns false if it was unknown or already
    /// consumed.
    pub async fn mark_pre_key_consumed(&mut self, key_id: u32) -> ManagerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pre_keys SET consumed_at = ?, private_key = x''
            WHERE key_id = ? AND consumed_at IS NULL
            "#,
        )
        .bind(now_millis())
        .bind(key_id as i64)
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_available_pre_keys(&mut self) -> ManagerResult<u32> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pre_keys WHERE consumed_at IS NULL")
            .fetch_one(self.conn())
            .await?;
        to_u32(count, "pre-key count")
    }

    /// Highest one-time key id ever issued, consumed or not
    pub async fn max_pre_key_id(&mut self) -> ManagerResult<Option<u32>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(key_id) FROM pre_keys")
            .fetch_one(self.conn())
            .await?;
        max.map(|id| to_u32(id, "pre_keys.key_id")).transpose()
    }

    /// Available one-time keys, public halves only, oldest first
    pub async fn available_pre_keys(
        &mut self,
        unpublished_only: bool,
    ) -> ManagerResult<Vec<OneTimePreKey>> {
        let rows = sqlx::query(
            r#"
            SELECT key_id, public_key FROM pre_keys
            WHERE consumed_at IS NULL AND (published = 0 OR ? = 0)
            ORDER BY key_id
            "#,
        )
        .bind(unpublished_only as i64)
        .fetch_all(self.conn())
        .await?;

        rows.iter()
            .map(|row| -> ManagerResult<OneTimePreKey> {
                Ok(OneTimePreKey {
                    key_id: to_u32(row.try_get("key_id")?, "pre_keys.key_id")?,
                    public_key: row.try_get("public_key")?,
                })
            })
            .collect()
    }

    pub async fn mark_pre_keys_published(&mut self, key_ids: &[u32]) -> ManagerResult<()> {
        for key_id in key_ids {
            sqlx::query("UPDATE pre_keys SET published = 1 WHERE key_id = ?")
                .bind(*key_id as i64)
                .execute(self.conn())
                .await?;
        }
        Ok(())
    }

    pub async fn insert_signed_pre_key(
        &mut self,
        signed: &SignedPreKey,
        key_pair: &Curve25519KeyPair,
    ) -> ManagerResult<()> {
        let sealed = self
            .cipher
            .seal(&signed_pre_key_label(signed.key_id), &key_pair.secret_key_bytes())?;

        sqlx::query(
            r#"
            INSERT INTO signed_pre_keys (key_id, public_key, private_key, signature, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(signed.key_id as i64)
        .bind(&signed.public_key[..])
        .bind(sealed)
        .bind(&signed.signature[..])
        .bind(signed.created_at * 1000)
        .execute(self.conn())
        .await?;

        Ok(())
    }

    pub async fn get_signed_pre_key(
        &mut self,
        key_id: u32,
    ) -> ManagerResult<Option<StoredSignedPreKey>> {
        let row = sqlx::query(
            r#"
            SELECT key_id, public_key, private_key, signature, created_at
            FROM signed_pre_keys WHERE key_id = ?
            "#,
        )
        .bind(key_id as i64)
        .fetch_optional(self.conn())
        .await?;

        row.map(|row| self.signed_pre_key_from_row(&row)).transpose()
    }

    pub async fn latest_signed_pre_key(&mut self) -> ManagerResult<Option<StoredSignedPreKey>> {
        let row = sqlx::query(
            r#"
            SELECT key_id, public_key, private_key, signature, created_at
            FROM signed_pre_keys ORDER BY key_id DESC LIMIT 1
            "#,
        )
        .fetch_optional(self.conn())
        .await?;

        row.map(|row| self.signed_pre_key_from_row(&row)).transpose()
    }

    /// Keep only the newest `keep` signed pre-keys
    pub async fn prune_signed_pre_keys(&mut self, keep: u32) -> ManagerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM signed_pre_keys WHERE key_id NOT IN (
                SELECT key_id FROM signed_pre_keys ORDER BY key_id DESC LIMIT ?
            )
            "#,
        )
        .bind(keep as i64)
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected())
    }

    /// Tombstone every available one-time key, used when the identity is
    /// rotated. Ids are never reused, so remote use records stay valid.
    pub async fn retire_pre_keys(&mut self) -> ManagerResult<u64> {
        let result = sqlx::query(
            "UPDATE pre_keys SET consumed_at = ?, private_key = x'' WHERE consumed_at IS NULL",
        )
        .bind(now_millis())
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected())
    }

    /// Remember that we consumed a remote device's one-time key. Returns false
    /// if it had been consumed before.
    pub async fn record_remote_pre_key_use(
        &mut self,
        owner: &DeviceAddress,
        key_id: u32,
    ) -> ManagerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO remote_pre_keys_used (account_id, device_id, key_id, used_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id, device_id, key_id) DO NOTHING
            "#,
        )
        .bind(owner.account.as_str())
        .bind(owner.device.0 as i64)
        .bind(key_id as i64)
        .bind(now_millis())
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
