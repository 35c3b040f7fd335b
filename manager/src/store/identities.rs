//! Local identity and remote identity rows

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::StoreTx;
use crate::crypto::IdentityKeyPair;
use crate::error::{ManagerError, ManagerResult};
use crate::models::{from_millis, now_millis, AccountId, Identity, TrustLevel};

const LOCAL_IDENTITY_LABEL: &str = "local_identity";

/// This account's own identity, as persisted
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub account: AccountId,
    pub key_pair: IdentityKeyPair,
    pub created_at: DateTime<Utc>,
}

impl StoreTx {
    pub async fn load_local_identity(&mut self) -> ManagerResult<Option<LocalIdentity>> {
        let row = sqlx::query(
            "SELECT account_id, private_key, created_at FROM local_identity WHERE id = 1",
        )
        .fetch_optional(self.conn())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let account: String = row.try_get("account_id")?;
        let sealed: Vec<u8> = row.try_get("private_key")?;
        let secret = self.cipher.open(LOCAL_IDENTITY_LABEL, &sealed)?;
        let key_pair = IdentityKeyPair::from_secret_bytes(&secret)
            .map_err(|e| ManagerError::StoreCorrupt(format!("local identity: {}", e)))?;

        Ok(Some(LocalIdentity {
            account: AccountId::new(account),
            key_pair,
            created_at: from_millis(row.try_get("created_at")?),
        }))
    }

    /// Insert or replace the local identity
    pub async fn save_local_identity(
        &mut self,
        account: &AccountId,
        key_pair: &IdentityKeyPair,
    ) -> ManagerResult<()> {
        let sealed = self
            .cipher
            .seal(LOCAL_IDENTITY_LABEL, &key_pair.secret_key_bytes())?;

        sqlx::query(
            r#"
            INSERT INTO local_identity (id, account_id, public_key, private_key, created_at)
            VALUES (1, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                account_id = excluded.account_id,
                public_key = excluded.public_key,
                private_key = excluded.private_key,
                created_at = excluded.created_at
            "#,
        )
        .bind(account.as_str())
        .bind(key_pair.public_key_bytes())
        .bind(sealed)
        .bind(now_millis())
        .execute(self.conn())
        .await?;

        Ok(())
    }

    pub async fn get_identity(&mut self, account: &AccountId) -> ManagerResult<Option<Identity>> {
        let row = sqlx::query(
            "SELECT public_key, trust_level, added_at FROM identities WHERE account_id = ?",
        )
        .bind(account.as_str())
        .fetch_optional(self.conn())
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let level: i64 = row.try_get("trust_level")?;
        let trust_level = TrustLevel::from_db(level).ok_or_else(|| {
            ManagerError::StoreCorrupt(format!("unknown trust level {} for {}", level, account))
        })?;

        Ok(Some(Identity {
            account: account.clone(),
            public_key: row.try_get("public_key")?,
            trust_level,
            added_at: from_millis(row.try_get("added_at")?),
        }))
    }

    pub async fn save_identity(&mut self, identity: &Identity) -> ManagerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO identities (account_id, public_key, trust_level, added_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                public_key = excluded.public_key,
                trust_level = excluded.trust_level,
                added_at = excluded.added_at
            "#,
        )
        .bind(identity.account.as_str())
        .bind(&identity.public_key[..])
        .bind(identity.trust_level.to_db())
        .bind(identity.added_at.timestamp_millis())
        .execute(self.conn())
        .await?;

        Ok(())
    }

    /// Returns false if no identity is recorded for the account
    pub async fn set_trust(&mut self, account: &AccountId, level: TrustLevel) -> ManagerResult<bool> {
        let result = sqlx::query("UPDATE identities SET trust_level = ? WHERE account_id = ?")
            .bind(level.to_db())
            .bind(account.as_str())
            .execute(self.conn())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::open_temp;

    #[tokio::test]
    async fn test_local_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let key_pair = IdentityKeyPair::generate();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.load_local_identity().await.unwrap().is_none());
        tx.save_local_identity(&AccountId::new("alice"), &key_pair)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let loaded = tx.load_local_identity().await.unwrap().unwrap();
        assert_eq!(loaded.account, AccountId::new("alice"));
        assert_eq!(loaded.key_pair.public_key_bytes(), key_pair.public_key_bytes());
    }

    #[tokio::test]
    async fn test_wrong_pickle_key_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let mut tx = store.begin().await.unwrap();
        tx.save_local_identity(&AccountId::new("alice"), &IdentityKeyPair::generate())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        store.close().await;

        let other = crate::store::Store::open(&crate::store::testing::config_in(&dir), [9u8; 32])
            .await
            .unwrap();
        let mut tx = other.begin().await.unwrap();
        let err = tx.load_local_identity().await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_identity_trust_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let bob = AccountId::new("bob");

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.set_trust(&bob, TrustLevel::TrustedVerified).await.unwrap());

        tx.save_identity(&Identity {
            account: bob.clone(),
            public_key: vec![1; 32],
            trust_level: TrustLevel::TrustedUnverified,
            added_at: Utc::now(),
        })
        .await
        .unwrap();
        assert!(tx.set_trust(&bob, TrustLevel::TrustedVerified).await.unwrap());

        let identity = tx.get_identity(&bob).await.unwrap().unwrap();
        assert_eq!(identity.trust_level, TrustLevel::TrustedVerified);
        assert_eq!(identity.public_key, vec![1; 32]);
    }
}
