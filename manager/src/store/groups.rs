//! Group state rows

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::StoreTx;
use crate::error::{ManagerError, ManagerResult};
use crate::models::{now_millis, AccountId, GroupRecord};

fn master_key_label(group_id: &[u8]) -> String {
    format!("group:{}", hex::encode(group_id))
}

impl StoreTx {
    fn group_from_row(&self, row: &SqliteRow) -> ManagerResult<GroupRecord> {
        let group_id: Vec<u8> = row.try_get("group_id")?;
        let sealed: Vec<u8> = row.try_get("master_key")?;
        let master_key = self.cipher.open(&master_key_label(&group_id), &sealed)?;
        let members: String = row.try_get("members")?;
        let members: Vec<AccountId> = serde_json::from_str(&members).map_err(|e| {
            ManagerError::StoreCorrupt(format!(
                "group {} members: {}",
                hex::encode(&group_id),
                e
            ))
        })?;
        let blocked: i64 = row.try_get("blocked")?;

        Ok(GroupRecord {
            group_id,
            master_key: master_key.to_vec(),
            members,
            blocked: blocked != 0,
        })
    }

    pub async fn upsert_group(&mut self, group: &GroupRecord) -> ManagerResult<()> {
        let sealed = self
            .cipher
            .seal(&master_key_label(&group.group_id), &group.master_key)?;
        let members = serde_json::to_string(&group.members)?;

        sqlx::query(
            r#"
            INSERT INTO groups (group_id, master_key, members, blocked, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(group_id) DO UPDATE SET
                master_key = excluded.master_key,
                members = excluded.members,
                blocked = excluded.blocked,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&group.group_id[..])
        .bind(sealed)
        .bind(members)
        .bind(group.blocked as i64)
        .bind(now_millis())
        .execute(self.conn())
        .await?;

        Ok(())
    }

    pub async fn get_group(&mut self, group_id: &[u8]) -> ManagerResult<Option<GroupRecord>> {
        let row = sqlx::query(
            "SELECT group_id, master_key, members, blocked FROM groups WHERE group_id = ?",
        )
        .bind(group_id)
        .fetch_optional(self.conn())
        .await?;

        row.map(|row| self.group_from_row(&row)).transpose()
    }

    pub async fn list_groups(&mut self) -> ManagerResult<Vec<GroupRecord>> {
        let rows = sqlx::query(
            "SELECT group_id, master_key, members, blocked FROM groups ORDER BY updated_at DESC",
        )
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(|row| self.group_from_row(row)).collect()
    }

    pub async fn delete_group(&mut self, group_id: &[u8]) -> ManagerResult<bool> {
        let result = sqlx::query("DELETE FROM groups WHERE group_id = ?")
            .bind(group_id)
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
    async fn test_group_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let mut group = GroupRecord {
            group_id: vec![0xAB; 16],
            master_key: vec![0x11; 32],
            members: vec![AccountId::new("alice"), AccountId::new("bob")],
            blocked: false,
        };

        let mut tx = store.begin().await.unwrap();
        tx.upsert_group(&group).await.unwrap();
        group.blocked = true;
        group.members.push(AccountId::new("carol"));
        tx.upsert_group(&group).await.unwrap();

        assert_eq!(tx.get_group(&group.group_id).await.unwrap(), Some(group.clone()));
        assert_eq!(tx.list_groups().await.unwrap().len(), 1);

        assert!(tx.delete_group(&group.group_id).await.unwrap());
        assert!(!tx.delete_group(&group.group_id).await.unwrap());
        assert!(tx.get_group(&group.group_id).await.unwrap().is_none());
    }
}
