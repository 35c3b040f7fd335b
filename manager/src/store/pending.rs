//! Pending message rows: the outbound send log and the inbound window kept
//! for idempotent redelivery

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, to_u32, StoreTx};
use crate::error::{ManagerError, ManagerResult};
use crate::models::{
    from_millis, now_millis, AccountId, DeviceAddress, DeviceId, MessageDirection, PendingMessage,
};

fn payload_label(session_id: &Uuid, direction: MessageDirection, counter: u32) -> String {
    format!("pending:{}:{}:{}", session_id, direction.to_db(), counter)
}

/// A pending message about to be stored
#[derive(Debug, Clone)]
pub struct NewPendingMessage<'a> {
    pub peer: &'a DeviceAddress,
    pub session_id: Uuid,
    pub direction: MessageDirection,
    pub counter: u32,
    pub digest: &'a [u8],
    pub payload: &'a [u8],
}

impl StoreTx {
    fn pending_from_row(&self, row: &SqliteRow) -> ManagerResult<PendingMessage> {
        let session_id: String = row.try_get("session_id")?;
        let session_id = parse_uuid(&session_id)?;
        let direction: i64 = row.try_get("direction")?;
        let direction = MessageDirection::from_db(direction).ok_or_else(|| {
            ManagerError::StoreCorrupt(format!("unknown message direction {}", direction))
        })?;
        let counter = to_u32(row.try_get("counter")?, "pending_messages.counter")?;
        let account: String = row.try_get("remote_account")?;
        let device: i64 = row.try_get("remote_device")?;
        let sealed: Vec<u8> = row.try_get("payload")?;
        let payload = self
            .cipher
            .open(&payload_label(&session_id, direction, counter), &sealed)?;

        Ok(PendingMessage {
            id: row.try_get("id")?,
            peer: DeviceAddress {
                account: AccountId::new(account),
                device: DeviceId(to_u32(device, "remote_device")?),
            },
            session_id,
            direction,
            counter,
            digest: row.try_get("digest")?,
            payload: payload.to_vec(),
            created_at: from_millis(row.try_get("created_at")?),
        })
    }

    pub async fn insert_pending(&mut self, message: &NewPendingMessage<'_>) -> ManagerResult<i64> {
        let sealed = self.cipher.seal(
            &payload_label(&message.session_id, message.direction, message.counter),
            message.payload,
        )?;

        let result = sqlx::query(
            r#"
            INSERT INTO pending_messages (remote_account, remote_device, session_id, direction,
                                          counter, digest, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.peer.account.as_str())
        .bind(message.peer.device.0 as i64)
        .bind(message.session_id.to_string())
        .bind(message.direction.to_db())
        .bind(message.counter as i64)
        .bind(message.digest)
        .bind(sealed)
        .bind(now_millis())
        .execute(self.conn())
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn find_pending(
        &mut self,
        session_id: &Uuid,
        direction: MessageDirection,
        counter: u32,
    ) -> ManagerResult<Option<PendingMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, remote_account, remote_device, session_id, direction, counter, digest,
                   payload, created_at
            FROM pending_messages
            WHERE session_id = ? AND direction = ? AND counter = ?
            "#,
        )
        .bind(session_id.to_string())
        .bind(direction.to_db())
        .bind(counter as i64)
        .fetch_optional(self.conn())
        .await?;

        row.map(|row| self.pending_from_row(&row)).transpose()
    }

    /// Returns false if no such message was pending
    pub async fn delete_pending(
        &mut self,
        session_id: &Uuid,
        direction: MessageDirection,
        counter: u32,
    ) -> ManagerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM pending_messages WHERE session_id = ? AND direction = ? AND counter = ?",
        )
        .bind(session_id.to_string())
        .bind(direction.to_db())
        .bind(counter as i64)
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Pending messages for a peer device in one direction, oldest first
    pub async fn list_pending(
        &mut self,
        peer: &DeviceAddress,
        direction: MessageDirection,
    ) -> ManagerResult<Vec<PendingMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, remote_account, remote_device, session_id, direction, counter, digest,
                   payload, created_at
            FROM pending_messages
            WHERE remote_account = ? AND remote_device = ? AND direction = ?
            ORDER BY id
            "#,
        )
        .bind(peer.account.as_str())
        .bind(peer.device.0 as i64)
        .bind(direction.to_db())
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(|row| self.pending_from_row(row)).collect()
    }

    /// Delete pending messages created before `cutoff_millis`
    pub async fn prune_pending(&mut self, cutoff_millis: i64) -> ManagerResult<u64> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE created_at < ?")
            .bind(cutoff_millis)
            .execute(self.conn())
            .await?;

        Ok(result.rows_affected())
    }

    /// Drop inbound rows of a session that fell below the replay window
    pub async fn prune_inbound_window(
        &mut self,
        session_id: &Uuid,
        lowest_kept: u32,
    ) -> ManagerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM pending_messages WHERE session_id = ? AND direction = ? AND counter < ?",
        )
        .bind(session_id.to_string())
        .bind(MessageDirection::Inbound.to_db())
        .bind(lowest_kept as i64)
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::open_temp;

    fn inbound<'a>(peer: &'a DeviceAddress, session_id: Uuid, counter: u32) -> NewPendingMessage<'a> {
        NewPendingMessage {
            peer,
            session_id,
            direction: MessageDirection::Inbound,
            counter,
            digest: b"digest",
            payload: b"plaintext",
        }
    }

    #[tokio::test]
    async fn test_pending_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let bob = DeviceAddress::new("bob", 1);
        let session_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        for counter in 0..5 {
            tx.insert_pending(&inbound(&bob, session_id, counter))
                .await
                .unwrap();
        }
        // Same (session, direction, counter) twice is rejected
        assert!(tx.insert_pending(&inbound(&bob, session_id, 4)).await.is_err());

        let found = tx
            .find_pending(&session_id, MessageDirection::Inbound, 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.payload, b"plaintext".to_vec());
        assert_eq!(found.peer, bob);

        assert_eq!(tx.prune_inbound_window(&session_id, 3).await.unwrap(), 3);
        assert_eq!(
            tx.list_pending(&bob, MessageDirection::Inbound).await.unwrap().len(),
            2
        );
        assert!(tx
            .delete_pending(&session_id, MessageDirection::Inbound, 4)
            .await
            .unwrap());
        assert!(tx
            .list_pending(&bob, MessageDirection::Outbound)
            .await
            .unwrap()
            .is_empty());

        assert_eq!(tx.prune_pending(now_millis() + 1_000).await.unwrap(), 1);
    }
}
