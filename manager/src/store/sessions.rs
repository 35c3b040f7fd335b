//! Session rows
//!
//! The full session state is sealed in `record`; the plain columns exist so
//! sessions can be found and summarized without unsealing them.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, to_u32, StoreTx};
use crate::error::{ManagerError, ManagerResult};
use crate::models::{
    from_millis, now_millis, AccountId, DeviceAddress, DeviceId, SessionStatus, SessionSummary,
};
use crate::session::Session;

fn record_label(id: &Uuid) -> String {
    format!("session:{}", id)
}

fn status_from_row(row: &SqliteRow) -> ManagerResult<SessionStatus> {
    let status: i64 = row.try_get("status")?;
    SessionStatus::from_db(status)
        .ok_or_else(|| ManagerError::StoreCorrupt(format!("unknown session status {}", status)))
}

fn summary_from_row(row: &SqliteRow) -> ManagerResult<SessionSummary> {
    let session_id: String = row.try_get("session_id")?;
    let account: String = row.try_get("remote_account")?;
    let device: i64 = row.try_get("remote_device")?;
    let pre_key_id: Option<i64> = row.try_get("pre_key_id")?;

    Ok(SessionSummary {
        session_id: parse_uuid(&session_id)?,
        peer: DeviceAddress {
            account: AccountId::new(account),
            device: DeviceId(to_u32(device, "remote_device")?),
        },
        status: status_from_row(row)?,
        pre_key_id: pre_key_id.map(|id| to_u32(id, "pre_key_id")).transpose()?,
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
    })
}

impl StoreTx {
    fn session_from_row(&self, row: &SqliteRow) -> ManagerResult<Session> {
        let session_id: String = row.try_get("session_id")?;
        let id = parse_uuid(&session_id)?;
        let sealed: Vec<u8> = row.try_get("record")?;

        let mut session: Session = self.cipher.open_json(&record_label(&id), &sealed)?;
        if session.id != id {
            return Err(ManagerError::StoreCorrupt(format!(
                "session row {} holds record for {}",
                id, session.id
            )));
        }
        // The column is authoritative; status changes never rewrite the record
        session.status = status_from_row(row)?;
        Ok(session)
    }

    /// The single active session with a peer device
    pub async fn active_session(&mut self, peer: &DeviceAddress) -> ManagerResult<Option<Session>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, status, record FROM sessions
            WHERE remote_account = ? AND remote_device = ? AND status = 0
            "#,
        )
        .bind(peer.account.as_str())
        .bind(peer.device.0 as i64)
        .fetch_optional(self.conn())
        .await?;

        row.map(|row| self.session_from_row(&row)).transpose()
    }

    pub async fn session_by_id(&mut self, id: &Uuid) -> ManagerResult<Option<Session>> {
        let row = sqlx::query("SELECT session_id, status, record FROM sessions WHERE session_id = ?")
            .bind(id.to_string())
            .fetch_optional(self.conn())
            .await?;

        row.map(|row| self.session_from_row(&row)).transpose()
    }

    /// Insert a new session. Fails if it would be a second active session
    /// for the same peer device.
    pub async fn insert_session(&mut self, session: &Session) -> ManagerResult<()> {
        let sealed = self.cipher.seal_json(&record_label(&session.id), session)?;
        let now = now_millis();
        let archived_at = (session.status != SessionStatus::Active).then_some(now);

        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, remote_account, remote_device, status, pre_key_id,
                                  record, created_at, updated_at, archived_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.remote.account.as_str())
        .bind(session.remote.device.0 as i64)
        .bind(session.status.to_db())
        .bind(session.pre_key_id.map(i64::from))
        .bind(sealed)
        .bind(session.created_at.timestamp_millis())
        .bind(now)
        .bind(archived_at)
        .execute(self.conn())
        .await?;

        Ok(())
    }

    /// Persist the advanced state of an existing session
    pub async fn update_session(&mut self, session: &Session) -> ManagerResult<()> {
        let sealed = self.cipher.seal_json(&record_label(&session.id), session)?;

        let result =
            sqlx::query("UPDATE sessions SET record = ?, updated_at = ? WHERE session_id = ?")
                .bind(sealed)
                .bind(now_millis())
                .bind(session.id.to_string())
                .execute(self.conn())
                .await?;

        if result.rows_affected() == 0 {
            return Err(ManagerError::SessionNotFound(session.remote.clone()));
        }
        Ok(())
    }

    /// Change a session's status. Returns false if the session is unknown.
    pub async fn set_session_status(
        &mut self,
        id: &Uuid,
        status: SessionStatus,
    ) -> ManagerResult<bool> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET status = ?, updated_at = ?,
                archived_at = CASE WHEN ? = 0 THEN NULL ELSE COALESCE(archived_at, ?) END
            WHERE session_id = ?
            "#,
        )
        .bind(status.to_db())
        .bind(now)
        .bind(status.to_db())
        .bind(now)
        .bind(id.to_string())
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Archive the active session with a peer device, returning its id
    pub async fn archive_active_session(
        &mut self,
        peer: &DeviceAddress,
    ) -> ManagerResult<Option<Uuid>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE sessions SET status = 1, updated_at = ?, archived_at = ?
            WHERE remote_account = ? AND remote_device = ? AND status = 0
            RETURNING session_id
            "#,
        )
        .bind(now_millis())
        .bind(now_millis())
        .bind(peer.account.as_str())
        .bind(peer.device.0 as i64)
        .fetch_optional(self.conn())
        .await?;

        id.as_deref().map(parse_uuid).transpose()
    }

    /// Archive every active session with an account
    pub async fn archive_account_sessions(&mut self, account: &AccountId) -> ManagerResult<u64> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE sessions SET status = 1, updated_at = ?, archived_at = ?
            WHERE remote_account = ? AND status = 0
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(account.as_str())
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected())
    }

    /// Invalidate every usable session with a peer device
    pub async fn invalidate_sessions(&mut self, peer: &DeviceAddress) -> ManagerResult<u64> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE sessions SET status = 2, updated_at = ?, archived_at = COALESCE(archived_at, ?)
            WHERE remote_account = ? AND remote_device = ? AND status != 2
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(peer.account.as_str())
        .bind(peer.device.0 as i64)
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected())
    }

    /// Invalidate every session, used when the local identity is rotated
    pub async fn invalidate_all_sessions(&mut self) -> ManagerResult<u64> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE sessions SET status = 2, updated_at = ?, archived_at = COALESCE(archived_at, ?)
            WHERE status != 2
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(self.conn())
        .await?;

        Ok(result.rows_affected())
    }

    /// The session with a peer device that was archived last, which a new
    /// outbound session takes over from
    pub async fn last_archived_session(
        &mut self,
        peer: &DeviceAddress,
    ) -> ManagerResult<Option<Uuid>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT session_id FROM sessions
            WHERE remote_account = ? AND remote_device = ? AND status = 1
            ORDER BY archived_at DESC, updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(peer.account.as_str())
        .bind(peer.device.0 as i64)
        .fetch_optional(self.conn())
        .await?;

        id.as_deref().map(parse_uuid).transpose()
    }

    /// Summaries of all sessions with a peer device, newest first
    pub async fn list_sessions(&mut self, peer: &DeviceAddress) -> ManagerResult<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, remote_account, remote_device, status, pre_key_id, created_at, updated_at
            FROM sessions
            WHERE remote_account = ? AND remote_device = ?
            ORDER BY created_at DESC, session_id
            "#,
        )
        .bind(peer.account.as_str())
        .bind(peer.device.0 as i64)
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    /// Summaries of every active session
    pub async fn list_active_sessions(&mut self) -> ManagerResult<Vec<SessionSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, remote_account, remote_device, status, pre_key_id, created_at, updated_at
            FROM sessions
            WHERE status = 0
            ORDER BY remote_account, remote_device
            "#,
        )
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    /// Delete archived and invalidated sessions archived before `cutoff`, and
    /// all but the newest `keep_per_peer` of them for each peer device.
    pub async fn purge_archived_sessions(
        &mut self,
        cutoff_millis: i64,
        keep_per_peer: u32,
    ) -> ManagerResult<u64> {
        let expired = sqlx::query("DELETE FROM sessions WHERE status != 0 AND archived_at < ?")
            .bind(cutoff_millis)
            .execute(self.conn())
            .await?;

        let excess = sqlx::query(
            r#"
            DELETE FROM sessions WHERE session_id IN (
                SELECT session_id FROM (
                    SELECT session_id, ROW_NUMBER() OVER (
                        PARTITION BY remote_account, remote_device
                        ORDER BY archived_at DESC, session_id
                    ) AS rank
                    FROM sessions
                    WHERE status != 0
                ) WHERE rank > ?
            )
            "#,
        )
        .bind(keep_per_peer as i64)
        .execute(self.conn())
        .await?;

        Ok(expired.rows_affected() + excess.rows_affected())
    }
}
