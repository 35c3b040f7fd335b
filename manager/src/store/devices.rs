//! Device rows, for both this account and observed remote accounts

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{to_u32, StoreTx};
use crate::error::ManagerResult;
use crate::models::{from_millis, now_millis, AccountId, Device, DeviceAddress, DeviceId};

fn device_from_row(row: &SqliteRow) -> ManagerResult<Device> {
    let account: String = row.try_get("account_id")?;
    let device_id: i64 = row.try_get("device_id")?;
    let live: i64 = row.try_get("live")?;

    Ok(Device {
        address: DeviceAddress {
            account: AccountId::new(account),
            device: DeviceId(to_u32(device_id, "device_id")?),
        },
        name: row.try_get("name")?,
        identity_key: row.try_get("identity_key")?,
        registered_at: from_millis(row.try_get("registered_at")?),
        last_seen_at: from_millis(row.try_get("last_seen_at")?),
        live: live != 0,
    })
}

impl StoreTx {
    pub async fn get_device(&mut self, address: &DeviceAddress) -> ManagerResult<Option<Device>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, device_id, name, identity_key, registered_at, last_seen_at, live
            FROM devices
            WHERE account_id = ? AND device_id = ?
            "#,
        )
        .bind(address.account.as_str())
        .bind(address.device.0 as i64)
        .fetch_optional(self.conn())
        .await?;

        row.as_ref().map(device_from_row).transpose()
    }

    /// All devices of an account, live or not, by device id
    pub async fn list_devices(&mut self, account: &AccountId) -> ManagerResult<Vec<Device>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, device_id, name, identity_key, registered_at, last_seen_at, live
            FROM devices
            WHERE account_id = ?
            ORDER BY device_id
            "#,
        )
        .bind(account.as_str())
        .fetch_all(self.conn())
        .await?;

        rows.iter().map(device_from_row).collect()
    }

    /// Insert a device or bring an existing row up to date. Relinking a
    /// revoked device restarts its registration time.
    pub async fn upsert_device(&mut self, device: &Device) -> ManagerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (account_id, device_id, name, identity_key, registered_at, last_seen_at, live)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, device_id) DO UPDATE SET
                name = COALESCE(excluded.name, devices.name),
                identity_key = excluded.identity_key,
                registered_at = CASE WHEN devices.live = 0 THEN excluded.registered_at
                                     ELSE devices.registered_at END,
                last_seen_at = MAX(devices.last_seen_at, excluded.last_seen_at),
                live = excluded.live
            "#,
        )
        .bind(device.address.account.as_str())
        .bind(device.address.device.0 as i64)
        .bind(device.name.as_deref())
        .bind(&device.identity_key[..])
        .bind(device.registered_at.timestamp_millis())
        .bind(device.last_seen_at.timestamp_millis())
        .bind(device.live as i64)
        .execute(self.conn())
        .await?;

        Ok(())
    }

    /// Returns false if the device is unknown
    pub async fn set_device_live(
        &mut self,
        address: &DeviceAddress,
        live: bool,
    ) -> ManagerResult<bool> {
        let result =
            sqlx::query("UPDATE devices SET live = ? WHERE account_id = ? AND device_id = ?")
                .bind(live as i64)
                .bind(address.account.as_str())
                .bind(address.device.0 as i64)
                .execute(self.conn())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record that the device was just heard from
    pub async fn touch_device(&mut self, address: &DeviceAddress) -> ManagerResult<()> {
        sqlx::query(
            "UPDATE devices SET last_seen_at = ? WHERE account_id = ? AND device_id = ? AND live = 1",
        )
        .bind(now_millis())
        .bind(address.account.as_str())
        .bind(address.device.0 as i64)
        .execute(self.conn())
        .await?;

        Ok(())
    }

    /// Lowest device id above every id the account has ever used
    pub async fn next_device_id(&mut self, account: &AccountId) -> ManagerResult<DeviceId> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(device_id) FROM devices WHERE account_id = ?")
                .bind(account.as_str())
                .fetch_one(self.conn())
                .await?;

        match max {
            Some(max) => Ok(DeviceId(to_u32(max + 1, "device_id")?)),
            None => Ok(DeviceId::PRIMARY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::open_temp;

    #[tokio::test]
    async fn test_device_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_temp(&dir).await;
        let alice = AccountId::new("alice");
        let address = DeviceAddress::new("alice", 2);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.next_device_id(&alice).await.unwrap(), DeviceId::PRIMARY);

        tx.upsert_device(&Device::new(address.clone(), vec![1; 32], Some("laptop".into())))
            .await
            .unwrap();
        assert_eq!(tx.next_device_id(&alice).await.unwrap(), DeviceId(3));

        assert!(tx.set_device_live(&address, false).await.unwrap());
        let device = tx.get_device(&address).await.unwrap().unwrap();
        assert!(!device.live);
        assert_eq!(device.name.as_deref(), Some("laptop"));

        // Relinking without a name keeps the old one
        tx.upsert_device(&Device::new(address.clone(), vec![2; 32], None))
            .await
            .unwrap();
        let device = tx.get_device(&address).await.unwrap().unwrap();
        assert!(device.live);
        assert_eq!(device.identity_key, vec![2; 32]);
        assert_eq!(device.name.as_deref(), Some("laptop"));

        assert!(!tx
            .set_device_live(&DeviceAddress::new("alice", 9), false)
            .await
            .unwrap());
        assert_eq!(tx.list_devices(&alice).await.unwrap().len(), 1);
    }
}
