//! Device bookkeeping
//!
//! Devices are registered on first contact and refreshed on every push,
//! pull or realtime join. They are never removed automatically.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::Result;

use super::types::{from_micros, DeviceInfo};

/// Repository for device rows
pub struct DeviceRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> DeviceRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Record that a device was seen just now
    pub async fn touch(&self, device_id: &str, platform: Option<&str>) -> Result<()> {
        self.upsert(device_id, platform, None).await
    }

    /// Record a pull; `high_water` only ever moves `last_sync_time` forward
    pub async fn record_pull(
        &self,
        device_id: &str,
        platform: Option<&str>,
        high_water: DateTime<Utc>,
    ) -> Result<()> {
        self.upsert(device_id, platform, Some(high_water)).await
    }

    async fn upsert(
        &self,
        device_id: &str,
        platform: Option<&str>,
        high_water: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_micros();

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, platform, last_sync_time, last_seen, first_seen)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                platform = COALESCE(excluded.platform, devices.platform),
                last_sync_time = CASE
                    WHEN excluded.last_sync_time IS NULL THEN devices.last_sync_time
                    WHEN devices.last_sync_time IS NULL THEN excluded.last_sync_time
                    ELSE MAX(devices.last_sync_time, excluded.last_sync_time)
                END,
                last_seen = excluded.last_seen
            "#,
        )
        .bind(device_id)
        .bind(platform)
        .bind(high_water.map(|t| t.timestamp_micros()))
        .bind(now)
        .bind(now)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceInfo>> {
        let row = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, platform, last_sync_time, last_seen, first_seen
            FROM devices
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// All known devices, most recently seen first
    pub async fn list(&self) -> Result<Vec<DeviceInfo>> {
        let rows = sqlx::query_as::<_, DeviceRow>(
            r#"
            SELECT device_id, platform, last_sync_time, last_seen, first_seen
            FROM devices
            ORDER BY last_seen DESC
            "#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM devices")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    device_id: String,
    platform: Option<String>,
    last_sync_time: Option<i64>,
    last_seen: i64,
    first_seen: i64,
}

impl From<DeviceRow> for DeviceInfo {
    fn from(row: DeviceRow) -> Self {
        DeviceInfo {
            device_id: row.device_id,
            last_sync_time: row.last_sync_time.map(from_micros),
            platform: row.platform,
            last_seen: from_micros(row.last_seen),
            first_seen: from_micros(row.first_seen),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn test_first_contact_creates_device() {
        let pool = test_pool().await;
        let repo = DeviceRepository::new(&pool);

        assert!(repo.get("phone").await.unwrap().is_none());
        repo.touch("phone", Some("mobile")).await.unwrap();

        let device = repo.get("phone").await.unwrap().unwrap();
        assert_eq!(device.platform.as_deref(), Some("mobile"));
        assert!(device.last_sync_time.is_none());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_platform_kept_when_not_reported() {
        let pool = test_pool().await;
        let repo = DeviceRepository::new(&pool);

        repo.touch("web-1", Some("web")).await.unwrap();
        repo.touch("web-1", None).await.unwrap();

        let device = repo.get("web-1").await.unwrap().unwrap();
        assert_eq!(device.platform.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn test_last_sync_time_only_moves_forward() {
        let pool = test_pool().await;
        let repo = DeviceRepository::new(&pool);
        let later = Utc::now();
        let earlier = later - Duration::minutes(10);

        repo.record_pull("desk", None, later).await.unwrap();
        repo.record_pull("desk", None, earlier).await.unwrap();
        repo.touch("desk", None).await.unwrap();

        let device = repo.get("desk").await.unwrap().unwrap();
        assert_eq!(
            device.last_sync_time.unwrap().timestamp_micros(),
            later.timestamp_micros()
        );
        assert!(device.first_seen <= device.last_seen);
    }
}
