//! Device sync state
//!
//! Persists the pull high-water mark and the device's own identity in the
//! `sync_state` key/value table.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::ClientError;

const DEVICE_ID_KEY: &str = "device_id";
const LAST_SYNC_TIME_KEY: &str = "last_sync_time";
const LAST_SYNC_ID_KEY: &str = "last_sync_id";

/// Position of the last fully applied pulled record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCursor {
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Server id of that record, used to break timestamp ties
    pub last_id: Option<i64>,
}

impl SyncCursor {
    pub async fn load(pool: &SqlitePool) -> Result<Self, ClientError> {
        let time = get_value(pool, LAST_SYNC_TIME_KEY).await?;
        let id = get_value(pool, LAST_SYNC_ID_KEY).await?;

        Ok(SyncCursor {
            last_sync_time: time
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            last_id: id.and_then(|s| s.parse().ok()),
        })
    }

    /// Persist inside the caller's transaction
    pub async fn save_in(&self, conn: &mut SqliteConnection) -> Result<(), ClientError> {
        if let Some(time) = self.last_sync_time {
            set_value(
                conn,
                LAST_SYNC_TIME_KEY,
                &time.to_rfc3339_opts(SecondsFormat::Micros, true),
            )
            .await?;
        }
        if let Some(id) = self.last_id {
            set_value(conn, LAST_SYNC_ID_KEY, &id.to_string()).await?;
        }
        Ok(())
    }
}

/// The configured device id, or the one persisted on first run, or a new one
pub async fn load_or_create_device_id(
    pool: &SqlitePool,
    configured: Option<&str>,
) -> Result<String, ClientError> {
    if let Some(id) = configured {
        let mut conn = pool.acquire().await?;
        set_value(&mut conn, DEVICE_ID_KEY, id).await?;
        return Ok(id.to_string());
    }

    if let Some(id) = get_value(pool, DEVICE_ID_KEY).await? {
        return Ok(id);
    }

    let id = uuid::Uuid::new_v4().to_string();
    let mut conn = pool.acquire().await?;
    set_value(&mut conn, DEVICE_ID_KEY, &id).await?;
    tracing::info!(device_id = %id, "Generated new device id");
    Ok(id)
}

async fn get_value(pool: &SqlitePool, key: &str) -> Result<Option<String>, ClientError> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM sync_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v))
}

async fn set_value(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), ClientError> {
    sqlx::query(
        r#"
        INSERT INTO sync_state (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
