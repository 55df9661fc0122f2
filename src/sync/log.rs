//! Central change log persistence
//!
//! SQLite storage for the append-only log of accepted changes.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{AppError, ApplyError, Result};

use super::types::{from_micros, ChangeRecord, Operation};

/// Repository for the change log
pub struct ChangeLogRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ChangeLogRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Look for an already-logged record with the same de-duplication key
    /// and the same logical content. Returns its server id.
    pub async fn find_duplicate(
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> std::result::Result<Option<i64>, ApplyError> {
        let payload = encode_payload(&record.payload)?;

        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM change_log
            WHERE entity_type = ? AND entity_id = ? AND device_id = ?
              AND operation = ? AND timestamp = ? AND payload IS ?
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&record.device_id)
        .bind(record.operation.as_str())
        .bind(record.timestamp.timestamp_micros())
        .bind(&payload)
        .fetch_optional(&mut *conn)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    /// Append a record and return its server-assigned id
    pub async fn append(
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> std::result::Result<i64, ApplyError> {
        let payload = encode_payload(&record.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO change_log (
                change_id, entity_type, entity_id, operation,
                payload, device_id, timestamp, synced, received_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&record.change_id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(record.operation.as_str())
        .bind(&payload)
        .bind(&record.device_id)
        .bind(record.timestamp.timestamp_micros())
        .bind(Utc::now().timestamp_micros())
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Records newer than `since`, excluding one device, oldest first.
    ///
    /// With `after_id`, records stamped exactly `since` whose id is greater
    /// are included too, so a caller paging on `(timestamp, id)` never skips
    /// ties at a page boundary.
    pub async fn changes_since(
        &self,
        since: DateTime<Utc>,
        exclude_device_id: Option<&str>,
        after_id: Option<i64>,
        limit: u32,
    ) -> Result<Vec<ChangeRecord>> {
        let since = since.timestamp_micros();

        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, change_id, entity_type, entity_id, operation,
                   payload, device_id, timestamp, synced
            FROM change_log
            WHERE (timestamp > ? OR (? IS NOT NULL AND timestamp = ? AND id > ?))
              AND (? IS NULL OR device_id != ?)
            ORDER BY timestamp ASC, id ASC
            LIMIT ?
            "#,
        )
        .bind(since)
        .bind(after_id)
        .bind(since)
        .bind(after_id)
        .bind(exclude_device_id)
        .bind(exclude_device_id)
        .bind(i64::from(limit))
        .fetch_all(self.pool)
        .await?;

        rows.into_iter().map(ChangeRow::into_record).collect()
    }

    /// Total number of logged records
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_log")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    /// Number of records stamped after `cutoff`
    pub async fn count_since(&self, cutoff: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM change_log WHERE timestamp > ?")
                .bind(cutoff.timestamp_micros())
                .fetch_one(self.pool)
                .await?;
        Ok(count)
    }

    /// Timestamp of the newest logged record
    pub async fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(timestamp) FROM change_log")
            .fetch_one(self.pool)
            .await?;
        Ok(max.map(from_micros))
    }

    /// Delete records stamped before `older_than`
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM change_log WHERE timestamp < ?")
            .bind(older_than.timestamp_micros())
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// `Null` payloads are stored as SQL NULL
pub(crate) fn encode_payload(payload: &Value) -> serde_json::Result<Option<String>> {
    match payload {
        Value::Null => Ok(None),
        other => serde_json::to_string(other).map(Some),
    }
}

pub(crate) fn decode_payload(payload: Option<&str>) -> serde_json::Result<Value> {
    payload
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map(Option::unwrap_or_default)
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    id: i64,
    change_id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: Option<String>,
    device_id: String,
    timestamp: i64,
    synced: bool,
}

impl ChangeRow {
    fn into_record(self) -> Result<ChangeRecord> {
        let operation = self.operation.parse::<Operation>().map_err(AppError::Internal)?;

        Ok(ChangeRecord {
            id: self.id,
            change_id: self.change_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            operation,
            payload: decode_payload(self.payload.as_deref())?,
            device_id: self.device_id,
            timestamp: from_micros(self.timestamp),
            synced: self.synced,
        })
    }
}
