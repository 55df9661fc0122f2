//! Local pending queue
//!
//! Every local mutation is staged here until the server acknowledges it.
//! The queue lives in the device database so it survives restarts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{ApplyError, ClientError};
use crate::sync::log::{decode_payload, encode_payload};
use crate::sync::{from_micros, AssignedId, ChangeRecord, HandlerRegistry, Operation};

/// A staged change plus local bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQueueEntry {
    pub queue_id: i64,
    pub record: ChangeRecord,
    pub confirmed: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed: bool,
}

/// Durable queue of unconfirmed local changes
#[derive(Clone)]
pub struct PendingQueue {
    pool: SqlitePool,
    device_id: String,
}

impl PendingQueue {
    pub fn new(pool: SqlitePool, device_id: impl Into<String>) -> Self {
        Self {
            pool,
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Stage a change stamped with this device and the current time
    pub async fn enqueue(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<ChangeRecord, ClientError> {
        let mut conn = self.pool.acquire().await?;
        self.enqueue_in(&mut conn, entity_type, entity_id, operation, payload)
            .await
    }

    /// Stage a change inside a caller-owned transaction, so the domain
    /// write and the queue write commit or fail together.
    pub async fn enqueue_in(
        &self,
        conn: &mut SqliteConnection,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<ChangeRecord, ClientError> {
        let record = ChangeRecord::new(entity_type, entity_id, operation, payload, &self.device_id);

        sqlx::query(
            r#"
            INSERT INTO pending_changes (
                change_id, entity_type, entity_id, operation,
                payload, device_id, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.change_id)
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(record.operation.as_str())
        .bind(encode_payload(&record.payload)?)
        .bind(&record.device_id)
        .bind(record.timestamp.timestamp_micros())
        .execute(&mut *conn)
        .await?;

        tracing::debug!(
            change_id = %record.change_id,
            entity_type,
            entity_id,
            operation = record.operation.as_str(),
            "Change queued"
        );

        Ok(record)
    }

    /// Apply a mutation to the local snapshot store and stage it, atomically
    pub async fn record_mutation(
        &self,
        handlers: &HandlerRegistry,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<ChangeRecord, ClientError> {
        let mut tx = self.pool.begin().await?;
        let record = self
            .enqueue_in(&mut tx, entity_type, entity_id, operation, payload)
            .await?;
        handlers.apply(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// Unconfirmed, not parked entries, oldest first
    pub async fn drain(&self) -> Result<Vec<PendingQueueEntry>, ClientError> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT queue_id, change_id, entity_type, entity_id, operation, payload,
                   device_id, timestamp, confirmed, attempts, last_error, failed
            FROM pending_changes
            WHERE confirmed = 0 AND failed = 0
            ORDER BY timestamp ASC, queue_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingRow::into_entry).collect()
    }

    /// Remove acknowledged entries. Each id is marked then removed in its
    /// own statement pair; unknown ids are ignored.
    pub async fn confirm(&self, change_ids: &[String]) -> Result<u64, ClientError> {
        if change_ids.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut tx = self.pool.begin().await?;
        for change_id in change_ids {
            sqlx::query("UPDATE pending_changes SET confirmed = 1 WHERE change_id = ?")
                .bind(change_id)
                .execute(&mut *tx)
                .await?;
            removed += sqlx::query("DELETE FROM pending_changes WHERE change_id = ? AND confirmed = 1")
                .bind(change_id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(removed)
    }

    /// Remember the server log ids of acknowledged changes, per entity.
    /// Must run before `confirm`, which drops the entries it reads from.
    pub async fn record_assigned(&self, assigned: &[AssignedId]) -> Result<(), ClientError> {
        if assigned.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for AssignedId { change_id, id } in assigned {
            sqlx::query(
                r#"
                INSERT INTO own_writes (entity_type, entity_id, server_id)
                SELECT entity_type, entity_id, ? FROM pending_changes WHERE change_id = ?
                ON CONFLICT(entity_type, entity_id)
                DO UPDATE SET server_id = MAX(server_id, excluded.server_id)
                "#,
            )
            .bind(*id)
            .bind(change_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Whether this device's own write to the entity sits after log id
    /// `server_id` on the server, so the server already applied it last.
    pub async fn has_later_own_write(
        &self,
        entity_type: &str,
        entity_id: &str,
        server_id: i64,
    ) -> Result<bool, ClientError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT server_id FROM own_writes
            WHERE entity_type = ? AND entity_id = ? AND server_id > ?
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Count a failed push attempt. Returns `true` when the entry has been
    /// parked because it reached `max_attempts`.
    pub async fn record_failure(
        &self,
        change_id: &str,
        error: &str,
        max_attempts: u32,
    ) -> Result<bool, ClientError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE pending_changes
            SET attempts = attempts + 1,
                last_error = ?,
                failed = CASE WHEN attempts + 1 >= ? THEN 1 ELSE 0 END
            WHERE change_id = ?
            RETURNING failed
            "#,
        )
        .bind(error)
        .bind(i64::from(max_attempts))
        .bind(change_id)
        .fetch_optional(&self.pool)
        .await?;

        let parked = matches!(row, Some((1,)));
        if parked {
            tracing::warn!(change_id, error, "Change parked after repeated push failures");
        }
        Ok(parked)
    }

    /// Whether an unpushed local change to the same entity is newer than
    /// `than`. Such a change will overwrite the remote one once pushed.
    pub async fn has_newer_pending(
        &self,
        entity_type: &str,
        entity_id: &str,
        than: DateTime<Utc>,
    ) -> Result<bool, ClientError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT queue_id FROM pending_changes
            WHERE entity_type = ? AND entity_id = ? AND timestamp > ?
              AND confirmed = 0 AND failed = 0
            LIMIT 1
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(than.timestamp_micros())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Entries waiting to be pushed
    pub async fn pending_count(&self) -> Result<i64, ClientError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pending_changes WHERE confirmed = 0 AND failed = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn failed_count(&self) -> Result<i64, ClientError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pending_changes WHERE failed = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Parked entries, for surfacing to the user
    pub async fn failed(&self) -> Result<Vec<PendingQueueEntry>, ClientError> {
        let rows = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT queue_id, change_id, entity_type, entity_id, operation, payload,
                   device_id, timestamp, confirmed, attempts, last_error, failed
            FROM pending_changes
            WHERE failed = 1
            ORDER BY timestamp ASC, queue_id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingRow::into_entry).collect()
    }

    /// Put parked entries back in line with a fresh attempt budget
    pub async fn retry_failed(&self) -> Result<u64, ClientError> {
        let result = sqlx::query(
            "UPDATE pending_changes SET failed = 0, attempts = 0 WHERE failed = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct PendingRow {
    queue_id: i64,
    change_id: String,
    entity_type: String,
    entity_id: String,
    operation: String,
    payload: Option<String>,
    device_id: String,
    timestamp: i64,
    confirmed: bool,
    attempts: i64,
    last_error: Option<String>,
    failed: bool,
}

impl PendingRow {
    fn into_entry(self) -> Result<PendingQueueEntry, ClientError> {
        let operation = self
            .operation
            .parse::<Operation>()
            .map_err(ApplyError::InvalidPayload)?;

        Ok(PendingQueueEntry {
            queue_id: self.queue_id,
            record: ChangeRecord {
                id: 0,
                change_id: self.change_id,
                entity_type: self.entity_type,
                entity_id: self.entity_id,
                operation,
                payload: decode_payload(self.payload.as_deref())?,
                device_id: self.device_id,
                timestamp: from_micros(self.timestamp),
                synced: false,
            },
            confirmed: self.confirmed,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            last_error: self.last_error,
            failed: self.failed,
        })
    }
}
