//! Entity handlers
//!
//! Each entity type registers a handler that knows how to apply a
//! `ChangeRecord` to its domain store. The default `SnapshotHandler` keeps
//! the latest whole-record snapshot per entity in `entity_snapshots`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{AppError, ApplyError};

use super::conflict::{ConflictPolicy, ConflictResolver};
use super::types::{from_micros, ChangeRecord, Operation};

/// Entity types served out of the box
pub const DEFAULT_ENTITY_TYPES: &[&str] = &["habits", "categories", "sessions"];

/// Applies change records for one entity type.
///
/// `apply` runs inside the caller's transaction; it must not commit.
#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> Result<(), ApplyError>;
}

/// Maps `entityType` to its handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EntityHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a `SnapshotHandler` for each default entity type
    pub fn with_snapshot_defaults(policy: ConflictPolicy) -> Self {
        let handler: Arc<dyn EntityHandler> = Arc::new(SnapshotHandler::new(policy));
        let mut registry = Self::new();
        for entity_type in DEFAULT_ENTITY_TYPES {
            registry.register(*entity_type, handler.clone());
        }
        registry
    }

    pub fn register(&mut self, entity_type: impl Into<String>, handler: Arc<dyn EntityHandler>) {
        self.handlers.insert(entity_type.into(), handler);
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.handlers.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Dispatch `record` to the handler registered for its entity type
    pub async fn apply(
        &self,
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> Result<(), ApplyError> {
        let handler = self
            .handlers
            .get(&record.entity_type)
            .ok_or_else(|| ApplyError::UnknownEntityType(record.entity_type.clone()))?;
        handler.apply(conn, record).await
    }
}

/// Whole-record snapshot store backed by the `entity_snapshots` table
pub struct SnapshotHandler {
    resolver: ConflictResolver,
}

impl SnapshotHandler {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self {
            resolver: ConflictResolver::new(policy),
        }
    }
}

#[async_trait]
impl EntityHandler for SnapshotHandler {
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        record: &ChangeRecord,
    ) -> Result<(), ApplyError> {
        let (payload, deleted) = match record.operation {
            Operation::Create | Operation::Update => {
                if !record.payload.is_object() {
                    return Err(ApplyError::InvalidPayload(format!(
                        "{} of {}/{} requires an object payload",
                        record.operation.as_str(),
                        record.entity_type,
                        record.entity_id
                    )));
                }
                (Some(serde_json::to_string(&record.payload)?), false)
            }
            Operation::Delete => (None, true),
        };

        let stored: Option<(i64,)> = sqlx::query_as(
            "SELECT updated_at FROM entity_snapshots WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .fetch_optional(&mut *conn)
        .await?;

        self.resolver
            .check(record, stored.map(|(micros,)| from_micros(micros)))?;

        sqlx::query(
            r#"
            INSERT INTO entity_snapshots (
                entity_type, entity_id, payload, deleted, updated_at, updated_by
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                payload = COALESCE(excluded.payload, entity_snapshots.payload),
                deleted = excluded.deleted,
                updated_at = excluded.updated_at,
                updated_by = excluded.updated_by
            "#,
        )
        .bind(&record.entity_type)
        .bind(&record.entity_id)
        .bind(&payload)
        .bind(deleted)
        .bind(record.timestamp.timestamp_micros())
        .bind(&record.device_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }
}

/// Current state of one entity in a snapshot store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub entity_type: String,
    pub entity_id: String,
    pub payload: Value,
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    entity_type: String,
    entity_id: String,
    payload: Option<String>,
    deleted: bool,
    updated_at: i64,
    updated_by: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot, serde_json::Error> {
        let payload = self
            .payload
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?
            .unwrap_or(Value::Null);

        Ok(Snapshot {
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            payload,
            deleted: self.deleted,
            updated_at: from_micros(self.updated_at),
            updated_by: self.updated_by,
        })
    }
}

/// Read access to the snapshot table
pub struct SnapshotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Snapshot>, AppError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT entity_type, entity_id, payload, deleted, updated_at, updated_by
            FROM entity_snapshots
            WHERE entity_type = ? AND entity_id = ?
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(SnapshotRow::into_snapshot).transpose()?)
    }

    /// Live (non-deleted) snapshots of one entity type
    pub async fn list(&self, entity_type: &str) -> Result<Vec<Snapshot>, AppError> {
        let rows = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT entity_type, entity_id, payload, deleted, updated_at, updated_by
            FROM entity_snapshots
            WHERE entity_type = ? AND deleted = 0
            ORDER BY entity_id ASC
            "#,
        )
        .bind(entity_type)
        .fetch_all(self.pool)
        .await?;

        rows.into_iter()
            .map(|r| r.into_snapshot().map_err(Into::into))
            .collect()
    }
}
