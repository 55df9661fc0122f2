//! Database schema initialization

use sqlx::SqlitePool;

use crate::error::Result;

/// Initialize the central server schema
pub async fn initialize_server_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SERVER_SCHEMA_SQL).execute(pool).await?;
    sqlx::query(SNAPSHOT_SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

/// Initialize the per-device schema
pub async fn initialize_device_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(DEVICE_SCHEMA_SQL).execute(pool).await?;
    sqlx::query(SNAPSHOT_SCHEMA_SQL).execute(pool).await?;

    Ok(())
}

const SERVER_SCHEMA_SQL: &str = r#"
-- Central change log (append-only)
CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT,
    device_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 1,
    received_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_timestamp ON change_log(timestamp, id);
CREATE INDEX IF NOT EXISTS idx_change_log_dedup ON change_log(entity_type, entity_id, device_id);

-- Devices seen by the server
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    platform TEXT,
    last_sync_time INTEGER,
    last_seen INTEGER NOT NULL,
    first_seen INTEGER NOT NULL
);
"#;

const DEVICE_SCHEMA_SQL: &str = r#"
-- Local pending queue
CREATE TABLE IF NOT EXISTS pending_changes (
    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
    change_id TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    payload TEXT,
    device_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    confirmed INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    failed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pending_timestamp ON pending_changes(timestamp, queue_id);

-- Newest server log id held by this device's own write to each entity
CREATE TABLE IF NOT EXISTS own_writes (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    server_id INTEGER NOT NULL,

    PRIMARY KEY (entity_type, entity_id)
);

-- Sync cursor and device identity
CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const SNAPSHOT_SCHEMA_SQL: &str = r#"
-- Latest whole-record snapshot per entity
CREATE TABLE IF NOT EXISTS entity_snapshots (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    payload TEXT,
    deleted INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL,
    updated_by TEXT NOT NULL,

    PRIMARY KEY (entity_type, entity_id)
);
"#;
