//! Database module for SQLite persistence
//!
//! The server keeps the central change log, device registry and
//! authoritative snapshots; each device keeps its pending queue, sync cursor
//! and local snapshots. Both sides use the same pool setup.

mod schema;

pub use schema::*;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::error::Result;

/// Which set of tables a pool should carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Device,
}

/// Create a new database connection pool and initialize its schema
pub async fn create_pool(database_url: &str, role: Role) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    match role {
        Role::Server => initialize_server_schema(&pool).await?,
        Role::Device => initialize_device_schema(&pool).await?,
    }

    Ok(pool)
}

/// Single-connection in-memory pool with the requested schema
#[cfg(test)]
pub(crate) async fn memory_pool(role: Role) -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    match role {
        Role::Server => initialize_server_schema(&pool).await.unwrap(),
        Role::Device => initialize_device_schema(&pool).await.unwrap(),
    }

    pool
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    memory_pool(Role::Server).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_pool_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("server.db").display());

        let pool = create_pool(&url, Role::Server).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM change_log")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        // Re-initializing is a no-op
        initialize_server_schema(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_device_pool_has_queue() {
        let pool = memory_pool(Role::Device).await;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM pending_changes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
