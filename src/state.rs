//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::notify::Notifier;
use crate::sync::SyncService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    sync: SyncService,
}

impl AppState {
    /// Create the state with a fresh broadcast group and the default
    /// snapshot handlers
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let sync = SyncService::from_config(db.clone(), &config.sync, Notifier::default());
        Self::with_service(config, db, sync)
    }

    /// Create the state around an already configured sync service
    pub fn with_service(config: Config, db: SqlitePool, sync: SyncService) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, db, sync }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn sync(&self) -> &SyncService {
        &self.inner.sync
    }

    /// Get the realtime broadcast group
    pub fn notifier(&self) -> &Notifier {
        self.inner.sync.notifier()
    }
}
