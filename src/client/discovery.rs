//! Server discovery
//!
//! Resolves a reachable server base URL. A `StaticLocator` always answers
//! with a configured URL; a `ProbingLocator` pings candidates in order and
//! caches the first one that answers until told to forget it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::transport::SyncTransport;

/// Finds the sync server
#[async_trait]
pub trait ServerLocator: Send + Sync {
    /// A base URL to talk to, or `None` when offline
    async fn locate(&self) -> Option<String>;

    /// Drop any cached endpoint after it failed
    fn invalidate(&self) {}
}

/// Always returns the same endpoint
pub struct StaticLocator {
    base_url: String,
}

impl StaticLocator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ServerLocator for StaticLocator {
    async fn locate(&self) -> Option<String> {
        Some(self.base_url.clone())
    }
}

/// Pings each candidate's `/sync/ping` and keeps the first that answers
pub struct ProbingLocator {
    candidates: Vec<String>,
    transport: Arc<dyn SyncTransport>,
    cached: Mutex<Option<String>>,
}

impl ProbingLocator {
    pub fn new(candidates: Vec<String>, transport: Arc<dyn SyncTransport>) -> Self {
        Self {
            candidates,
            transport,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ServerLocator for ProbingLocator {
    async fn locate(&self) -> Option<String> {
        let mut cached = self.cached.lock().await;
        if let Some(url) = cached.as_ref() {
            return Some(url.clone());
        }

        for candidate in &self.candidates {
            match self.transport.ping(candidate).await {
                Ok(_) => {
                    info!(url = %candidate, "Sync server located");
                    *cached = Some(candidate.clone());
                    return Some(candidate.clone());
                }
                Err(e) => debug!(url = %candidate, error = %e, "Candidate not reachable"),
            }
        }

        None
    }

    fn invalidate(&self) {
        // Only skip when a probe is in flight; it will overwrite the cache anyway
        if let Ok(mut cached) = self.cached.try_lock() {
            *cached = None;
        }
    }
}
