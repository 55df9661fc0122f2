//! Configuration management for Habit Sync

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::sync::ConflictPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Maximum number of records returned by one pull
    pub page_size: u32,
    /// How concurrent edits to the same entity are arbitrated
    pub conflict_policy: ConflictPolicy,
    /// Default window for the `recentChanges` status counter
    pub recent_window_minutes: i64,
    /// Largest accepted push request body, in bytes
    pub max_push_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
            },
            database: DatabaseConfig {
                url: "sqlite:./habit-sync.db".to_string(),
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            page_size: 1000,
            conflict_policy: ConflictPolicy::LastApplied,
            recent_window_minutes: 60,
            max_push_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = SyncConfig::default();
        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parse_var("SERVER_PORT", 5000)?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:./habit-sync.db".to_string()),
            },
            sync: SyncConfig {
                page_size: parse_var("SYNC_PAGE_SIZE", defaults.page_size)?,
                conflict_policy: match env::var("SYNC_CONFLICT_POLICY") {
                    Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                        key: "SYNC_CONFLICT_POLICY",
                        value,
                    })?,
                    Err(_) => defaults.conflict_policy,
                },
                recent_window_minutes: parse_var(
                    "SYNC_RECENT_WINDOW_MINUTES",
                    defaults.recent_window_minutes,
                )?,
                max_push_bytes: parse_var("SYNC_MAX_PUSH_BYTES", defaults.max_push_bytes)?,
            },
        })
    }
}

/// Device-side configuration for the sync agent
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Candidate server base URLs, probed in order
    pub server_urls: Vec<String>,
    /// Stable device identity; generated and persisted locally when absent
    pub device_id: Option<String>,
    pub platform: String,
    pub local_database_url: String,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_push_attempts: u32,
    /// Records per push request
    pub max_push_batch: usize,
    /// Must match the server's `SYNC_PAGE_SIZE`
    pub page_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_urls: Vec::new(),
            device_id: None,
            platform: "desktop".to_string(),
            local_database_url: "sqlite:./habit-sync-local.db".to_string(),
            sync_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_push_attempts: 5,
            max_push_batch: 500,
            page_size: 1000,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ClientConfig::default();
        Ok(ClientConfig {
            server_urls: env::var("SYNC_SERVER_URLS")
                .map(|urls| {
                    urls.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(|u| u.trim_end_matches('/').to_string())
                        .collect()
                })
                .unwrap_or_default(),
            device_id: env::var("DEVICE_ID").ok().filter(|id| !id.trim().is_empty()),
            platform: env::var("DEVICE_PLATFORM").unwrap_or(defaults.platform),
            local_database_url: env::var("LOCAL_DATABASE_URL")
                .unwrap_or(defaults.local_database_url),
            sync_interval: Duration::from_secs(parse_var("SYNC_INTERVAL_SECS", 30)?),
            request_timeout: Duration::from_secs(parse_var("SYNC_TIMEOUT_SECS", 10)?),
            reconnect_delay: Duration::from_secs(parse_var("NOTIFIER_RECONNECT_SECS", 5)?),
            max_push_attempts: parse_var("SYNC_MAX_PUSH_ATTEMPTS", defaults.max_push_attempts)?,
            max_push_batch: parse_var("SYNC_PUSH_BATCH", defaults.max_push_batch)?,
            page_size: parse_var("SYNC_PAGE_SIZE", defaults.page_size)?,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
