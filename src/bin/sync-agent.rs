//! Habit Sync device agent
//!
//! Opens the local store, runs the periodic push/pull loop and keeps the
//! realtime connection open so remote changes arrive quickly.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use habit_sync::client::{
    load_or_create_device_id, log_reports, HttpTransport, ProbingLocator, ServerLocator, SyncClient,
    SyncOptions, SyncTransport,
};
use habit_sync::config::ClientConfig;
use habit_sync::db::{self, Role};
use habit_sync::notify::NotifierClient;
use habit_sync::sync::{ConflictPolicy, HandlerRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "habit_sync=debug,sync_agent=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = ClientConfig::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        ClientConfig::default()
    });

    if config.server_urls.is_empty() {
        tracing::warn!("SYNC_SERVER_URLS is empty; running offline");
    }

    let pool = db::create_pool(&config.local_database_url, Role::Device)
        .await
        .context("failed to open local store")?;
    let device_id = load_or_create_device_id(&pool, config.device_id.as_deref()).await?;

    tracing::info!(
        "Starting sync agent v{} as device {} ({})",
        env!("CARGO_PKG_VERSION"),
        device_id,
        config.platform
    );

    let transport: Arc<dyn SyncTransport> = Arc::new(HttpTransport::new(config.request_timeout)?);
    let locator: Arc<dyn ServerLocator> =
        Arc::new(ProbingLocator::new(config.server_urls.clone(), transport.clone()));

    let client = Arc::new(SyncClient::new(
        pool,
        device_id.clone(),
        HandlerRegistry::with_snapshot_defaults(ConflictPolicy::LastApplied),
        transport,
        locator.clone(),
        SyncOptions {
            platform: Some(config.platform.clone()),
            max_push_attempts: config.max_push_attempts,
            page_size: config.page_size,
            max_push_batch: config.max_push_batch,
        },
    ));

    let reports = client.subscribe();
    let sync = client.clone().spawn(config.sync_interval);

    let notifier = NotifierClient::new(locator, device_id, Some(config.platform.clone()))
        .with_reconnect_delay(config.reconnect_delay)
        .with_connect_timeout(config.request_timeout)
        .spawn(sync.trigger_sender());

    let report_logger = tokio::spawn(log_reports(reports));

    signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    tracing::info!("Received Ctrl+C, stopping sync agent...");

    notifier.shutdown().await;
    sync.shutdown().await;
    report_logger.abort();

    let status = client.status();
    tracing::info!(
        pending = status.pending_changes,
        failed = status.failed_changes,
        "Sync agent stopped"
    );
    Ok(())
}
