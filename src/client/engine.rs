//! Sync client
//!
//! Runs push-then-pull cycles against whichever server the locator finds.
//! Cycles are triggered by a timer, by the user, or by realtime events; a
//! trigger that arrives while a cycle is running is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::sync::{
    from_micros, ChangeRecord, HandlerRegistry, Operation, PullQuery, PushResponse,
    DEFAULT_PAGE_SIZE,
};

use super::cursor::SyncCursor;
use super::discovery::ServerLocator;
use super::queue::PendingQueue;
use super::transport::SyncTransport;

/// What started a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Timer,
    Manual,
    /// Another device changed data
    Notification,
    /// The realtime channel came back; events may have been missed
    Reconnected,
}

/// Where the client is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Success,
    Failed,
}

/// Snapshot of the client for UIs
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub state: SyncState,
    /// Outcome of the most recent finished cycle
    pub last_outcome: Option<SyncState>,
    pub online: bool,
    pub pending_changes: i64,
    pub failed_changes: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for ClientStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            last_outcome: None,
            online: false,
            pending_changes: 0,
            failed_changes: 0,
            last_sync_time: None,
            last_error: None,
        }
    }
}

/// Result of one cycle
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub outcome: SyncState,
    pub online: bool,
    /// Records the server accepted, duplicates included
    pub pushed: usize,
    pub duplicates: usize,
    /// Records received from the server
    pub pulled: usize,
    /// Records applied to the local store
    pub applied: usize,
    /// Per-record problems, plus the cycle error when the cycle failed
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncReport {
    fn new(trigger: SyncTrigger) -> Self {
        let now = Utc::now();
        Self {
            trigger,
            outcome: SyncState::Syncing,
            online: false,
            pushed: 0,
            duplicates: 0,
            pulled: 0,
            applied: 0,
            errors: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(mut self, outcome: SyncState, online: bool) -> Self {
        self.outcome = outcome;
        self.online = online;
        self.finished_at = Utc::now();
        self
    }
}

/// Records per push request unless configured otherwise
pub const DEFAULT_PUSH_BATCH: usize = 500;

/// Client tuning
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub platform: Option<String>,
    /// Push attempts before a change is parked
    pub max_push_attempts: u32,
    /// Expected server page size; a shorter page ends the pull
    pub page_size: u32,
    /// Most records sent in one push request
    pub max_push_batch: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            platform: None,
            max_push_attempts: 5,
            page_size: DEFAULT_PAGE_SIZE,
            max_push_batch: DEFAULT_PUSH_BATCH,
        }
    }
}

/// Device-side sync engine
pub struct SyncClient {
    pool: SqlitePool,
    queue: PendingQueue,
    handlers: HandlerRegistry,
    transport: Arc<dyn SyncTransport>,
    locator: Arc<dyn ServerLocator>,
    options: SyncOptions,
    running: AtomicBool,
    status: watch::Sender<ClientStatus>,
    reports: broadcast::Sender<SyncReport>,
}

/// Clears the re-entrancy flag when a cycle ends, however it ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncClient {
    pub fn new(
        pool: SqlitePool,
        device_id: impl Into<String>,
        handlers: HandlerRegistry,
        transport: Arc<dyn SyncTransport>,
        locator: Arc<dyn ServerLocator>,
        options: SyncOptions,
    ) -> Self {
        let (status, _) = watch::channel(ClientStatus::default());
        let (reports, _) = broadcast::channel(16);

        Self {
            queue: PendingQueue::new(pool.clone(), device_id),
            pool,
            handlers,
            transport,
            locator,
            options,
            running: AtomicBool::new(false),
            status,
            reports,
        }
    }

    pub fn device_id(&self) -> &str {
        self.queue.device_id()
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn status(&self) -> ClientStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }

    /// Reports of every finished cycle
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Apply a local mutation and stage it for the next push
    pub async fn record_change(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: Operation,
        payload: Value,
    ) -> Result<ChangeRecord, ClientError> {
        let record = self
            .queue
            .record_mutation(&self.handlers, entity_type, entity_id, operation, payload)
            .await?;
        self.refresh_status().await;
        Ok(record)
    }

    /// Reload counters and the cursor into the published status
    pub async fn refresh_status(&self) {
        let pending = self.queue.pending_count().await;
        let failed = self.queue.failed_count().await;
        let cursor = SyncCursor::load(&self.pool).await;

        self.status.send_modify(|status| {
            if let Ok(pending) = pending {
                status.pending_changes = pending;
            }
            if let Ok(failed) = failed {
                status.failed_changes = failed;
            }
            if let Ok(cursor) = cursor {
                status.last_sync_time = cursor.last_sync_time;
            }
        });
    }

    /// Run one cycle now. Returns `None` when a cycle is already running.
    pub async fn sync_now(&self, trigger: SyncTrigger) -> Option<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(?trigger, "Sync already in progress, trigger ignored");
            return None;
        }
        let guard = RunningGuard(&self.running);

        self.status.send_modify(|status| status.state = SyncState::Syncing);
        debug!(?trigger, device_id = %self.device_id(), "Sync cycle started");

        let report = self.run_cycle(trigger).await;

        self.status.send_modify(|status| {
            status.state = report.outcome;
            status.last_outcome = Some(report.outcome);
            status.online = report.online;
            status.last_error = report.errors.last().cloned();
        });
        self.refresh_status().await;
        self.status.send_modify(|status| status.state = SyncState::Idle);
        drop(guard);

        let _ = self.reports.send(report.clone());
        Some(report)
    }

    async fn run_cycle(&self, trigger: SyncTrigger) -> SyncReport {
        let mut report = SyncReport::new(trigger);

        let Some(endpoint) = self.locator.locate().await else {
            debug!("No sync server reachable, staying offline");
            return report.finish(SyncState::Failed, false);
        };

        let result = match self.push_phase(&endpoint, &mut report).await {
            Ok(()) => self.pull_phase(&endpoint, &mut report).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                info!(
                    ?trigger,
                    pushed = report.pushed,
                    duplicates = report.duplicates,
                    pulled = report.pulled,
                    applied = report.applied,
                    errors = report.errors.len(),
                    "Sync cycle finished"
                );
                report.finish(SyncState::Success, true)
            }
            Err(e) => {
                let online = !e.is_transient();
                if online {
                    warn!(error = %e, "Sync cycle failed");
                } else {
                    info!(url = %endpoint, error = %e, "Sync server unreachable, going offline");
                    self.locator.invalidate();
                }
                report.errors.push(e.to_string());
                report.finish(SyncState::Failed, online)
            }
        }
    }

    async fn push_phase(&self, endpoint: &str, report: &mut SyncReport) -> Result<(), ClientError> {
        let entries = self.queue.drain().await?;
        if entries.is_empty() {
            return Ok(());
        }

        let platform = self.options.platform.as_deref();
        let mut batch_size = self.options.max_push_batch.max(1);
        let mut rest = entries.as_slice();

        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(batch_size.min(rest.len()));
            let batch: Vec<ChangeRecord> = chunk.iter().map(|entry| entry.record.clone()).collect();

            match self.transport.push(endpoint, platform, &batch).await {
                Ok(response) => {
                    self.absorb_push(&response, report).await?;
                    debug!(
                        sent = batch.len(),
                        acknowledged = response.acknowledged.len(),
                        rejected = response.errors.len(),
                        "Pending changes pushed"
                    );
                    rest = tail;
                }
                Err(e) if e.is_payload_too_large() && chunk.len() > 1 => {
                    // The server read none of the chunk; retry it in halves
                    batch_size = chunk.len() / 2;
                    debug!(batch_size, "Push batch too large, splitting");
                }
                Err(e) if e.is_payload_too_large() => {
                    let record = &chunk[0].record;
                    let message = e.to_string();
                    self.queue
                        .record_failure(&record.change_id, &message, self.options.max_push_attempts)
                        .await?;
                    report.errors.push(format!(
                        "{}/{}: {}",
                        record.entity_type, record.entity_id, message
                    ));
                    rest = tail;
                }
                Err(e) if !e.is_transient() => {
                    // The server refused the whole batch; count it against each entry
                    let message = e.to_string();
                    for entry in chunk {
                        self.queue
                            .record_failure(
                                &entry.record.change_id,
                                &message,
                                self.options.max_push_attempts,
                            )
                            .await?;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    async fn absorb_push(
        &self,
        response: &PushResponse,
        report: &mut SyncReport,
    ) -> Result<(), ClientError> {
        self.queue.record_assigned(&response.assigned).await?;
        self.queue.confirm(&response.acknowledged).await?;

        for error in &response.errors {
            self.queue
                .record_failure(&error.change_id, &error.message, self.options.max_push_attempts)
                .await?;
            report.errors.push(format!(
                "{}/{}: {}",
                error.entity_type, error.entity_id, error.message
            ));
        }

        report.pushed += response.applied_count;
        report.duplicates += response.duplicates;
        Ok(())
    }

    async fn pull_phase(&self, endpoint: &str, report: &mut SyncReport) -> Result<(), ClientError> {
        let page_size = self.options.page_size.max(1) as usize;

        loop {
            let cursor = SyncCursor::load(&self.pool).await?;
            let since = cursor.last_sync_time.unwrap_or_else(|| from_micros(0));
            let query = PullQuery {
                exclude_device_id: Some(self.device_id().to_string()),
                after_id: cursor.last_id,
                platform: self.options.platform.clone(),
            };

            let records = self.transport.pull(endpoint, since, &query).await?;
            let received = records.len();
            report.pulled += received;

            for record in &records {
                self.apply_pulled(record, report).await?;
            }

            if received < page_size {
                return Ok(());
            }
        }
    }

    /// Apply one pulled record and advance the cursor past it. A record the
    /// local store rejects is skipped so it cannot block later records.
    async fn apply_pulled(
        &self,
        record: &ChangeRecord,
        report: &mut SyncReport,
    ) -> Result<(), ClientError> {
        let cursor = SyncCursor {
            last_sync_time: Some(record.timestamp),
            last_id: Some(record.id),
        };

        let superseded = self
            .queue
            .has_newer_pending(&record.entity_type, &record.entity_id, record.timestamp)
            .await?
            || self
                .queue
                .has_later_own_write(&record.entity_type, &record.entity_id, record.id)
                .await?;
        if superseded {
            debug!(
                entity_type = %record.entity_type,
                entity_id = %record.entity_id,
                "Remote change superseded by a local change"
            );
            let mut conn = self.pool.acquire().await?;
            return cursor.save_in(&mut conn).await;
        }

        let mut tx = self.pool.begin().await?;
        match self.handlers.apply(&mut tx, record).await {
            Ok(()) => {
                cursor.save_in(&mut tx).await?;
                tx.commit().await?;
                report.applied += 1;
            }
            Err(e) => {
                tx.rollback().await?;
                warn!(
                    change_id = %record.change_id,
                    entity_type = %record.entity_type,
                    entity_id = %record.entity_id,
                    error = %e,
                    "Skipping remote change the local store rejected"
                );
                report.errors.push(format!(
                    "{}/{}: {}",
                    record.entity_type, record.entity_id, e
                ));
                let mut conn = self.pool.acquire().await?;
                cursor.save_in(&mut conn).await?;
            }
        }

        Ok(())
    }

    /// Start the trigger loop. The timer fires immediately, then every
    /// `interval`.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SyncHandle {
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<SyncTrigger>(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            self.refresh_status().await;

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut current: Option<JoinHandle<()>> = None;

            loop {
                let trigger = tokio::select! {
                    _ = ticker.tick() => SyncTrigger::Timer,
                    Some(trigger) = trigger_rx.recv() => trigger,
                    _ = shutdown_rx.changed() => break,
                };

                if self.is_syncing() {
                    debug!(?trigger, "Sync already in progress, trigger ignored");
                    continue;
                }

                let client = self.clone();
                current = Some(tokio::spawn(async move {
                    client.sync_now(trigger).await;
                }));
            }

            // Let an in-flight cycle finish its transaction
            if let Some(cycle) = current {
                let _ = cycle.await;
            }
            debug!(device_id = %self.device_id(), "Sync loop stopped");
        });

        SyncHandle {
            triggers: trigger_tx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Log every cycle report until the client goes away. Returns how many
/// reports were logged.
pub async fn log_reports(mut reports: broadcast::Receiver<SyncReport>) -> usize {
    let mut logged = 0;
    loop {
        match reports.recv().await {
            Ok(report) => {
                info!(
                    trigger = ?report.trigger,
                    outcome = ?report.outcome,
                    online = report.online,
                    pushed = report.pushed,
                    pulled = report.pulled,
                    errors = report.errors.len(),
                    "Sync cycle report"
                );
                logged += 1;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Sync report logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => return logged,
        }
    }
}

/// Running sync loop
pub struct SyncHandle {
    triggers: mpsc::Sender<SyncTrigger>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Sender for other trigger sources, such as the realtime channel
    pub fn trigger_sender(&self) -> mpsc::Sender<SyncTrigger> {
        self.triggers.clone()
    }

    /// Ask for a manual cycle. `false` when one is already queued.
    pub fn sync_now(&self) -> bool {
        self.triggers.try_send(SyncTrigger::Manual).is_ok()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
