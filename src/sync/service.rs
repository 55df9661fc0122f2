//! Sync service
//!
//! Server-side push and pull. Every pushed record gets its own transaction:
//! it is either a duplicate of something already logged, or it is appended
//! to the change log and applied to its entity store in one commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{AppError, ApplyError, Result};
use crate::notify::{DataChanged, Notifier, ServerEvent};

use super::devices::DeviceRepository;
use super::handlers::HandlerRegistry;
use super::log::ChangeLogRepository;
use super::types::{
    truncate_micros, AssignedId, ChangeRecord, DeviceInfo, PingResponse, PullQuery,
    PushResponse, RecordError, SyncStatus,
};

/// Largest page a single pull returns by default
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

enum Applied {
    New(i64),
    Duplicate(i64),
}

/// Push/pull over the central change log
#[derive(Clone)]
pub struct SyncService {
    pool: SqlitePool,
    handlers: Arc<HandlerRegistry>,
    notifier: Notifier,
    page_size: u32,
    recent_window_minutes: i64,
    // Serializes record transactions so SQLite never sees two writers
    write_gate: Arc<Mutex<()>>,
}

impl SyncService {
    pub fn new(pool: SqlitePool, handlers: HandlerRegistry, notifier: Notifier) -> Self {
        Self {
            pool,
            handlers: Arc::new(handlers),
            notifier,
            page_size: DEFAULT_PAGE_SIZE,
            recent_window_minutes: 60,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Service with snapshot handlers for the default entity types
    pub fn from_config(pool: SqlitePool, config: &SyncConfig, notifier: Notifier) -> Self {
        Self::new(
            pool,
            HandlerRegistry::with_snapshot_defaults(config.conflict_policy),
            notifier,
        )
        .with_page_size(config.page_size)
        .with_recent_window_minutes(config.recent_window_minutes)
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_recent_window_minutes(mut self, minutes: i64) -> Self {
        self.recent_window_minutes = minutes;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn ping(&self) -> PingResponse {
        PingResponse {
            status: "ok".to_string(),
            timestamp: Utc::now(),
        }
    }

    /// Accept a batch of changes from a device.
    ///
    /// Records are applied oldest first. A failing record is reported in
    /// `errors` and does not stop the rest of the batch.
    pub async fn push(
        &self,
        mut batch: Vec<ChangeRecord>,
        platform: Option<&str>,
    ) -> Result<PushResponse> {
        let mut response = PushResponse {
            success: true,
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(response);
        }

        // Stable, so equal timestamps keep their submission order
        batch.sort_by_key(|record| record.timestamp);

        let mut applied = Vec::new();
        let mut devices = BTreeSet::new();

        {
            let _gate = self.write_gate.lock().await;

            for mut record in batch {
                normalize(&mut record);

                if let Err(message) = validate(&record) {
                    response.errors.push(record_error(&record, message));
                    continue;
                }
                devices.insert(record.device_id.clone());

                match self.apply_one(&record).await {
                    Ok(Applied::New(id)) => {
                        record.id = id;
                        response.applied_count += 1;
                        response.acknowledged.push(record.change_id.clone());
                        response.assigned.push(AssignedId {
                            change_id: record.change_id.clone(),
                            id,
                        });
                        applied.push(record);
                    }
                    Ok(Applied::Duplicate(id)) => {
                        debug!(
                            change_id = %record.change_id,
                            existing_id = id,
                            "Duplicate change acknowledged"
                        );
                        response.applied_count += 1;
                        response.duplicates += 1;
                        response.acknowledged.push(record.change_id.clone());
                        response.assigned.push(AssignedId {
                            change_id: record.change_id.clone(),
                            id,
                        });
                    }
                    Err(e) => {
                        warn!(
                            change_id = %record.change_id,
                            entity_type = %record.entity_type,
                            entity_id = %record.entity_id,
                            error = %e,
                            "Failed to apply change"
                        );
                        response.errors.push(record_error(&record, e.to_string()));
                    }
                }
            }
        }

        for record in &applied {
            self.notifier
                .publish(ServerEvent::DataChanged(DataChanged::from(record)));
        }

        let repo = DeviceRepository::new(&self.pool);
        for device_id in &devices {
            if let Err(e) = repo.touch(device_id, platform).await {
                warn!(device_id, error = %e, "Failed to update device bookkeeping");
            }
        }

        response.success = response.errors.is_empty();
        info!(
            applied = response.applied_count,
            duplicates = response.duplicates,
            errors = response.errors.len(),
            "Push processed"
        );

        Ok(response)
    }

    async fn apply_one(&self, record: &ChangeRecord) -> std::result::Result<Applied, ApplyError> {
        let mut tx = self.pool.begin().await?;

        if let Some(id) = ChangeLogRepository::find_duplicate(&mut tx, record).await? {
            tx.rollback().await?;
            return Ok(Applied::Duplicate(id));
        }

        let id = ChangeLogRepository::append(&mut tx, record).await?;
        // Dropping `tx` on error rolls the append back with it
        self.handlers.apply(&mut tx, record).await?;
        tx.commit().await?;

        Ok(Applied::New(id))
    }

    /// One page of records after `since`, oldest first.
    ///
    /// When the query names the requesting device, its own records are left
    /// out and its `last_sync_time` advances to the newest returned record.
    pub async fn pull(&self, since: DateTime<Utc>, query: &PullQuery) -> Result<Vec<ChangeRecord>> {
        let device_id = query
            .exclude_device_id
            .as_deref()
            .filter(|id| !id.is_empty());

        let records = ChangeLogRepository::new(&self.pool)
            .changes_since(since, device_id, query.after_id, self.page_size)
            .await?;

        if let Some(device_id) = device_id {
            let high_water = records.last().map(|r| r.timestamp).unwrap_or(since);
            if let Err(e) = DeviceRepository::new(&self.pool)
                .record_pull(device_id, query.platform.as_deref(), high_water)
                .await
            {
                warn!(device_id, error = %e, "Failed to update device bookkeeping");
            }
        }

        debug!(
            since = %since,
            device_id = ?device_id,
            returned = records.len(),
            "Pull served"
        );

        Ok(records)
    }

    /// Aggregate counters; `window_minutes` overrides the configured window
    pub async fn status(&self, window_minutes: Option<i64>) -> Result<SyncStatus> {
        let window_minutes = window_minutes.unwrap_or(self.recent_window_minutes);
        if window_minutes < 0 {
            return Err(AppError::BadRequest(format!(
                "windowMinutes must not be negative, got {}",
                window_minutes
            )));
        }

        let log = ChangeLogRepository::new(&self.pool);
        let cutoff = Utc::now() - Duration::minutes(window_minutes);

        Ok(SyncStatus {
            total_records: log.count().await?,
            recent_changes: log.count_since(cutoff).await?,
            window_minutes,
            last_change_timestamp: log.last_timestamp().await?,
            connected_devices: self.notifier.connected_devices().await,
            known_devices: DeviceRepository::new(&self.pool).count().await?,
        })
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>> {
        DeviceRepository::new(&self.pool).list().await
    }

    /// Drop log records older than `older_than`. Devices whose cursor is
    /// behind the cut will never see the dropped records.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let _gate = self.write_gate.lock().await;
        let removed = ChangeLogRepository::new(&self.pool).prune(older_than).await?;
        info!(removed, older_than = %older_than, "Change log pruned");
        Ok(removed)
    }
}

fn normalize(record: &mut ChangeRecord) {
    record.id = 0;
    record.synced = true;
    record.timestamp = truncate_micros(record.timestamp);
    if record.change_id.is_empty() {
        record.change_id = uuid::Uuid::new_v4().to_string();
    }
}

fn validate(record: &ChangeRecord) -> std::result::Result<(), String> {
    if record.entity_type.trim().is_empty() {
        return Err("entityType must not be empty".to_string());
    }
    if record.entity_id.trim().is_empty() {
        return Err("entityId must not be empty".to_string());
    }
    if record.device_id.trim().is_empty() {
        return Err("deviceId must not be empty".to_string());
    }
    Ok(())
}

fn record_error(record: &ChangeRecord, message: String) -> RecordError {
    RecordError {
        change_id: record.change_id.clone(),
        entity_type: record.entity_type.clone(),
        entity_id: record.entity_id.clone(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::sync::{ConflictPolicy, Operation, SnapshotRepository};
    use serde_json::json;

    async fn service() -> SyncService {
        SyncService::new(
            test_pool().await,
            HandlerRegistry::with_snapshot_defaults(ConflictPolicy::LastApplied),
            Notifier::default(),
        )
    }

    fn at(base: DateTime<Utc>, millis: i64) -> DateTime<Utc> {
        truncate_micros(base + Duration::milliseconds(millis))
    }

    fn change(
        entity_id: &str,
        operation: Operation,
        payload: serde_json::Value,
        device: &str,
        timestamp: DateTime<Utc>,
    ) -> ChangeRecord {
        let mut record = ChangeRecord::new("habits", entity_id, operation, payload, device);
        record.timestamp = timestamp;
        record
    }

    fn since_all(device: &str) -> PullQuery {
        PullQuery {
            exclude_device_id: Some(device.to_string()),
            ..Default::default()
        }
    }

    fn epoch() -> DateTime<Utc> {
        crate::sync::from_micros(0)
    }

    #[tokio::test]
    async fn test_empty_push() {
        let service = service().await;
        let response = service.push(Vec::new(), None).await.unwrap();
        assert!(response.success);
        assert_eq!(response.applied_count, 0);
        assert_eq!(service.status(None).await.unwrap().total_records, 0);
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let service = service().await;
        let record = change("7", Operation::Create, json!({"name": "Run"}), "A", Utc::now());

        let first = service.push(vec![record.clone()], Some("ios")).await.unwrap();
        assert_eq!(first.applied_count, 1);
        assert_eq!(first.duplicates, 0);

        let second = service.push(vec![record.clone()], Some("ios")).await.unwrap();
        assert!(second.success);
        assert_eq!(second.applied_count, 1);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.acknowledged, vec![record.change_id.clone()]);
        // A re-submission reports the log id the first push assigned
        assert_eq!(second.assigned, first.assigned);
        assert_eq!(second.assigned[0].change_id, record.change_id);

        assert_eq!(service.status(None).await.unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn test_push_applies_in_timestamp_order() {
        let service = service().await;
        let base = Utc::now();
        let batch = vec![
            change("7", Operation::Update, json!({"v": 3}), "A", at(base, 3)),
            change("7", Operation::Create, json!({"v": 1}), "A", at(base, 1)),
            change("7", Operation::Update, json!({"v": 2}), "A", at(base, 2)),
        ];

        let response = service.push(batch, None).await.unwrap();
        assert_eq!(response.applied_count, 3);

        let pulled = service.pull(epoch(), &PullQuery::default()).await.unwrap();
        let versions: Vec<i64> = pulled.iter().map(|r| r.payload["v"].as_i64().unwrap()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert!(pulled.windows(2).all(|w| w[0].id < w[1].id));

        let snapshot = SnapshotRepository::new(service.pool())
            .get("habits", "7")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.payload, json!({"v": 3}));
    }

    #[tokio::test]
    async fn test_bad_record_does_not_abort_batch() {
        let service = service().await;
        let base = Utc::now();
        let mut unknown = change("1", Operation::Create, json!({}), "A", at(base, 1));
        unknown.entity_type = "widgets".to_string();
        let good = change("2", Operation::Create, json!({"name": "Read"}), "A", at(base, 2));
        let mut anonymous = change("3", Operation::Create, json!({}), "", at(base, 3));
        anonymous.device_id.clear();

        let response = service
            .push(vec![unknown.clone(), good.clone(), anonymous], None)
            .await
            .unwrap();

        assert!(!response.success);
        assert_eq!(response.applied_count, 1);
        assert_eq!(response.acknowledged, vec![good.change_id]);
        assert_eq!(response.errors.len(), 2);
        assert_eq!(response.errors[0].change_id, unknown.change_id);

        // The rejected record never reached the log
        assert_eq!(service.status(None).await.unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn test_pull_excludes_requesting_device() {
        let service = service().await;
        let base = Utc::now();
        service
            .push(
                vec![
                    change("1", Operation::Create, json!({}), "A", at(base, 1)),
                    change("2", Operation::Create, json!({}), "B", at(base, 2)),
                ],
                None,
            )
            .await
            .unwrap();

        let for_a = service.pull(epoch(), &since_all("A")).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].device_id, "B");

        let everything = service.pull(epoch(), &PullQuery::default()).await.unwrap();
        assert_eq!(everything.len(), 2);

        let devices = service.devices().await.unwrap();
        let a = devices.iter().find(|d| d.device_id == "A").unwrap();
        assert_eq!(a.last_sync_time, Some(for_a[0].timestamp));
    }

    #[tokio::test]
    async fn test_pull_pages_are_capped() {
        let service = service().await;
        let base = Utc::now();
        let batch: Vec<ChangeRecord> = (0..1500)
            .map(|i| {
                change(&i.to_string(), Operation::Create, json!({"i": i}), "A", at(base, i))
            })
            .collect();
        service.push(batch, None).await.unwrap();

        let first = service.pull(epoch(), &since_all("B")).await.unwrap();
        assert_eq!(first.len(), 1000);

        let last = first.last().unwrap();
        let query = PullQuery {
            after_id: Some(last.id),
            ..since_all("B")
        };
        let second = service.pull(last.timestamp, &query).await.unwrap();
        assert_eq!(second.len(), 500);
        assert_eq!(second[0].payload["i"], 1000);
    }

    #[tokio::test]
    async fn test_push_publishes_new_changes_only() {
        let service = service().await;
        let (_id, mut events) = service.notifier().connect().await;
        let record = change("7", Operation::Create, json!({}), "A", Utc::now());

        service.push(vec![record.clone()], None).await.unwrap();
        service.push(vec![record], None).await.unwrap();

        match events.try_recv().unwrap() {
            ServerEvent::DataChanged(changed) => {
                assert_eq!(changed.entity_id, "7");
                assert_eq!(changed.device_id, "A");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let service = service().await;
        let old = Utc::now() - Duration::hours(3);
        service
            .push(
                vec![
                    change("1", Operation::Create, json!({}), "A", old),
                    change("2", Operation::Create, json!({}), "B", Utc::now()),
                ],
                None,
            )
            .await
            .unwrap();

        let status = service.status(None).await.unwrap();
        assert_eq!(status.total_records, 2);
        assert_eq!(status.recent_changes, 1);
        assert_eq!(status.window_minutes, 60);
        assert_eq!(status.known_devices, 2);
        assert_eq!(status.connected_devices, 0);

        let wide = service.status(Some(24 * 60)).await.unwrap();
        assert_eq!(wide.recent_changes, 2);

        assert!(matches!(service.status(Some(-1)).await, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_prune_drops_old_records() {
        let service = service().await;
        let old = Utc::now() - Duration::days(40);
        service
            .push(
                vec![
                    change("1", Operation::Create, json!({}), "A", old),
                    change("2", Operation::Create, json!({}), "A", Utc::now()),
                ],
                None,
            )
            .await
            .unwrap();

        let removed = service
            .prune(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(service.status(None).await.unwrap().total_records, 1);
    }

    #[tokio::test]
    async fn test_two_device_round_trip() {
        let service = service().await;
        let t1 = truncate_micros(Utc::now());

        service
            .push(
                vec![change("7", Operation::Create, json!({"name": "Run"}), "A", t1)],
                Some("ios"),
            )
            .await
            .unwrap();

        let for_b = service.pull(epoch(), &since_all("B")).await.unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].payload["name"], "Run");

        let t2 = at(t1, 5);
        service
            .push(
                vec![change("7", Operation::Update, json!({"name": "Run 5k"}), "B", t2)],
                Some("android"),
            )
            .await
            .unwrap();

        let for_a = service.pull(t1, &since_all("A")).await.unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].operation, Operation::Update);
        assert_eq!(for_a[0].device_id, "B");
    }
}
