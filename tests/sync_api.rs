//! HTTP-level tests for the sync endpoints

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum_test::TestServer;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use habit_sync::config::Config;
use habit_sync::db::{self, Role};
use habit_sync::routes::build_router;
use habit_sync::state::AppState;
use habit_sync::sync::{
    truncate_micros, ChangeRecord, DeviceInfo, Operation, PushResponse, SyncStatus,
};

struct TestApp {
    server: TestServer,
    _dir: TempDir,
}

async fn app() -> TestApp {
    app_with(Config::default()).await
}

async fn app_with(config: Config) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("sync.db").display());
    let pool = db::create_pool(&url, Role::Server).await.unwrap();
    let state = AppState::new(config, pool);

    TestApp {
        server: TestServer::new(build_router(state)).unwrap(),
        _dir: dir,
    }
}

fn change(entity_id: &str, operation: Operation, payload: Value, device: &str, ts: DateTime<Utc>) -> ChangeRecord {
    let mut record = ChangeRecord::new("habits", entity_id, operation, payload, device);
    record.timestamp = truncate_micros(ts);
    record
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn push(app: &TestApp, batch: &[ChangeRecord]) -> PushResponse {
    let response = app
        .server
        .post("/sync/receive-changes")
        .add_header(
            HeaderName::from_static("x-device-platform"),
            HeaderValue::from_static("ios"),
        )
        .json(&batch)
        .await;
    response.assert_status_ok();
    response.json::<PushResponse>()
}

#[tokio::test]
async fn test_health_and_ping() {
    let app = app().await;

    let health = app.server.get("/health").await;
    health.assert_status_ok();
    let body = health.json::<Value>();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "habit-sync-server");

    let ping = app.server.get("/sync/ping").await;
    ping.assert_status_ok();
    assert_eq!(ping.json::<Value>()["status"], "ok");
}

#[tokio::test]
async fn test_push_twice_logs_once() {
    let app = app().await;
    let record = change("7", Operation::Create, json!({"name": "Run"}), "A", Utc::now());

    let first = push(&app, &[record.clone()]).await;
    assert!(first.success);
    assert_eq!(first.applied_count, 1);

    let second = push(&app, &[record.clone()]).await;
    assert!(second.success);
    assert_eq!(second.applied_count, 1);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.acknowledged, vec![record.change_id]);

    let status = app.server.get("/sync/status").await.json::<SyncStatus>();
    assert_eq!(status.total_records, 1);
}

#[tokio::test]
async fn test_push_reports_wire_fields() {
    let app = app().await;
    let body = json!([{
        "entityType": "habits",
        "entityId": 7,
        "operation": "create",
        "payload": {"name": "Run"},
        "deviceId": "A",
        "timestamp": "2024-03-01T12:00:00Z"
    }, {
        "entityType": "widgets",
        "entityId": "1",
        "operation": "create",
        "payload": {},
        "deviceId": "A",
        "timestamp": "2024-03-01T12:00:01Z"
    }]);

    let response = app.server.post("/sync/receive-changes").json(&body).await;
    response.assert_status_ok();
    let body = response.json::<Value>();
    assert_eq!(body["success"], false);
    assert_eq!(body["appliedCount"], 1);
    assert_eq!(body["errors"].as_array().unwrap().len(), 1);
    assert_eq!(body["errors"][0]["entityType"], "widgets");
    assert_eq!(body["assigned"].as_array().unwrap().len(), 1);
    assert!(body["assigned"][0]["id"].as_i64().unwrap() > 0);
}

#[tokio::test]
async fn test_malformed_push_is_bad_request() {
    let app = app().await;
    let response = app
        .server
        .post("/sync/receive-changes")
        .json(&json!({"not": "a batch"}))
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "bad_request");
}

#[tokio::test]
async fn test_oversized_push_is_payload_too_large() {
    let mut config = Config::default();
    config.sync.max_push_bytes = 4 * 1024;
    let app = app_with(config).await;

    let now = Utc::now();
    let batch: Vec<ChangeRecord> = (0..20)
        .map(|i| {
            change(
                &i.to_string(),
                Operation::Create,
                json!({"name": "x".repeat(512)}),
                "A",
                now,
            )
        })
        .collect();

    let response = app.server.post("/sync/receive-changes").json(&batch).await;
    response.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(response.json::<Value>()["error"], "payload_too_large");

    // A batch under the limit still goes through
    let accepted = push(&app, &batch[..2]).await;
    assert_eq!(accepted.applied_count, 2);
}

#[tokio::test]
async fn test_changes_since_orders_and_excludes() {
    let app = app().await;
    let base = Utc::now() - Duration::minutes(5);
    push(
        &app,
        &[
            change("1", Operation::Update, json!({"v": 3}), "B", base + Duration::seconds(3)),
            change("1", Operation::Create, json!({"v": 1}), "B", base + Duration::seconds(1)),
            change("2", Operation::Create, json!({"v": 2}), "A", base + Duration::seconds(2)),
        ],
    )
    .await;

    let response = app
        .server
        .get(&format!("/sync/changes-since/{}", urlencoding::encode(&rfc3339(base))))
        .add_query_param("excludeDeviceId", "A")
        .add_query_param("platform", "android")
        .await;
    response.assert_status_ok();
    let records = response.json::<Vec<ChangeRecord>>();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.device_id == "B"));
    assert_eq!(records[0].payload["v"], 1);
    assert_eq!(records[1].payload["v"], 3);

    // Epoch milliseconds work too
    let millis = base.timestamp_millis();
    let all = app
        .server
        .get(&format!("/sync/changes-since/{}", millis))
        .await
        .json::<Vec<ChangeRecord>>();
    assert_eq!(all.len(), 3);

    let devices = app.server.get("/sync/devices").await.json::<Vec<DeviceInfo>>();
    let a = devices.iter().find(|d| d.device_id == "A").unwrap();
    assert_eq!(a.platform.as_deref(), Some("android"));
    assert_eq!(a.last_sync_time, Some(records[1].timestamp));
}

#[tokio::test]
async fn test_changes_since_rejects_bad_timestamp() {
    let app = app().await;
    let response = app.server.get("/sync/changes-since/next-tuesday").await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["error"], "bad_request");
}

#[tokio::test]
async fn test_status_window() {
    let app = app().await;
    push(
        &app,
        &[
            change("1", Operation::Create, json!({}), "A", Utc::now() - Duration::hours(2)),
            change("2", Operation::Create, json!({}), "B", Utc::now()),
        ],
    )
    .await;

    let status = app.server.get("/sync/status").await.json::<SyncStatus>();
    assert_eq!(status.total_records, 2);
    assert_eq!(status.recent_changes, 1);
    assert_eq!(status.window_minutes, 60);
    assert_eq!(status.known_devices, 2);
    assert!(status.last_change_timestamp.is_some());

    let wide = app
        .server
        .get("/sync/status")
        .add_query_param("windowMinutes", 180)
        .await
        .json::<SyncStatus>();
    assert_eq!(wide.recent_changes, 2);

    app.server
        .get("/sync/status")
        .add_query_param("windowMinutes", -5)
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_offline_edits_reach_other_device_in_order() {
    let app = app().await;
    let t1 = truncate_micros(Utc::now() - Duration::minutes(1));
    let t2 = t1 + Duration::seconds(10);

    let response = push(
        &app,
        &[
            change("7", Operation::Create, json!({"name": "Run"}), "A", t1),
            change("7", Operation::Update, json!({"name": "Run", "goal": 5}), "A", t2),
        ],
    )
    .await;
    assert_eq!(response.applied_count, 2);

    let records = app
        .server
        .get("/sync/changes-since/0")
        .add_query_param("excludeDeviceId", "B")
        .await
        .json::<Vec<ChangeRecord>>();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].operation, Operation::Create);
    assert_eq!(records[1].operation, Operation::Update);

    let devices = app.server.get("/sync/devices").await.json::<Vec<DeviceInfo>>();
    let b = devices.iter().find(|d| d.device_id == "B").unwrap();
    assert_eq!(b.last_sync_time, Some(t2));
}
