//! Sync API endpoints
//!
//! Push, pull and diagnostics for devices. Responses use camelCase JSON.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::client::PLATFORM_HEADER;
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{ChangeRecord, DeviceInfo, PingResponse, PullQuery, PushResponse, SyncStatus};

use super::realtime;

/// Create the sync router. Push bodies over `max_push_bytes` get a 413.
pub fn router(max_push_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping))
        .route(
            "/receive-changes",
            post(receive_changes).layer(DefaultBodyLimit::max(max_push_bytes)),
        )
        .route("/changes-since/:timestamp", get(changes_since))
        .route("/status", get(status))
        .route("/devices", get(devices))
        .route("/hub", get(realtime::hub))
}

async fn ping(State(state): State<AppState>) -> Json<PingResponse> {
    Json(state.sync().ping())
}

/// Accept a batch of changes from one device
async fn receive_changes(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: std::result::Result<Json<Vec<ChangeRecord>>, JsonRejection>,
) -> Result<Json<PushResponse>> {
    let Json(batch) = body.map_err(|e| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(e.body_text())
        } else {
            AppError::BadRequest(e.body_text())
        }
    })?;

    let platform = headers
        .get(PLATFORM_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    tracing::debug!(records = batch.len(), platform = ?platform, "Receiving changes");

    let response = state.sync().push(batch, platform).await?;
    Ok(Json(response))
}

/// Records after `timestamp`, oldest first
async fn changes_since(
    State(state): State<AppState>,
    Path(timestamp): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<Vec<ChangeRecord>>> {
    let since = parse_since(&timestamp)?;
    let records = state.sync().pull(since, &query).await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    window_minutes: Option<i64>,
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<SyncStatus>> {
    Ok(Json(state.sync().status(query.window_minutes).await?))
}

async fn devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceInfo>>> {
    Ok(Json(state.sync().devices().await?))
}

/// RFC 3339, or integer epoch milliseconds
fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid timestamp: {}", raw)))
}
