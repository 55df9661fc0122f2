//! Sync data types
//!
//! Defines the wire and storage types for multi-device synchronization:
//! - Change records (the unit of replication)
//! - Device bookkeeping
//! - Push/pull/status payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Types of change operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// A single replicated mutation.
///
/// Records are immutable once created; corrections are new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Server-assigned sequence number (0 while only local)
    #[serde(default)]
    pub id: i64,
    /// Origin-assigned id used to correlate acknowledgements
    #[serde(default)]
    pub change_id: String,
    /// Logical table the change belongs to (e.g. "habits")
    pub entity_type: String,
    /// Identifier of the affected record
    #[serde(deserialize_with = "string_or_number")]
    pub entity_id: String,
    pub operation: Operation,
    /// Whole-record snapshot of the entity after the change
    #[serde(default)]
    pub payload: Value,
    /// Device that made this change
    pub device_id: String,
    /// When the change was made, at its origin
    pub timestamp: DateTime<Utc>,
    /// Whether the server has durably accepted this change
    #[serde(default)]
    pub synced: bool,
}

impl ChangeRecord {
    /// Create a new, not yet synced record stamped with the current time
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        operation: Operation,
        payload: Value,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            change_id: uuid::Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            device_id: device_id.into(),
            timestamp: truncate_micros(Utc::now()),
            synced: false,
        }
    }

    /// Whether `other` carries the same logical content under the same
    /// de-duplication key.
    pub fn same_content(&self, other: &ChangeRecord) -> bool {
        self.entity_type == other.entity_type
            && self.entity_id == other.entity_id
            && self.device_id == other.device_id
            && self.operation == other.operation
            && self.payload == other.payload
            && self.timestamp.timestamp_micros() == other.timestamp.timestamp_micros()
    }
}

/// Timestamps are stored as epoch microseconds; trim anything finer so a
/// record compares equal to its persisted form.
pub fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(ts.timestamp_micros())
}

pub fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "entityId must be a string or number, got {}",
            other
        ))),
    }
}

/// Server-side bookkeeping for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    /// Everything at or below this instant has been pulled by the device
    pub last_sync_time: Option<DateTime<Utc>>,
    pub platform: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
}

/// Error for a single record in a pushed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub change_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub message: String,
}

/// Response from a push
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    /// Records accepted, including idempotent re-submissions
    pub applied_count: usize,
    /// How many of the applied records were already in the log
    #[serde(default)]
    pub duplicates: usize,
    /// Change ids the device may drop from its pending queue
    #[serde(default)]
    pub acknowledged: Vec<String>,
    /// Log id each acknowledged change holds on the server
    #[serde(default)]
    pub assigned: Vec<AssignedId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RecordError>,
}

/// Server log position of an acknowledged change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignedId {
    pub change_id: String,
    pub id: i64,
}

/// Query parameters for a pull
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    pub exclude_device_id: Option<String>,
    /// Tie-breaker: also return records at exactly `since` with a larger id
    pub after_id: Option<i64>,
    pub platform: Option<String>,
}

/// Aggregate diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub total_records: i64,
    pub recent_changes: i64,
    pub window_minutes: i64,
    pub last_change_timestamp: Option<DateTime<Utc>>,
    pub connected_devices: usize,
    pub known_devices: i64,
}

/// Liveness probe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_accepts_numbers() {
        let json = r#"{
            "entityType": "habits",
            "entityId": 7,
            "operation": "update",
            "payload": {"name": "Read"},
            "deviceId": "A",
            "timestamp": "2026-01-01T10:00:00Z"
        }"#;

        let record: ChangeRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.entity_id, "7");
        assert_eq!(record.operation, Operation::Update);
        assert_eq!(record.id, 0);
        assert!(!record.synced);
        assert!(record.change_id.is_empty());
    }

    #[test]
    fn test_entity_id_rejects_objects() {
        let json = r#"{
            "entityType": "habits",
            "entityId": {"nested": true},
            "operation": "create",
            "deviceId": "A",
            "timestamp": "2026-01-01T10:00:00Z"
        }"#;

        assert!(serde_json::from_str::<ChangeRecord>(json).is_err());
    }

    #[test]
    fn test_change_record_serialization() {
        let record = ChangeRecord::new("habits", "7", Operation::Create, Value::Null, "A");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("entityType"));
        assert!(json.contains("deviceId"));
        assert!(json.contains("\"operation\":\"create\""));
    }

    #[test]
    fn test_same_content_ignores_server_fields() {
        let a = ChangeRecord::new("habits", "7", Operation::Update, serde_json::json!({"done": true}), "A");
        let mut b = a.clone();
        b.id = 42;
        b.synced = true;
        b.change_id = "other".to_string();
        assert!(a.same_content(&b));

        b.payload = serde_json::json!({"done": false});
        assert!(!a.same_content(&b));
    }

    #[test]
    fn test_operation_parse() {
        assert_eq!("DELETE".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("upsert".parse::<Operation>().is_err());
    }
}
