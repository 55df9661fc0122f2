//! Realtime channel messages
//!
//! JSON text frames tagged by `type`:
//! - server → client: `DataChanged`, `Joined`, `SyncRequested`
//! - client → server: `JoinGroup`, `RequestSync`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::{ChangeRecord, Operation};

/// "Something changed" signal for one applied record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChanged {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: Operation,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChangeRecord> for DataChanged {
    fn from(record: &ChangeRecord) -> Self {
        DataChanged {
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
            operation: record.operation,
            device_id: record.device_id.clone(),
            timestamp: record.timestamp,
        }
    }
}

/// Events fanned out from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    DataChanged(DataChanged),
    /// Acknowledges a `JoinGroup` on the joining connection only
    Joined {
        device_id: String,
        connected_devices: usize,
    },
    /// Some device asked the whole group to sync
    SyncRequested { device_id: Option<String> },
}

impl ServerEvent {
    /// Device that caused the event, if any
    pub fn origin(&self) -> Option<&str> {
        match self {
            ServerEvent::DataChanged(change) => Some(&change.device_id),
            ServerEvent::Joined { device_id, .. } => Some(device_id),
            ServerEvent::SyncRequested { device_id } => device_id.as_deref(),
        }
    }
}

/// Control messages sent by devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinGroup {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        platform: Option<String>,
    },
    RequestSync,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_changed_wire_format() {
        let event = ServerEvent::DataChanged(DataChanged {
            entity_type: "habits".to_string(),
            entity_id: "7".to_string(),
            operation: Operation::Update,
            device_id: "A".to_string(),
            timestamp: Utc::now(),
        });

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "DataChanged");
        assert_eq!(json["entityType"], "habits");
        assert_eq!(json["deviceId"], "A");
        assert_eq!(event.origin(), Some("A"));
    }

    #[test]
    fn test_client_messages_parse() {
        let join: ClientMessage =
            serde_json::from_str(r#"{"type":"JoinGroup","deviceId":"B"}"#).unwrap();
        assert_eq!(
            join,
            ClientMessage::JoinGroup {
                device_id: "B".to_string(),
                platform: None
            }
        );

        let request: ClientMessage = serde_json::from_str(r#"{"type":"RequestSync"}"#).unwrap();
        assert_eq!(request, ClientMessage::RequestSync);
    }

    #[test]
    fn test_joined_round_trip() {
        let event = ServerEvent::Joined {
            device_id: "B".to_string(),
            connected_devices: 2,
        };
        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("connectedDevices"));
        assert_eq!(serde_json::from_str::<ServerEvent>(&text).unwrap(), event);
    }
}
