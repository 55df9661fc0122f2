//! Server-side broadcast group
//!
//! Every connection subscribes to one broadcast channel. Presence is tracked
//! per connection so the status endpoint can report connected devices.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use super::messages::ServerEvent;

/// Opaque handle for one realtime connection
pub type ConnectionId = u64;

#[derive(Debug, Clone)]
struct Presence {
    device_id: Option<String>,
    platform: Option<String>,
    connected_at: DateTime<Utc>,
}

/// Broadcast group shared by all realtime connections
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<NotifierInner>,
}

struct NotifierInner {
    events: broadcast::Sender<ServerEvent>,
    connections: RwLock<HashMap<ConnectionId, Presence>>,
    next_id: AtomicU64,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(NotifierInner {
                events,
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new connection and subscribe it to the group
    pub async fn connect(&self) -> (ConnectionId, broadcast::Receiver<ServerEvent>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.inner.events.subscribe();

        self.inner.connections.write().await.insert(
            id,
            Presence {
                device_id: None,
                platform: None,
                connected_at: Utc::now(),
            },
        );

        (id, receiver)
    }

    /// Attach a device identity to a connection. Re-joining simply
    /// overwrites the previous announcement.
    pub async fn join(&self, connection: ConnectionId, device_id: &str, platform: Option<&str>) {
        let mut connections = self.inner.connections.write().await;
        if let Some(presence) = connections.get_mut(&connection) {
            presence.device_id = Some(device_id.to_string());
            if platform.is_some() {
                presence.platform = platform.map(str::to_string);
            }
            tracing::info!(
                connection,
                device_id,
                platform = ?presence.platform,
                since = %presence.connected_at,
                "Device joined realtime group"
            );
        }
    }

    pub async fn disconnect(&self, connection: ConnectionId) {
        if let Some(presence) = self.inner.connections.write().await.remove(&connection) {
            tracing::info!(
                connection,
                device_id = ?presence.device_id,
                "Realtime connection closed"
            );
        }
    }

    /// Fan an event out to every subscriber. Returns how many received it.
    pub fn publish(&self, event: ServerEvent) -> usize {
        // No subscribers is not an error for a best-effort channel
        self.inner.events.send(event).unwrap_or(0)
    }

    /// Distinct devices currently joined
    pub async fn connected_devices(&self) -> usize {
        self.connected_device_ids().await.len()
    }

    pub async fn connected_device_ids(&self) -> Vec<String> {
        let connections = self.inner.connections.read().await;
        let ids: HashSet<&String> = connections
            .values()
            .filter_map(|p| p.device_id.as_ref())
            .collect();
        let mut ids: Vec<String> = ids.into_iter().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::DataChanged;
    use crate::sync::Operation;

    fn changed(device: &str) -> ServerEvent {
        ServerEvent::DataChanged(DataChanged {
            entity_type: "habits".to_string(),
            entity_id: "7".to_string(),
            operation: Operation::Update,
            device_id: device.to_string(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let notifier = Notifier::default();
        let (_a, mut rx_a) = notifier.connect().await;
        let (_b, mut rx_b) = notifier.connect().await;

        assert_eq!(notifier.publish(changed("A")), 2);

        // The originating device is not excluded server-side
        assert_eq!(rx_a.recv().await.unwrap().origin(), Some("A"));
        assert_eq!(rx_b.recv().await.unwrap().origin(), Some("A"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let notifier = Notifier::default();
        assert_eq!(notifier.publish(changed("A")), 0);
    }

    #[tokio::test]
    async fn test_presence_tracking() {
        let notifier = Notifier::default();
        let (a, _rx_a) = notifier.connect().await;
        let (b, _rx_b) = notifier.connect().await;
        let (c, _rx_c) = notifier.connect().await;

        notifier.join(a, "phone", Some("mobile")).await;
        notifier.join(b, "phone", None).await;
        notifier.join(c, "laptop", Some("desktop")).await;

        assert_eq!(notifier.connection_count().await, 3);
        assert_eq!(notifier.connected_devices().await, 2);

        notifier.disconnect(c).await;
        assert_eq!(notifier.connected_device_ids().await, vec!["phone".to_string()]);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_events() {
        let notifier = Notifier::new(2);
        let (_id, mut rx) = notifier.connect().await;

        for _ in 0..4 {
            notifier.publish(changed("A"));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert!(rx.recv().await.is_ok());
    }
}
