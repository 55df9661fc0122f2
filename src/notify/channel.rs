//! Device-side realtime connection
//!
//! Keeps one WebSocket open to the server's broadcast group, reconnecting
//! after a fixed delay whenever it drops. Incoming change events become sync
//! triggers; the device's own echoes are ignored.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::client::{ServerLocator, SyncTrigger};
use crate::error::ClientError;

use super::messages::{ClientMessage, ServerEvent};

/// Lifecycle of the realtime connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

/// Realtime channel configuration for one device
pub struct NotifierClient {
    locator: Arc<dyn ServerLocator>,
    device_id: String,
    platform: Option<String>,
    reconnect_delay: Duration,
    connect_timeout: Duration,
}

/// Running realtime connection
pub struct NotifierHandle {
    state: watch::Receiver<ConnectionState>,
    outgoing: mpsc::Sender<ClientMessage>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl NotifierClient {
    pub fn new(
        locator: Arc<dyn ServerLocator>,
        device_id: impl Into<String>,
        platform: Option<String>,
    ) -> Self {
        Self {
            locator,
            device_id: device_id.into(),
            platform,
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Start the connection loop. Events are turned into `triggers`.
    pub fn spawn(self, triggers: mpsc::Sender<SyncTrigger>) -> NotifierHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outgoing_tx, mut outgoing_rx) = mpsc::channel(16);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                state_tx.send_replace(ConnectionState::Connecting);

                tokio::select! {
                    result = self.connect_once(&state_tx, &mut outgoing_rx, &triggers) => {
                        match result {
                            Ok(()) => info!(device_id = %self.device_id, "Realtime connection closed"),
                            Err(e) => warn!(device_id = %self.device_id, error = %e, "Realtime connection failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }

                state_tx.send_replace(ConnectionState::Disconnected);

                tokio::select! {
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }

            state_tx.send_replace(ConnectionState::Disconnected);
            debug!(device_id = %self.device_id, "Realtime channel stopped");
        });

        NotifierHandle {
            state: state_rx,
            outgoing: outgoing_tx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn connect_once(
        &self,
        state: &watch::Sender<ConnectionState>,
        outgoing: &mut mpsc::Receiver<ClientMessage>,
        triggers: &mpsc::Sender<SyncTrigger>,
    ) -> Result<(), ClientError> {
        let base = self
            .locator
            .locate()
            .await
            .ok_or_else(|| ClientError::Offline("no sync server found".to_string()))?;
        let url = hub_url(&base)?;

        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Offline(format!("timed out connecting to {}", url)))??;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Announce presence on every (re)connect
        let join = ClientMessage::JoinGroup {
            device_id: self.device_id.clone(),
            platform: self.platform.clone(),
        };
        ws_tx
            .send(Message::Text(serde_json::to_string(&join)?))
            .await?;

        state.send_replace(ConnectionState::Connected);
        info!(%url, device_id = %self.device_id, "Connected to realtime group");

        // Events may have been missed while disconnected
        let _ = triggers.try_send(SyncTrigger::Reconnected);

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_event(&text, triggers),
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Err(e)) => return Err(e.into()),
                        _ => {}
                    }
                }
                out = outgoing.recv() => {
                    let Some(message) = out else {
                        return Ok(());
                    };
                    ws_tx
                        .send(Message::Text(serde_json::to_string(&message)?))
                        .await?;
                }
            }
        }
    }

    fn handle_event(&self, text: &str, triggers: &mpsc::Sender<SyncTrigger>) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognised realtime message");
                return;
            }
        };

        match &event {
            ServerEvent::DataChanged(change) if change.device_id == self.device_id => {
                debug!(entity_type = %change.entity_type, "Ignoring echo of own change");
            }
            ServerEvent::DataChanged(change) => {
                debug!(
                    entity_type = %change.entity_type,
                    entity_id = %change.entity_id,
                    origin = %change.device_id,
                    "Remote change announced"
                );
                // A full queue means a sync is already pending
                let _ = triggers.try_send(SyncTrigger::Notification);
            }
            ServerEvent::SyncRequested { device_id } => {
                debug!(origin = ?device_id, "Group sync requested");
                let _ = triggers.try_send(SyncTrigger::Notification);
            }
            ServerEvent::Joined {
                connected_devices, ..
            } => {
                debug!(connected_devices, "Realtime join acknowledged");
            }
        }
    }
}

impl NotifierHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask every device in the group to sync. Dropped when not connected.
    pub fn request_sync(&self) -> bool {
        self.state() == ConnectionState::Connected
            && self.outgoing.try_send(ClientMessage::RequestSync).is_ok()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// WebSocket URL of the broadcast group for an HTTP base URL
pub fn hub_url(base: &str) -> Result<String, ClientError> {
    let base = base.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
        base.to_string()
    } else {
        return Err(ClientError::InvalidUrl(base.to_string()));
    };

    Ok(format!("{}/sync/hub", ws_base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StaticLocator;
    use crate::notify::DataChanged;
    use crate::sync::Operation;
    use chrono::Utc;

    fn client(device: &str) -> NotifierClient {
        NotifierClient::new(
            Arc::new(StaticLocator::new("http://127.0.0.1:1")),
            device,
            None,
        )
    }

    fn changed_by(device: &str) -> String {
        serde_json::to_string(&ServerEvent::DataChanged(DataChanged {
            entity_type: "habits".to_string(),
            entity_id: "7".to_string(),
            operation: Operation::Create,
            device_id: device.to_string(),
            timestamp: Utc::now(),
        }))
        .unwrap()
    }

    #[test]
    fn test_hub_url() {
        assert_eq!(hub_url("http://10.0.0.2:5000/").unwrap(), "ws://10.0.0.2:5000/sync/hub");
        assert_eq!(hub_url("https://sync.example.com").unwrap(), "wss://sync.example.com/sync/hub");
        assert!(hub_url("10.0.0.2:5000").is_err());
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let (tx, mut rx) = mpsc::channel(4);
        let client = client("A");

        client.handle_event(&changed_by("A"), &tx);
        assert!(rx.try_recv().is_err());

        client.handle_event(&changed_by("B"), &tx);
        assert_eq!(rx.try_recv().unwrap(), SyncTrigger::Notification);
    }

    #[test]
    fn test_garbage_is_ignored() {
        let (tx, mut rx) = mpsc::channel(4);
        client("A").handle_event("not json", &tx);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_stays_disconnected() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = client("A")
            .with_reconnect_delay(Duration::from_millis(20))
            .with_connect_timeout(Duration::from_millis(200))
            .spawn(tx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_ne!(handle.state(), ConnectionState::Connected);
        assert!(!handle.request_sync());

        handle.shutdown().await;
    }
}
