//! Realtime notification hub
//!
//! One WebSocket per device. Devices announce themselves with `JoinGroup`
//! and receive every `DataChanged` event published after a push.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::notify::{ClientMessage, ServerEvent};
use crate::state::AppState;
use crate::sync::DeviceRepository;

pub async fn hub(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let notifier = state.notifier().clone();
    let (connection, mut events) = notifier.connect().await;
    let (mut sender, mut receiver) = socket.split();
    let mut device_id: Option<String> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        // The device missed events; have it catch up by pulling
                        warn!(connection, skipped, "Realtime subscriber lagged");
                        ServerEvent::SyncRequested { device_id: None }
                    }
                    Err(RecvError::Closed) => break,
                };
                if send_event(&mut sender, &event).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let parsed = serde_json::from_str::<ClientMessage>(&text);
                        match parsed {
                            Ok(ClientMessage::JoinGroup { device_id: id, platform }) => {
                                notifier.join(connection, &id, platform.as_deref()).await;
                                if let Err(e) = DeviceRepository::new(state.db())
                                    .touch(&id, platform.as_deref())
                                    .await
                                {
                                    warn!(device_id = %id, error = %e, "Failed to update device bookkeeping");
                                }

                                let ack = ServerEvent::Joined {
                                    device_id: id.clone(),
                                    connected_devices: notifier.connected_devices().await,
                                };
                                device_id = Some(id);
                                if send_event(&mut sender, &ack).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::RequestSync) => {
                                debug!(connection, device_id = ?device_id, "Group sync requested");
                                notifier.publish(ServerEvent::SyncRequested {
                                    device_id: device_id.clone(),
                                });
                            }
                            Err(e) => debug!(connection, error = %e, "Ignoring unrecognised realtime message"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection, error = %e, "Realtime socket error");
                        break;
                    }
                    // Ping/pong is answered by axum
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    notifier.disconnect(connection).await;
}

async fn send_event<S>(sender: &mut S, event: &ServerEvent) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode realtime event");
            return Ok(());
        }
    };
    sender.send(Message::Text(text)).await
}
