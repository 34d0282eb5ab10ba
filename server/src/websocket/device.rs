//! Tag/scale device session
//!
//! The embedded reader/scale connects here. Exactly one device session is
//! live at a time; a newer connection evicts the older one. The session is
//! considered dead after `device_heartbeat_timeout_ms` without any inbound
//! frame. Weight values are forwarded verbatim with their stability flag;
//! hysteresis is the consumer's concern.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::AppState;
use crate::events::Event;
use crate::websocket::DeviceCommand;

/// WebSocket endpoint for the embedded device
pub async fn device_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_device_socket(socket, state))
}

/// Messages from device to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// NFC tag detected
    TagDetected {
        tag_id: String,
        tag_type: String,
        data: Option<serde_json::Value>,
    },
    /// NFC tag removed
    TagRemoved,
    /// Weight update from scale
    Weight { grams: f64, stable: bool },
    /// Heartbeat
    Heartbeat { uptime: u64 },
    /// Response to a downstream command
    CommandResult {
        request_id: String,
        success: bool,
        error: Option<String>,
    },
}

/// Messages from server to device
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Write tag command
    WriteTag {
        request_id: String,
        data: serde_json::Value,
    },
    /// Tare scale command
    TareScale,
    /// Calibrate scale command
    CalibrateScale { known_weight: f64 },
    /// Notification to show on device
    Notification { message: String, duration_ms: u32 },
}

impl From<DeviceCommand> for ServerMessage {
    fn from(command: DeviceCommand) -> Self {
        match command {
            DeviceCommand::TareScale => ServerMessage::TareScale,
            DeviceCommand::CalibrateScale { known_weight } => {
                ServerMessage::CalibrateScale { known_weight }
            }
            DeviceCommand::WriteTag { request_id, data } => {
                ServerMessage::WriteTag { request_id, data }
            }
            DeviceCommand::Notify {
                message,
                duration_ms,
            } => ServerMessage::Notification {
                message,
                duration_ms,
            },
        }
    }
}

async fn handle_device_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let heartbeat_timeout = Duration::from_millis(state.config.device_heartbeat_timeout_ms);

    let (command_tx, mut command_rx) = mpsc::channel::<DeviceCommand>(32);
    let (evict_tx, mut evict_rx) = oneshot::channel::<()>();
    let generation = state.device.begin_session(command_tx, evict_tx).await;

    info!(generation, "device connected");
    state.bus.publish(Event::DeviceConnected);

    loop {
        tokio::select! {
            // A newer device connection took over.
            _ = &mut evict_rx => {
                info!(generation, "device session evicted by newer connection");
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::POLICY,
                        reason: "replaced by newer connection".into(),
                    })))
                    .await;
                break;
            }
            command = command_rx.recv() => {
                let Some(command) = command else { break };
                let json = match serde_json::to_string(&ServerMessage::from(command)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("failed to encode device command: {e}");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = tokio::time::timeout(heartbeat_timeout, receiver.next()) => {
                match inbound {
                    Err(_) => {
                        warn!(generation, "device heartbeat timeout, dropping session");
                        break;
                    }
                    Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(Message::Text(text)))) => {
                        match serde_json::from_str::<DeviceMessage>(&text) {
                            Ok(message) => handle_device_message(&state, message).await,
                            Err(e) => warn!("invalid device message: {e}"),
                        }
                    }
                    // Any frame counts as liveness, including pings
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    // Only the still-current session reports the device gone.
    if state.device.end_session(generation).await {
        info!(generation, "device disconnected");
        state.bus.publish(Event::DeviceDisconnected);
    }
}

async fn handle_device_message(state: &Arc<AppState>, message: DeviceMessage) {
    match message {
        DeviceMessage::TagDetected {
            tag_id,
            tag_type,
            data,
        } => {
            info!(%tag_id, %tag_type, "tag detected");

            // Enrich with the known spool before fanning out
            let spool = crate::db::get_spool_by_tag(&state.db, &tag_id)
                .await
                .ok()
                .flatten()
                .and_then(|spool| serde_json::to_value(spool).ok());

            state.bus.publish(Event::TagDetected {
                tag_id,
                tag_type,
                spool,
                data,
            });
        }
        DeviceMessage::TagRemoved => {
            info!("tag removed");
            state.bus.publish(Event::TagRemoved);
        }
        DeviceMessage::Weight { grams, stable } => {
            state.bus.publish(Event::Weight { grams, stable });
        }
        DeviceMessage::Heartbeat { uptime } => {
            debug!("device heartbeat: {uptime}s uptime");
        }
        DeviceMessage::CommandResult {
            request_id,
            success,
            error,
        } => {
            if success {
                debug!(%request_id, "device command acknowledged");
            } else {
                warn!(%request_id, "device command failed: {:?}", error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_parsing() {
        let message: DeviceMessage = serde_json::from_str(
            r#"{"type":"tag_detected","tag_id":"04:AB:CD:EF:12:34:56","tag_type":"ntag215","data":{"material":"PLA"}}"#,
        )
        .unwrap();
        assert!(matches!(message, DeviceMessage::TagDetected { .. }));

        let message: DeviceMessage =
            serde_json::from_str(r#"{"type":"weight","grams":850.5,"stable":true}"#).unwrap();
        let DeviceMessage::Weight { grams, stable } = message else {
            panic!("expected weight");
        };
        assert_eq!(grams, 850.5);
        assert!(stable);

        let message: DeviceMessage =
            serde_json::from_str(r#"{"type":"heartbeat","uptime":3600}"#).unwrap();
        assert!(matches!(message, DeviceMessage::Heartbeat { uptime: 3600 }));
    }

    #[test]
    fn test_downstream_message_shape() {
        let json = serde_json::to_value(ServerMessage::WriteTag {
            request_id: "abc123".into(),
            data: serde_json::json!({"material": "PLA"}),
        })
        .unwrap();
        assert_eq!(json["type"], "write_tag");
        assert_eq!(json["request_id"], "abc123");

        let json = serde_json::to_value(ServerMessage::Notification {
            message: "Spool assigned".into(),
            duration_ms: 3000,
        })
        .unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["duration_ms"], 3000);
    }
}
