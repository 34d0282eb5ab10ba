//! UI subscriber endpoint
//!
//! Each client gets an atomic `initial_state` snapshot followed by the
//! delta stream. Events stay typed until this boundary; everything the
//! socket carries is a JSON object with a `type` field.
//!
//! Back-pressure: the broadcast ring bounds each subscriber's backlog.
//! A subscriber that falls off the ring loses its oldest messages, learns
//! how many via a `slow_consumer` marker, and is evicted after repeated
//! markers inside the configured window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::debug;

use crate::AppState;
use crate::events::{BusSnapshot, Event, StateDelta};
use crate::state::PrinterState;

/// WebSocket endpoint for UI clients (browser, tablet, device display)
pub async fn ui_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    if *state.shutdown.borrow() {
        // Shutdown stops accepting subscribers before draining the rest.
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(|socket| handle_ui_socket(socket, state))
}

async fn handle_ui_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let subscriber_id = uuid::Uuid::new_v4();

    // Snapshot and stream position are taken atomically: everything before
    // the snapshot is in it, everything after arrives as deltas.
    let (mut rx, snapshot) = state.bus.subscribe();

    debug!(%subscriber_id, "UI client connected");

    if send_text(&mut sender, initial_state_message(&snapshot).to_string())
        .await
        .is_err()
    {
        return;
    }
    for (serial, printer_state) in &snapshot.printer_states {
        let message = printer_state_message(serial, printer_state).to_string();
        if send_text(&mut sender, message).await.is_err() {
            return;
        }
    }

    let mut drop_window = DropWindow::new(
        Duration::from_millis(state.config.slow_consumer_window_ms),
        state.config.slow_consumer_max_drops_per_window as usize,
    );
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let mut failed = false;
                    for message in event_messages(&event) {
                        if send_text(&mut sender, message).await.is_err() {
                            failed = true;
                            break;
                        }
                    }
                    if failed {
                        break;
                    }
                }
                Err(RecvError::Lagged(lost)) => {
                    let marker = serde_json::json!({
                        "type": "slow_consumer",
                        "lost": lost,
                    });
                    if send_text(&mut sender, marker.to_string()).await.is_err() {
                        break;
                    }
                    if drop_window.record(Instant::now()) {
                        debug!(%subscriber_id, "evicting slow consumer");
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: close_code::POLICY,
                                reason: "slow consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
            inbound = receiver.next() => match inbound {
                // Clients only ping; axum answers pongs itself.
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "server shutting down".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    }

    debug!(%subscriber_id, "UI client disconnected");
}

async fn send_text(
    sender: &mut SplitSink<WebSocket, Message>,
    message: String,
) -> Result<(), axum::Error> {
    sender.send(Message::Text(message.into())).await
}

/// Eviction policy: too many loss markers inside a rolling window and the
/// subscriber is cut loose.
struct DropWindow {
    marks: VecDeque<Instant>,
    window: Duration,
    max_drops: usize,
}

impl DropWindow {
    fn new(window: Duration, max_drops: usize) -> Self {
        Self {
            marks: VecDeque::new(),
            window,
            max_drops,
        }
    }

    /// Records one loss marker; returns true when the subscriber should be
    /// evicted.
    fn record(&mut self, now: Instant) -> bool {
        self.marks.push_back(now);
        while self
            .marks
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            self.marks.pop_front();
        }
        self.marks.len() >= self.max_drops
    }
}

fn initial_state_message(snapshot: &BusSnapshot) -> serde_json::Value {
    serde_json::json!({
        "type": "initial_state",
        "device": snapshot.device,
        "printers": snapshot.printers,
    })
}

fn printer_state_message(serial: &str, state: &PrinterState) -> serde_json::Value {
    serde_json::json!({
        "type": "printer_state",
        "serial": serial,
        "state": state,
    })
}

/// Converts one bus event into its socket representation. Telemetry
/// updates are typed by delta path root: scalar changes coalesce into one
/// `printer_state` message, unit and tray changes go out as `ams_unit` and
/// `tray` messages, cover completion as `cover`.
pub(crate) fn event_messages(event: &Event) -> Vec<String> {
    let values: Vec<serde_json::Value> = match event {
        Event::PrinterConnected { serial } => vec![serde_json::json!({
            "type": "printer_connected", "serial": serial,
        })],
        Event::PrinterDisconnected { serial } => vec![serde_json::json!({
            "type": "printer_disconnected", "serial": serial,
        })],
        Event::PrinterUnreachable { serial } => vec![serde_json::json!({
            "type": "printer_unreachable", "serial": serial,
        })],
        Event::PrinterState {
            serial,
            state,
            deltas,
            snapshot,
        } => {
            if *snapshot {
                vec![printer_state_message(serial, state)]
            } else {
                delta_messages(serial, deltas)
            }
        }
        Event::JobStarted {
            serial,
            subtask_name,
        } => vec![serde_json::json!({
            "type": "job_started", "serial": serial, "subtask_name": subtask_name,
        })],
        Event::JobEnded { serial } => vec![serde_json::json!({
            "type": "job_ended", "serial": serial,
        })],
        Event::JobChanged {
            serial,
            subtask_name,
        } => vec![serde_json::json!({
            "type": "job_changed", "serial": serial, "subtask_name": subtask_name,
        })],
        Event::DeviceConnected => vec![serde_json::json!({"type": "device_connected"})],
        Event::DeviceDisconnected => vec![serde_json::json!({"type": "device_disconnected"})],
        Event::Weight { grams, stable } => vec![serde_json::json!({
            "type": "weight", "grams": grams, "stable": stable,
        })],
        Event::DeviceState { update_available } => vec![serde_json::json!({
            "type": "device_state", "update_available": update_available,
        })],
        Event::TagDetected {
            tag_id,
            tag_type,
            spool,
            data,
        } => vec![serde_json::json!({
            "type": "tag_detected",
            "tag_id": tag_id,
            "tag_type": tag_type,
            "spool": spool,
            "data": data,
        })],
        Event::TagRemoved => vec![serde_json::json!({"type": "tag_removed"})],
        Event::AssignmentResult {
            serial,
            ams_id,
            tray_id,
            spool_id,
            outcome,
            message,
        } => vec![serde_json::json!({
            "type": "assignment_result",
            "serial": serial,
            "ams_id": ams_id,
            "tray_id": tray_id,
            "spool_id": spool_id,
            "result": outcome,
            "message": message,
        })],
        Event::ParseWarning { serial, message } => vec![serde_json::json!({
            "type": "parse_warning", "serial": serial, "message": message,
        })],
        Event::ParseError { serial, message } => vec![serde_json::json!({
            "type": "parse_error", "serial": serial, "message": message,
        })],
    };
    values.into_iter().map(|v| v.to_string()).collect()
}

fn delta_messages(serial: &str, deltas: &[StateDelta]) -> Vec<serde_json::Value> {
    let mut scalars = serde_json::Map::new();
    let mut messages = Vec::new();

    for delta in deltas {
        if let Some(rest) = delta.path.strip_prefix("ams.") {
            if let Some((ams_id, tray_id)) = rest.split_once(".tray.") {
                messages.push(serde_json::json!({
                    "type": "tray",
                    "serial": serial,
                    "ams_id": ams_id.parse::<u32>().unwrap_or(0),
                    "tray_id": tray_id.parse::<u32>().unwrap_or(0),
                    "tray": delta.new,
                }));
            } else {
                messages.push(serde_json::json!({
                    "type": "ams_unit",
                    "serial": serial,
                    "ams_id": rest.parse::<u32>().unwrap_or(0),
                    "unit": delta.new,
                }));
            }
        } else if delta.path == "cover" {
            messages.push(serde_json::json!({
                "type": "cover",
                "serial": serial,
                "size": delta.new,
            }));
        } else {
            scalars.insert(delta.path.clone(), delta.new.clone());
        }
    }

    if !scalars.is_empty() {
        messages.insert(
            0,
            serde_json::json!({
                "type": "printer_state",
                "serial": serial,
                "state": serde_json::Value::Object(scalars),
            }),
        );
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AssignmentOutcome;
    use std::sync::Arc as StdArc;

    #[test]
    fn test_initial_state_shape() {
        let mut snapshot = BusSnapshot::default();
        snapshot.device.connected = true;
        snapshot.device.last_weight = Some(850.5);
        snapshot.device.weight_stable = true;
        snapshot.printers.insert("00M09A123456789".into(), true);
        snapshot.printers.insert("00M09A987654321".into(), false);

        let value = initial_state_message(&snapshot);
        assert_eq!(value["type"], "initial_state");
        assert_eq!(value["device"]["connected"], true);
        assert_eq!(value["device"]["last_weight"], 850.5);
        assert_eq!(value["printers"]["00M09A123456789"], true);
        assert_eq!(value["printers"]["00M09A987654321"], false);
    }

    #[test]
    fn test_delta_messages_typed_by_path_root() {
        let deltas = vec![
            StateDelta {
                path: "gcode_state".into(),
                old: serde_json::json!("IDLE"),
                new: serde_json::json!("RUNNING"),
            },
            StateDelta {
                path: "print_progress".into(),
                old: serde_json::json!(0),
                new: serde_json::json!(45),
            },
            StateDelta {
                path: "ams.0.tray.2".into(),
                old: serde_json::Value::Null,
                new: serde_json::json!({"tray_type": "PLA"}),
            },
            StateDelta {
                path: "ams.128".into(),
                old: serde_json::Value::Null,
                new: serde_json::json!({"label": "HT-A"}),
            },
        ];

        let messages = delta_messages("P1", &deltas);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["type"], "printer_state");
        assert_eq!(messages[0]["state"]["gcode_state"], "RUNNING");
        assert_eq!(messages[0]["state"]["print_progress"], 45);
        assert_eq!(messages[1]["type"], "tray");
        assert_eq!(messages[1]["ams_id"], 0);
        assert_eq!(messages[1]["tray_id"], 2);
        assert_eq!(messages[2]["type"], "ams_unit");
        assert_eq!(messages[2]["ams_id"], 128);
    }

    #[test]
    fn test_snapshot_event_sends_full_state() {
        let state = StdArc::new(PrinterState::default());
        let event = Event::PrinterState {
            serial: "P1".into(),
            state,
            deltas: vec![].into(),
            snapshot: true,
        };
        let messages = event_messages(&event);
        assert_eq!(messages.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(value["type"], "printer_state");
        assert!(value["state"].get("ams_units").is_some());
        assert!(value["state"].get("nozzle_count").is_some());
    }

    #[test]
    fn test_drop_window_eviction() {
        let mut window = DropWindow::new(Duration::from_millis(30_000), 3);
        let start = Instant::now();
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(5)));
        // Third marker within the window evicts
        assert!(window.record(start + Duration::from_secs(10)));

        // Markers spread wider than the window never accumulate
        let mut window = DropWindow::new(Duration::from_millis(30_000), 3);
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(31)));
        assert!(!window.record(start + Duration::from_secs(62)));
    }

    #[test]
    fn test_assignment_result_message() {
        let event = Event::AssignmentResult {
            serial: "P1".into(),
            ams_id: 0,
            tray_id: 0,
            spool_id: "s1".into(),
            outcome: AssignmentOutcome::StagedReplace,
            message: None,
        };
        let messages = event_messages(&event);
        let value: serde_json::Value = serde_json::from_str(&messages[0]).unwrap();
        assert_eq!(value["result"], "staged_replace");
    }
}
