//! In-process event bus
//!
//! Core components publish typed events; WebSocket subscribers and the
//! staged-assignment watcher consume them. Events stay a Rust enum on the
//! bus; JSON happens only at the socket boundary.
//!
//! The bus also mirrors the minimal state an attaching subscriber needs
//! (`initial_state` plus one full `printer_state` per printer). Mirror
//! updates and broadcast sends happen under one lock, and `subscribe`
//! takes the same lock, so a snapshot reflects exactly the events sent
//! before it and none after - no gap, no overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::PrinterState;

/// One observed difference between two printer-state snapshots.
///
/// `path` is dotted: `gcode_state`, `ams.0`, `ams.0.tray.2`, `cover`,
/// `calibrations`. The WS hub types outgoing messages by the path root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateDelta {
    pub path: String,
    pub old: serde_json::Value,
    pub new: serde_json::Value,
}

/// Outcome of a slot-assignment request, also published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Configured,
    Staged,
    StagedReplace,
    Error,
}

/// Everything that can happen in the connection core.
#[derive(Debug, Clone)]
pub enum Event {
    PrinterConnected {
        serial: String,
    },
    PrinterDisconnected {
        serial: String,
    },
    /// Persistent connect failure (>10 attempts inside 5 minutes)
    PrinterUnreachable {
        serial: String,
    },
    /// Telemetry changed. Carries the full post-reduction snapshot plus the
    /// delta list; `snapshot` marks pushall reloads, which the hub forwards
    /// as one full-state message.
    PrinterState {
        serial: String,
        state: Arc<PrinterState>,
        deltas: Arc<[StateDelta]>,
        snapshot: bool,
    },
    JobStarted {
        serial: String,
        subtask_name: String,
    },
    JobEnded {
        serial: String,
    },
    JobChanged {
        serial: String,
        subtask_name: String,
    },
    DeviceConnected,
    DeviceDisconnected,
    Weight {
        grams: f64,
        stable: bool,
    },
    DeviceState {
        update_available: bool,
    },
    TagDetected {
        tag_id: String,
        tag_type: String,
        spool: Option<serde_json::Value>,
        data: Option<serde_json::Value>,
    },
    TagRemoved,
    AssignmentResult {
        serial: String,
        ams_id: u32,
        tray_id: u32,
        spool_id: String,
        outcome: AssignmentOutcome,
        message: Option<String>,
    },
    ParseWarning {
        serial: String,
        message: String,
    },
    ParseError {
        serial: String,
        message: String,
    },
}

/// Mirror of the embedded device for attach snapshots.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceSnapshot {
    pub connected: bool,
    pub last_weight: Option<f64>,
    pub weight_stable: bool,
    pub current_tag_id: Option<String>,
    pub update_available: bool,
}

/// Consistent view handed to a subscriber at attach time.
#[derive(Debug, Clone, Default)]
pub struct BusSnapshot {
    pub device: DeviceSnapshot,
    /// serial -> connected
    pub printers: HashMap<String, bool>,
    /// serial -> last published full state
    pub printer_states: HashMap<String, Arc<PrinterState>>,
}

#[derive(Default)]
struct Mirror {
    device: DeviceSnapshot,
    printers: HashMap<String, bool>,
    printer_states: HashMap<String, Arc<PrinterState>>,
}

impl Mirror {
    fn apply(&mut self, event: &Event) {
        match event {
            Event::PrinterConnected { serial } => {
                self.printers.insert(serial.clone(), true);
                if let Some(state) = self.printer_states.get_mut(serial) {
                    let mut patched = (**state).clone();
                    patched.connected = true;
                    *state = Arc::new(patched);
                }
            }
            Event::PrinterDisconnected { serial } => {
                self.printers.insert(serial.clone(), false);
                if let Some(state) = self.printer_states.get_mut(serial) {
                    let mut patched = (**state).clone();
                    patched.mark_disconnected();
                    *state = Arc::new(patched);
                }
            }
            Event::PrinterState { serial, state, .. } => {
                self.printers.insert(serial.clone(), state.connected);
                self.printer_states.insert(serial.clone(), state.clone());
            }
            Event::DeviceConnected => {
                self.device.connected = true;
            }
            Event::DeviceDisconnected => {
                self.device.connected = false;
                self.device.current_tag_id = None;
            }
            Event::Weight { grams, stable } => {
                self.device.last_weight = Some(*grams);
                self.device.weight_stable = *stable;
            }
            Event::DeviceState { update_available } => {
                self.device.update_available = *update_available;
            }
            Event::TagDetected { tag_id, .. } => {
                self.device.current_tag_id = Some(tag_id.clone());
            }
            Event::TagRemoved => {
                self.device.current_tag_id = None;
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> BusSnapshot {
        BusSnapshot {
            device: self.device.clone(),
            printers: self.printers.clone(),
            printer_states: self.printer_states.clone(),
        }
    }
}

/// Broadcast bus with attach-time snapshot consistency.
///
/// Fan-out rides `tokio::sync::broadcast`: each receiver cursors the shared
/// ring independently, so a subscriber that stops draining skips old
/// messages (surfaced as `Lagged(n)`) without ever blocking the producer or
/// the other subscribers.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    mirror: Mutex<Mirror>,
}

impl EventBus {
    pub fn new(queue_depth: usize) -> Self {
        let (tx, _) = broadcast::channel(queue_depth);
        Self {
            tx,
            mirror: Mutex::new(Mirror::default()),
        }
    }

    /// Publish an event. Never blocks; with no subscribers the event only
    /// updates the mirror.
    pub fn publish(&self, event: Event) {
        let mut mirror = self.mirror.lock().expect("bus mirror poisoned");
        mirror.apply(&event);
        let _ = self.tx.send(event);
    }

    /// Subscribe together with a snapshot that is atomic with respect to
    /// the event stream the new receiver will observe.
    pub fn subscribe(&self) -> (broadcast::Receiver<Event>, BusSnapshot) {
        let mirror = self.mirror.lock().expect("bus mirror poisoned");
        (self.tx.subscribe(), mirror.snapshot())
    }

    /// Receiver without snapshot, for internal watchers.
    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(16)
    }

    #[tokio::test]
    async fn test_snapshot_reflects_prior_events() {
        let bus = bus();
        bus.publish(Event::PrinterConnected {
            serial: "P1".into(),
        });
        bus.publish(Event::Weight {
            grams: 850.5,
            stable: true,
        });

        let (mut rx, snapshot) = bus.subscribe();
        assert_eq!(snapshot.printers.get("P1"), Some(&true));
        assert_eq!(snapshot.device.last_weight, Some(850.5));
        assert!(snapshot.device.weight_stable);

        // Nothing published before the subscribe may arrive as a delta
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        bus.publish(Event::PrinterDisconnected {
            serial: "P1".into(),
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            Event::PrinterDisconnected { .. }
        ));
    }

    #[tokio::test]
    async fn test_tag_lifecycle_in_mirror() {
        let bus = bus();
        bus.publish(Event::DeviceConnected);
        bus.publish(Event::TagDetected {
            tag_id: "04:AB".into(),
            tag_type: "ntag215".into(),
            spool: None,
            data: None,
        });
        let (_, snapshot) = bus.subscribe();
        assert_eq!(snapshot.device.current_tag_id.as_deref(), Some("04:AB"));

        bus.publish(Event::TagRemoved);
        let (_, snapshot) = bus.subscribe();
        assert_eq!(snapshot.device.current_tag_id, None);
    }

    #[tokio::test]
    async fn test_lag_reports_loss_count() {
        let bus = bus();
        let (mut rx, _) = bus.subscribe();
        for _ in 0..40 {
            bus.publish(Event::TagRemoved);
        }
        // Capacity 16: the receiver lost the oldest events and learns how many
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(lost)) => assert!(lost >= 16),
            other => panic!("expected lag, got {other:?}"),
        }
    }
}
