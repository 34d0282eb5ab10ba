//! Command dispatcher
//!
//! Serializes commands per printer and correlates request/response by
//! sequence id. The sequence counter is process-global and monotonic;
//! responses echo it inside the next report frame. Commands against one
//! printer queue FIFO on the printer's write lock; there is no ordering
//! across printers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::CoreError;
use crate::mqtt::bambu_api::{
    AmsFilamentSettingCommand, AmsGetRfidCommand, ExtrusionCaliGetCommand,
    ExtrusionCaliSetCommand, GetVersionCommand, PushAllCommand,
};
use crate::mqtt::session::{SessionHandle, SessionStatus};
use crate::state::reducer::CommandEcho;

/// Never reused for the life of the process.
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub fn next_sequence_id() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Commands the core can send to a printer.
#[derive(Debug, Clone)]
pub enum PrinterCommand {
    /// Request a full state dump; fire-and-forget
    PushAll,
    /// Request firmware versions; fire-and-forget
    GetVersion,
    /// Configure one AMS slot's filament
    SetFilament {
        ams_id: i32,
        tray_id: i32,
        tray_info_idx: String,
        setting_id: Option<String>,
        tray_type: String,
        tray_color: String,
        nozzle_temp_min: u32,
        nozzle_temp_max: u32,
    },
    /// Write a pressure-advance profile for a slot
    SetKProfile {
        cali_idx: i32,
        filament_id: String,
        setting_id: String,
        nozzle_diameter: String,
        k_value: String,
        nozzle_temp: i32,
        ams_id: i32,
        tray_id: i32,
    },
    /// Fetch the calibration catalog for a nozzle diameter
    GetCalibrations { nozzle_diameter: String },
    /// Trigger an RFID re-read for a slot
    ReadRfid { ams_id: i32, tray_id: i32 },
}

impl PrinterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PrinterCommand::PushAll => "pushall",
            PrinterCommand::GetVersion => "get_version",
            PrinterCommand::SetFilament { .. } => "ams_filament_setting",
            PrinterCommand::SetKProfile { .. } => "extrusion_cali_set",
            PrinterCommand::GetCalibrations { .. } => "extrusion_cali_get",
            PrinterCommand::ReadRfid { .. } => "ams_get_rfid",
        }
    }

    pub fn expects_reply(&self) -> bool {
        !matches!(self, PrinterCommand::PushAll | PrinterCommand::GetVersion)
    }

    fn payload(&self, sequence_id: &str) -> String {
        let json = match self {
            PrinterCommand::PushAll => serde_json::to_string(&PushAllCommand::new(sequence_id)),
            PrinterCommand::GetVersion => {
                serde_json::to_string(&GetVersionCommand::new(sequence_id))
            }
            PrinterCommand::SetFilament {
                ams_id,
                tray_id,
                tray_info_idx,
                setting_id,
                tray_type,
                tray_color,
                nozzle_temp_min,
                nozzle_temp_max,
            } => serde_json::to_string(&AmsFilamentSettingCommand::new(
                sequence_id,
                *ams_id,
                *tray_id,
                tray_info_idx,
                setting_id.as_deref(),
                tray_type,
                tray_color,
                *nozzle_temp_min,
                *nozzle_temp_max,
            )),
            PrinterCommand::SetKProfile {
                cali_idx,
                filament_id,
                setting_id,
                nozzle_diameter,
                k_value,
                nozzle_temp,
                ams_id,
                tray_id,
            } => serde_json::to_string(&ExtrusionCaliSetCommand::new(
                sequence_id,
                *cali_idx,
                filament_id,
                setting_id,
                nozzle_diameter,
                k_value,
                *nozzle_temp,
                *ams_id,
                *tray_id,
            )),
            PrinterCommand::GetCalibrations { nozzle_diameter } => {
                serde_json::to_string(&ExtrusionCaliGetCommand::new(sequence_id, nozzle_diameter))
            }
            PrinterCommand::ReadRfid { ams_id, tray_id } => {
                serde_json::to_string(&AmsGetRfidCommand::new(sequence_id, *ams_id, *tray_id))
            }
        };
        json.expect("command structs serialize infallibly")
    }
}

/// Correlated acknowledgement delivered back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub success: bool,
    pub reason: Option<String>,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<CommandReply>>>>;

/// Removes the correlation entry when the caller goes away, however it
/// goes away: reply, timeout, disconnect, or future drop.
struct PendingGuard {
    pending: Pending,
    sequence_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .expect("pending map poisoned")
            .remove(&self.sequence_id);
    }
}

pub struct CommandDispatcher {
    pending: Pending,
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    default_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            write_locks: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    fn write_lock(&self, serial: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .expect("write lock map poisoned")
            .entry(serial.to_string())
            .or_default()
            .clone()
    }

    pub async fn send(
        &self,
        session: &SessionHandle,
        command: PrinterCommand,
    ) -> Result<CommandReply, CoreError> {
        self.send_with_timeout(session, command, self.default_timeout)
            .await
    }

    /// Publishes under the per-printer write lock and waits for the
    /// correlated reply. Resolves on first of: reply, disconnect, timeout.
    pub async fn send_with_timeout(
        &self,
        session: &SessionHandle,
        command: PrinterCommand,
        timeout: Duration,
    ) -> Result<CommandReply, CoreError> {
        let lock = self.write_lock(session.serial());
        let _guard = lock.lock().await;

        if !session.is_connected() {
            return Err(CoreError::Unavailable(session.serial().to_string()));
        }

        let sequence_id = next_sequence_id();
        let payload = command.payload(&sequence_id.to_string());

        if !command.expects_reply() {
            session.publish(payload).await?;
            return Ok(CommandReply {
                success: true,
                reason: None,
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(sequence_id, reply_tx);
        let _pending_guard = PendingGuard {
            pending: self.pending.clone(),
            sequence_id,
        };

        session.publish(payload).await?;

        let mut status = session.status_receiver();
        let disconnected = async {
            loop {
                if *status.borrow() != SessionStatus::Connected {
                    return;
                }
                if status.changed().await.is_err() {
                    return;
                }
            }
        };

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| CoreError::Canceled),
            _ = disconnected => Err(CoreError::Disconnected(session.serial().to_string())),
            _ = tokio::time::sleep(timeout) => Err(CoreError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /// Called by sessions when a frame carries a command acknowledgement.
    /// Returns false for late responses (caller already gone), which are
    /// dropped.
    pub fn complete(&self, echo: &CommandEcho) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pending map poisoned")
            .remove(&echo.sequence_id);
        match sender {
            Some(tx) => tx
                .send(CommandReply {
                    success: echo.success,
                    reason: echo.reason.clone(),
                })
                .is_ok(),
            None => {
                tracing::warn!(
                    sequence_id = echo.sequence_id,
                    command = %echo.command,
                    "late_response dropped"
                );
                false
            }
        }
    }

    /// Fails every in-flight command, used on shutdown. Dropping the
    /// senders resolves the callers with `Canceled`.
    pub fn cancel_all(&self) {
        self.pending.lock().expect("pending map poisoned").clear();
    }

    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::session::SessionHandle;
    use std::collections::HashSet;

    #[test]
    fn test_sequence_ids_unique_and_monotonic() {
        let mut seen = HashSet::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = next_sequence_id();
            assert!(seen.insert(id));
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_payload_carries_sequence_id() {
        let cmd = PrinterCommand::SetFilament {
            ams_id: 0,
            tray_id: 0,
            tray_info_idx: "GFL99".into(),
            setting_id: None,
            tray_type: "PLA".into(),
            tray_color: "FF0000FF".into(),
            nozzle_temp_min: 190,
            nozzle_temp_max: 230,
        };
        let payload = cmd.payload("99");
        assert!(payload.contains("\"sequence_id\":\"99\""));
        assert!(payload.contains("ams_filament_setting"));
    }

    #[tokio::test]
    async fn test_unavailable_when_not_connected() {
        let dispatcher = CommandDispatcher::new(Duration::from_millis(100));
        let (handle, _channels) = SessionHandle::channel("P1", 8);
        let err = dispatcher
            .send(&handle, PrinterCommand::ReadRfid { ams_id: 0, tray_id: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_reply_correlation() {
        let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_secs(1)));
        let (handle, mut channels) = SessionHandle::channel("P1", 8);
        channels.set_status(SessionStatus::Connected);

        let d = dispatcher.clone();
        let send = tokio::spawn(async move {
            d.send(&handle, PrinterCommand::ReadRfid { ams_id: 0, tray_id: 1 })
                .await
        });

        // Fake printer: read the published payload, ack its sequence id
        let payload = channels.outbound_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let seq: u64 = value["print"]["sequence_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(dispatcher.complete(&CommandEcho {
            sequence_id: seq,
            command: "ams_get_rfid".into(),
            success: true,
            reason: None,
        }));

        let reply = send.await.unwrap().unwrap();
        assert!(reply.success);
        assert_eq!(dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_dropped() {
        let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_millis(20)));
        let (handle, mut channels) = SessionHandle::channel("P1", 8);
        channels.set_status(SessionStatus::Connected);

        let d = dispatcher.clone();
        let send = tokio::spawn(async move {
            d.send(&handle, PrinterCommand::ReadRfid { ams_id: 0, tray_id: 0 })
                .await
        });
        let payload = channels.outbound_rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        let seq: u64 = value["print"]["sequence_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap();

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));

        // The correlation entry is gone; the echo is a late response
        assert!(!dispatcher.complete(&CommandEcho {
            sequence_id: seq,
            command: "ams_get_rfid".into(),
            success: true,
            reason: None,
        }));
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight() {
        let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_secs(5)));
        let (handle, mut channels) = SessionHandle::channel("P1", 8);
        channels.set_status(SessionStatus::Connected);

        let d = dispatcher.clone();
        let send = tokio::spawn(async move {
            d.send(&handle, PrinterCommand::ReadRfid { ams_id: 0, tray_id: 0 })
                .await
        });
        let _ = channels.outbound_rx.recv().await.unwrap();
        channels.set_status(SessionStatus::Backoff);

        let err = send.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_per_printer_write_order() {
        // Commands appear on the wire in write-lock acquisition order even
        // with many concurrent callers.
        let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_millis(50)));
        let (handle, mut channels) = SessionHandle::channel("P1", 64);
        channels.set_status(SessionStatus::Connected);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let d = dispatcher.clone();
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                // ReadRfid expects a reply nobody sends; timeout is the
                // expected outcome, publishing is what we observe.
                let _ = d
                    .send(&h, PrinterCommand::ReadRfid { ams_id: 0, tray_id: i })
                    .await;
            }));
        }

        let mut published = Vec::new();
        for _ in 0..8 {
            let payload = channels.outbound_rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
            let seq: u64 = value["print"]["sequence_id"]
                .as_str()
                .unwrap()
                .parse()
                .unwrap();
            published.push(seq);
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Sequence ids are assigned under the lock, so wire order must be
        // strictly increasing.
        let mut sorted = published.clone();
        sorted.sort_unstable();
        assert_eq!(published, sorted);
    }
}
