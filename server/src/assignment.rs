//! Slot-assignment workflow
//!
//! Given "assign spool S to (printer P, ams A, tray T)", decide between
//! configuring the slot now and staging the assignment for later. The
//! printer must not be disturbed on the slot it is actively extruding
//! from, and a disconnected printer cannot take commands at all; both
//! cases persist the intent and a watcher commits it once telemetry shows
//! the slot writable.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::db::{self, Spool, StagedAssignment};
use crate::error::CoreError;
use crate::events::{AssignmentOutcome, Event, EventBus};
use crate::mqtt::{CommandDispatcher, PrinterCommand, SessionHandle};
use crate::registry::PrinterRegistry;
use crate::state::PrinterState;

/// Material to default nozzle temperature range. The upstream sources
/// disagree among themselves; these are the most common values and are
/// meant to be tuned. Spool-level overrides always win.
const MATERIAL_TEMPS: &[(&str, u32, u32)] = &[
    ("PLA", 190, 230),
    ("PETG", 220, 270),
    ("ABS", 240, 280),
    ("TPU", 200, 250),
    ("PA", 260, 300),
    ("PC", 250, 280),
    ("ASA", 240, 280),
    ("PVA", 190, 230),
];
const DEFAULT_TEMPS: (u32, u32) = (190, 250);

/// Generic Bambu filament profiles per material, the tray_info_idx of last
/// resort when neither a K-profile nor a slicer preset names one.
const MATERIAL_PROFILES: &[(&str, &str)] = &[
    ("PLA", "GFL99"),
    ("PETG", "GFG99"),
    ("ABS", "GFB99"),
    ("TPU", "GFU99"),
    ("PA", "GFN99"),
    ("PC", "GFC99"),
    ("ASA", "GFB98"),
    ("PVA", "GFS99"),
];

/// How often staged assignments are checked against their TTL.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub fn default_temps(material: &str) -> (u32, u32) {
    let upper = material.to_ascii_uppercase();
    MATERIAL_TEMPS
        .iter()
        .find(|(m, _, _)| *m == upper)
        .map(|(_, min, max)| (*min, *max))
        .unwrap_or(DEFAULT_TEMPS)
}

fn default_profile(material: &str) -> Option<&'static str> {
    let upper = material.to_ascii_uppercase();
    MATERIAL_PROFILES
        .iter()
        .find(|(m, _)| *m == upper)
        .map(|(_, profile)| *profile)
}

/// Normalizes a stored color to the 8-hex RGBA the printer expects.
fn normalize_rgba(rgba: Option<&str>) -> String {
    let raw = rgba.unwrap_or("").trim_start_matches('#').to_ascii_uppercase();
    match raw.len() {
        8 if raw.chars().all(|c| c.is_ascii_hexdigit()) => raw,
        6 if raw.chars().all(|c| c.is_ascii_hexdigit()) => format!("{raw}FF"),
        _ => "FFFFFFFF".into(),
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AssignmentRequest {
    pub spool_id: String,
    pub serial: String,
    pub ams_id: u32,
    pub tray_id: u32,
}

pub struct SlotAssigner {
    db: SqlitePool,
    registry: Arc<PrinterRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    bus: Arc<EventBus>,
    ttl_ms: i64,
}

impl SlotAssigner {
    pub fn new(
        db: SqlitePool,
        registry: Arc<PrinterRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        bus: Arc<EventBus>,
        ttl_ms: u64,
    ) -> Self {
        Self {
            db,
            registry,
            dispatcher,
            bus,
            ttl_ms: ttl_ms as i64,
        }
    }

    pub async fn assign(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssignmentOutcome, CoreError> {
        let spool = match db::get_spool(&self.db, &request.spool_id).await? {
            Some(spool) => spool,
            None => {
                let err = CoreError::NotFound(format!("spool {}", request.spool_id));
                self.publish_result(request, AssignmentOutcome::Error, Some(err.to_string()));
                return Err(err);
            }
        };
        let printer = match db::get_printer(&self.db, &request.serial).await? {
            Some(printer) => printer,
            None => {
                let err = CoreError::NotFound(format!("printer {}", request.serial));
                self.publish_result(request, AssignmentOutcome::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        let handle = self.registry.handle(&request.serial).await;
        let snapshot = handle.as_ref().map(|h| h.state_snapshot());

        // A disconnected printer cannot take commands, and a printing one
        // must not be disturbed on its live slot.
        let must_stage = match &snapshot {
            None => true,
            Some(state) if !state.connected => true,
            Some(state) => state.slot_in_active_use(request.ams_id, request.tray_id),
        };
        if must_stage {
            return self.stage(request).await;
        }

        let handle = handle.expect("handle present when not staging");
        let nozzle_diameter = printer.nozzle_diameter.as_deref().unwrap_or("0.4").to_string();
        match self
            .configure(&handle, &spool, request, &nozzle_diameter)
            .await
        {
            Ok(()) => {
                // Any staged intent for this slot is superseded.
                let _ = db::delete_staged(
                    &self.db,
                    &request.serial,
                    request.ams_id as i64,
                    request.tray_id as i64,
                )
                .await;
                self.publish_result(request, AssignmentOutcome::Configured, None);
                Ok(AssignmentOutcome::Configured)
            }
            Err(err) => {
                // No staged state is left behind on a command failure.
                self.publish_result(request, AssignmentOutcome::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Step 4 of the decision rule: filament settings, then the K-profile
    /// when one exists. Both acks required. Serialization against other
    /// commands to the same printer comes from the dispatcher write lock.
    async fn configure(
        &self,
        handle: &SessionHandle,
        spool: &Spool,
        request: &AssignmentRequest,
        nozzle_diameter: &str,
    ) -> Result<(), CoreError> {
        let k_profile =
            db::k_profile_for(&self.db, &spool.id, &request.serial, nozzle_diameter).await?;

        let material = spool.material.to_ascii_uppercase();
        let (default_min, default_max) = default_temps(&material);
        let temp_min = spool.nozzle_temp_min.map(|t| t as u32).unwrap_or(default_min);
        let temp_max = spool.nozzle_temp_max.map(|t| t as u32).unwrap_or(default_max);

        let tray_info_idx = k_profile
            .as_ref()
            .and_then(|k| k.filament_id.clone())
            .or_else(|| spool.slicer_filament.clone())
            .or_else(|| default_profile(&material).map(String::from))
            .unwrap_or_default();

        let reply = self
            .dispatcher
            .send(
                handle,
                PrinterCommand::SetFilament {
                    ams_id: request.ams_id as i32,
                    tray_id: request.tray_id as i32,
                    tray_info_idx: tray_info_idx.clone(),
                    setting_id: k_profile.as_ref().and_then(|k| k.setting_id.clone()),
                    tray_type: material.clone(),
                    tray_color: normalize_rgba(spool.rgba.as_deref()),
                    nozzle_temp_min: temp_min,
                    nozzle_temp_max: temp_max,
                },
            )
            .await?;
        if !reply.success {
            return Err(CoreError::Protocol(format!(
                "ams_filament_setting refused: {}",
                reply.reason.as_deref().unwrap_or("unknown reason")
            )));
        }

        let Some(k_profile) = k_profile else {
            return Ok(());
        };
        let Some(k_value) = k_profile.k_value.clone() else {
            return Ok(());
        };

        let reply = self
            .dispatcher
            .send(
                handle,
                PrinterCommand::SetKProfile {
                    cali_idx: k_profile.cali_idx.unwrap_or(-1),
                    filament_id: k_profile.filament_id.clone().unwrap_or(tray_info_idx),
                    setting_id: k_profile.setting_id.clone().unwrap_or_default(),
                    nozzle_diameter: nozzle_diameter.to_string(),
                    k_value,
                    nozzle_temp: ((temp_min + temp_max) / 2) as i32,
                    ams_id: request.ams_id as i32,
                    tray_id: request.tray_id as i32,
                },
            )
            .await?;
        if !reply.success {
            return Err(CoreError::Protocol(format!(
                "extrusion_cali_set refused: {}",
                reply.reason.as_deref().unwrap_or("unknown reason")
            )));
        }
        Ok(())
    }

    async fn stage(&self, request: &AssignmentRequest) -> Result<AssignmentOutcome, CoreError> {
        let staged = StagedAssignment {
            printer_serial: request.serial.clone(),
            ams_id: request.ams_id as i64,
            tray_id: request.tray_id as i64,
            spool_id: request.spool_id.clone(),
            created_ts: chrono::Utc::now().timestamp_millis(),
            ttl_ms: self.ttl_ms,
        };

        // Writes to the slot's row race with the watcher; one retry covers
        // the transactional conflict.
        let replaced = match db::stage_assignment(&self.db, &staged).await {
            Ok(replaced) => replaced,
            Err(CoreError::Database(_)) => db::stage_assignment(&self.db, &staged).await?,
            Err(e) => return Err(e),
        };

        let outcome = if replaced {
            AssignmentOutcome::StagedReplace
        } else {
            AssignmentOutcome::Staged
        };
        info!(
            serial = %request.serial,
            ams_id = request.ams_id,
            tray_id = request.tray_id,
            spool_id = %request.spool_id,
            replaced,
            "assignment staged"
        );
        self.publish_result(request, outcome, None);
        Ok(outcome)
    }

    pub async fn cancel_staged(
        &self,
        serial: &str,
        ams_id: i64,
        tray_id: i64,
    ) -> Result<(), CoreError> {
        if db::delete_staged(&self.db, serial, ams_id, tray_id).await? {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!(
                "staged assignment for {serial} ams {ams_id} tray {tray_id}"
            )))
        }
    }

    pub async fn list_staged(&self) -> Result<Vec<StagedAssignment>, CoreError> {
        Ok(db::all_staged(&self.db).await?)
    }

    /// Retries the configure step for one staged record. Printer refusals
    /// consume the record; transient failures keep it for the next delta.
    async fn try_commit(&self, staged: &StagedAssignment, state: &PrinterState) {
        let request = AssignmentRequest {
            spool_id: staged.spool_id.clone(),
            serial: staged.printer_serial.clone(),
            ams_id: staged.ams_id as u32,
            tray_id: staged.tray_id as u32,
        };

        if !state.connected || state.slot_in_active_use(request.ams_id, request.tray_id) {
            return;
        }
        let Some(handle) = self.registry.handle(&request.serial).await else {
            return;
        };

        let spool = match db::get_spool(&self.db, &request.spool_id).await {
            Ok(Some(spool)) => spool,
            Ok(None) => {
                let _ = db::delete_staged(&self.db, &staged.printer_serial, staged.ams_id, staged.tray_id).await;
                self.publish_result(
                    &request,
                    AssignmentOutcome::Error,
                    Some(format!("spool {} no longer exists", request.spool_id)),
                );
                return;
            }
            Err(e) => {
                warn!("staged commit lookup failed: {e}");
                return;
            }
        };

        let nozzle_diameter = match db::get_printer(&self.db, &request.serial).await {
            Ok(Some(printer)) => printer.nozzle_diameter.unwrap_or_else(|| "0.4".into()),
            _ => "0.4".into(),
        };

        match self.configure(&handle, &spool, &request, &nozzle_diameter).await {
            Ok(()) => {
                let _ = db::delete_staged(&self.db, &staged.printer_serial, staged.ams_id, staged.tray_id).await;
                info!(
                    serial = %request.serial,
                    ams_id = request.ams_id,
                    tray_id = request.tray_id,
                    "staged assignment committed"
                );
                self.publish_result(&request, AssignmentOutcome::Configured, None);
            }
            Err(CoreError::Protocol(reason)) => {
                let _ = db::delete_staged(&self.db, &staged.printer_serial, staged.ams_id, staged.tray_id).await;
                self.publish_result(&request, AssignmentOutcome::Error, Some(reason));
            }
            Err(e) => {
                // Unavailable/Timeout/Disconnected: try again on a later delta
                debug!(serial = %request.serial, "staged commit deferred: {e}");
            }
        }
    }

    async fn expire_staged(&self) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let staged = match db::all_staged(&self.db).await {
            Ok(staged) => staged,
            Err(e) => {
                warn!("staged expiry sweep failed: {e}");
                return;
            }
        };
        for row in staged.iter().filter(|s| s.expired_at(now_ms)) {
            let _ = db::delete_staged(&self.db, &row.printer_serial, row.ams_id, row.tray_id).await;
            self.publish_result(
                &AssignmentRequest {
                    spool_id: row.spool_id.clone(),
                    serial: row.printer_serial.clone(),
                    ams_id: row.ams_id as u32,
                    tray_id: row.tray_id as u32,
                },
                AssignmentOutcome::Error,
                Some("staged assignment expired".into()),
            );
        }
    }

    fn publish_result(
        &self,
        request: &AssignmentRequest,
        outcome: AssignmentOutcome,
        message: Option<String>,
    ) {
        self.bus.publish(Event::AssignmentResult {
            serial: request.serial.clone(),
            ams_id: request.ams_id,
            tray_id: request.tray_id,
            spool_id: request.spool_id.clone(),
            outcome,
            message,
        });
    }
}

/// Staged-commit watcher: a bus subscriber that filters `printer_state`
/// updates for printers with staged slots and retries the configure step,
/// plus the periodic TTL sweep.
pub fn spawn_staged_watcher(
    assigner: Arc<SlotAssigner>,
    bus: Arc<EventBus>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = bus.watch();
        let mut sweep = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(Event::PrinterState { serial, state, .. }) => {
                        let staged = match db_staged(&assigner, &serial).await {
                            Some(staged) => staged,
                            None => continue,
                        };
                        for row in staged {
                            assigner.try_commit(&row, &state).await;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => assigner.expire_staged().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

async fn db_staged(assigner: &SlotAssigner, serial: &str) -> Option<Vec<StagedAssignment>> {
    match db::staged_for_printer(&assigner.db, serial).await {
        Ok(staged) if staged.is_empty() => None,
        Ok(staged) => Some(staged),
        Err(e) => {
            warn!("staged lookup failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_material_temperature_defaults() {
        assert_eq!(default_temps("PLA"), (190, 230));
        assert_eq!(default_temps("pla"), (190, 230));
        assert_eq!(default_temps("PETG"), (220, 270));
        assert_eq!(default_temps("PA"), (260, 300));
        assert_eq!(default_temps("WOOD"), DEFAULT_TEMPS);
    }

    #[test]
    fn test_default_profiles() {
        assert_eq!(default_profile("PLA"), Some("GFL99"));
        assert_eq!(default_profile("tpu"), Some("GFU99"));
        assert_eq!(default_profile("UNOBTAINIUM"), None);
    }

    #[test]
    fn test_normalize_rgba() {
        assert_eq!(normalize_rgba(Some("FF0000FF")), "FF0000FF");
        assert_eq!(normalize_rgba(Some("#ff0000")), "FF0000FF");
        assert_eq!(normalize_rgba(Some("ff0000")), "FF0000FF");
        assert_eq!(normalize_rgba(Some("not-a-color")), "FFFFFFFF");
        assert_eq!(normalize_rgba(None), "FFFFFFFF");
    }
}
