//! Slot-assignment workflow scenarios over an injected transport.
//!
//! The printer side of each session handle is scripted: a responder task
//! reads published command payloads and acknowledges their sequence ids
//! the way a real printer echoes them in its report stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use spoolbuddy_server::assignment::{AssignmentRequest, SlotAssigner, spawn_staged_watcher};
use spoolbuddy_server::db;
use spoolbuddy_server::events::{AssignmentOutcome, Event, EventBus};
use spoolbuddy_server::mqtt::{
    CommandDispatcher, SessionChannels, SessionHandle, SessionSettings, SessionStatus,
};
use spoolbuddy_server::registry::PrinterRegistry;
use spoolbuddy_server::state::PrinterState;
use spoolbuddy_server::state::reducer::CommandEcho;
use spoolbuddy_server::mqtt::bambu_api::GcodeState;

struct Core {
    db: sqlx::SqlitePool,
    bus: Arc<EventBus>,
    dispatcher: Arc<CommandDispatcher>,
    registry: Arc<PrinterRegistry>,
    assigner: Arc<SlotAssigner>,
}

async fn core() -> Core {
    let db = db::connect("sqlite::memory:").await.unwrap();
    db::migrate(&db).await.unwrap();

    let bus = Arc::new(EventBus::new(256));
    let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_millis(500)));
    let settings = SessionSettings {
        mqtt_port: 8883,
        mqtt_user: "bblp".into(),
        reconnect_min: Duration::from_millis(1000),
        reconnect_max: Duration::from_millis(60000),
        pushall_min_interval: Duration::from_millis(2000),
    };
    let registry = Arc::new(PrinterRegistry::new(
        db.clone(),
        bus.clone(),
        dispatcher.clone(),
        settings,
    ));
    let assigner = Arc::new(SlotAssigner::new(
        db.clone(),
        registry.clone(),
        dispatcher.clone(),
        bus.clone(),
        3_600_000,
    ));

    sqlx::query(
        "INSERT INTO printers (serial, name, ip_address, access_code) \
         VALUES ('00M09A123456789', 'Test', '192.168.1.100', 'code')",
    )
    .execute(&db)
    .await
    .unwrap();

    for (id, material, rgba) in [
        ("s1", "PLA", "FF0000FF"),
        ("s2", "PETG", "00FF00FF"),
        ("s3", "ABS", "0000FFFF"),
    ] {
        sqlx::query("INSERT INTO spools (id, material, rgba) VALUES (?, ?, ?)")
            .bind(id)
            .bind(material)
            .bind(rgba)
            .execute(&db)
            .await
            .unwrap();
    }

    // K-profile for s1 on the test printer
    sqlx::query(
        "INSERT INTO k_profiles (spool_id, printer_serial, nozzle_diameter, filament_id, \
         k_value, cali_idx, setting_id) \
         VALUES ('s1', '00M09A123456789', '0.4', 'GFL99', '0.025', 7, 'PS001')",
    )
    .execute(&db)
    .await
    .unwrap();

    Core {
        db,
        bus,
        dispatcher,
        registry,
        assigner,
    }
}

const SERIAL: &str = "00M09A123456789";

fn idle_state() -> PrinterState {
    PrinterState {
        connected: true,
        gcode_state: GcodeState::IDLE,
        ..Default::default()
    }
}

fn printing_state(tray_now: i32) -> PrinterState {
    PrinterState {
        connected: true,
        gcode_state: GcodeState::RUNNING,
        tray_now: Some(tray_now),
        subtask_name: "job.gcode".into(),
        ..Default::default()
    }
}

/// Plays the printer: acks every published command and records its wire
/// payloads.
fn spawn_responder(
    mut channels: SessionChannels,
    dispatcher: Arc<CommandDispatcher>,
) -> mpsc::UnboundedReceiver<serde_json::Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(payload) = channels.outbound_rx.recv().await {
            let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
            let print = &value["print"];
            let sequence_id: u64 = print["sequence_id"].as_str().unwrap().parse().unwrap();
            let command = print["command"].as_str().unwrap().to_string();
            let _ = tx.send(value.clone());
            dispatcher.complete(&CommandEcho {
                sequence_id,
                command,
                success: true,
                reason: None,
            });
        }
    });
    rx
}

async fn attach_printer(core: &Core, state: PrinterState) -> mpsc::UnboundedReceiver<serde_json::Value> {
    let (handle, mut channels) = SessionHandle::channel(SERIAL, 32);
    channels.set_status(SessionStatus::Connected);
    channels.set_state(state);
    core.registry.adopt_session(SERIAL, handle).await;
    spawn_responder(channels, core.dispatcher.clone())
}

#[tokio::test]
async fn test_configure_while_idle() {
    let core = core().await;
    let mut wire = attach_printer(&core, idle_state()).await;

    let outcome = core
        .assigner
        .assign(&AssignmentRequest {
            spool_id: "s1".into(),
            serial: SERIAL.into(),
            ams_id: 0,
            tray_id: 0,
        })
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::Configured);

    // First command: filament settings with color and temperature range
    let first = wire.recv().await.unwrap();
    assert_eq!(first["print"]["command"], "ams_filament_setting");
    assert_eq!(first["print"]["tray_color"], "FF0000FF");
    assert_eq!(first["print"]["nozzle_temp_min"], 190);
    assert_eq!(first["print"]["nozzle_temp_max"], 230);
    assert_eq!(first["print"]["tray_info_idx"], "GFL99");

    // Second command: the stored K-profile
    let second = wire.recv().await.unwrap();
    assert_eq!(second["print"]["command"], "extrusion_cali_set");
    assert_eq!(second["print"]["cali_idx"], 7);
    assert_eq!(second["print"]["k_value"], "0.025");

    // No staged row was created
    assert!(db::all_staged(&core.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stage_during_print_then_commit_on_finish() {
    let core = core().await;
    let mut wire = attach_printer(&core, printing_state(0)).await;
    let mut events = core.bus.watch();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_staged_watcher(core.assigner.clone(), core.bus.clone(), shutdown_rx);

    // Target slot is the active one mid-print: must stage, nothing on wire
    let outcome = core
        .assigner
        .assign(&AssignmentRequest {
            spool_id: "s2".into(),
            serial: SERIAL.into(),
            ams_id: 0,
            tray_id: 0,
        })
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::Staged);
    assert!(wire.try_recv().is_err());

    let staged = db::all_staged(&core.db).await.unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].spool_id, "s2");

    // Print finishes: the watcher sees the delta and fires the commands
    let finished = PrinterState {
        connected: true,
        gcode_state: GcodeState::FINISH,
        ..Default::default()
    };
    core.bus.publish(Event::PrinterState {
        serial: SERIAL.into(),
        state: Arc::new(finished),
        deltas: vec![].into(),
        snapshot: false,
    });

    let first = tokio::time::timeout(Duration::from_secs(2), wire.recv())
        .await
        .expect("staged commit should publish")
        .unwrap();
    assert_eq!(first["print"]["command"], "ams_filament_setting");

    // Configured result lands on the bus and the staged row is gone
    let result = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(Event::AssignmentResult { outcome, .. }) = events.recv().await {
                if outcome == AssignmentOutcome::Configured {
                    return outcome;
                }
            }
        }
    })
    .await
    .expect("configured result expected");
    assert_eq!(result, AssignmentOutcome::Configured);

    // Deletion races the event by a hair; poll briefly
    let mut remaining = db::all_staged(&core.db).await.unwrap();
    for _ in 0..20 {
        if remaining.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        remaining = db::all_staged(&core.db).await.unwrap();
    }
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn test_stage_replace_keeps_single_row() {
    let core = core().await;
    // No session adopted: the printer is disconnected, everything stages

    let outcome = core
        .assigner
        .assign(&AssignmentRequest {
            spool_id: "s2".into(),
            serial: SERIAL.into(),
            ams_id: 0,
            tray_id: 0,
        })
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::Staged);

    let outcome = core
        .assigner
        .assign(&AssignmentRequest {
            spool_id: "s3".into(),
            serial: SERIAL.into(),
            ams_id: 0,
            tray_id: 0,
        })
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::StagedReplace);

    let staged = db::all_staged(&core.db).await.unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].spool_id, "s3");
}

#[tokio::test]
async fn test_unknown_spool_is_error() {
    let core = core().await;
    let err = core
        .assigner
        .assign(&AssignmentRequest {
            spool_id: "missing".into(),
            serial: SERIAL.into(),
            ams_id: 0,
            tray_id: 0,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
    assert!(db::all_staged(&core.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_assign_to_inactive_slot_during_print() {
    // Printing on tray 0 does not block configuring tray 2
    let core = core().await;
    let mut wire = attach_printer(&core, printing_state(0)).await;

    let outcome = core
        .assigner
        .assign(&AssignmentRequest {
            spool_id: "s2".into(),
            serial: SERIAL.into(),
            ams_id: 0,
            tray_id: 2,
        })
        .await
        .unwrap();
    assert_eq!(outcome, AssignmentOutcome::Configured);

    let first = wire.recv().await.unwrap();
    assert_eq!(first["print"]["command"], "ams_filament_setting");
    assert_eq!(first["print"]["tray_id"], 2);
}
