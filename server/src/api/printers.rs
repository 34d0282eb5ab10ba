use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;

use crate::AppState;
use crate::assignment::AssignmentRequest;
use crate::db::Printer;
use crate::error::CoreError;
use crate::events::AssignmentOutcome;
use crate::mqtt::PrinterCommand;
use crate::registry::{PrinterInput, PrinterStatus, PrinterWithStatus};
use crate::state::PrinterState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_printers).post(create_printer))
        .route(
            "/{serial}",
            get(get_printer).put(update_printer).delete(delete_printer),
        )
        .route("/{serial}/connect", post(connect_printer))
        .route("/{serial}/disconnect", post(disconnect_printer))
        .route("/{serial}/auto-connect", post(toggle_auto_connect))
        .route("/{serial}/status", get(printer_status))
        .route("/{serial}/state", get(printer_state))
        .route("/{serial}/assign-slot", post(assign_slot))
        .route("/{serial}/read-rfid", post(read_rfid))
}

/// GET /api/printers - List all printers with connection status
async fn list_printers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PrinterWithStatus>>, CoreError> {
    Ok(Json(state.registry.list().await?))
}

/// GET /api/printers/:serial - Get a single printer
async fn get_printer(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<Json<PrinterWithStatus>, CoreError> {
    let printers = state.registry.list().await?;
    printers
        .into_iter()
        .find(|p| p.printer.serial == serial)
        .map(Json)
        .ok_or_else(|| CoreError::NotFound(format!("printer {serial}")))
}

/// POST /api/printers - Create a printer (or merge into an existing one)
async fn create_printer(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PrinterInput>,
) -> Result<(StatusCode, Json<Printer>), CoreError> {
    let printer = state.registry.add(input).await?;
    Ok((StatusCode::CREATED, Json(printer)))
}

/// PUT /api/printers/:serial - Update a printer
async fn update_printer(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Json(input): Json<PrinterInput>,
) -> Result<Json<Printer>, CoreError> {
    Ok(Json(state.registry.update(&serial, input).await?))
}

/// DELETE /api/printers/:serial - Delete a printer (disconnects first)
async fn delete_printer(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<StatusCode, CoreError> {
    state.registry.remove(&serial).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/printers/:serial/connect - Start the printer session
async fn connect_printer(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<StatusCode, CoreError> {
    tracing::info!(serial = %serial, "connect request");
    state.registry.connect(&serial).await?;
    Ok(StatusCode::OK)
}

/// POST /api/printers/:serial/disconnect - Stop the printer session
async fn disconnect_printer(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> StatusCode {
    tracing::info!(serial = %serial, "disconnect request");
    state.registry.disconnect(&serial).await;
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
pub struct AutoConnectRequest {
    pub auto_connect: bool,
}

/// POST /api/printers/:serial/auto-connect - Toggle auto-connect
async fn toggle_auto_connect(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Json(request): Json<AutoConnectRequest>,
) -> Result<Json<Printer>, CoreError> {
    let input = PrinterInput {
        serial: serial.clone(),
        name: None,
        model: None,
        ip_address: None,
        access_code: None,
        auto_connect: Some(request.auto_connect),
        dual_nozzle: None,
        nozzle_diameter: None,
    };
    Ok(Json(state.registry.update(&serial, input).await?))
}

/// GET /api/printers/:serial/status - Session status
async fn printer_status(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Json<PrinterStatus> {
    Json(state.registry.get_status(&serial).await)
}

/// GET /api/printers/:serial/state - Current telemetry snapshot
async fn printer_state(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
) -> Result<Json<PrinterState>, CoreError> {
    state
        .registry
        .state_snapshot(&serial)
        .await
        .map(Json)
        .ok_or(CoreError::Unavailable(serial))
}

#[derive(Debug, Deserialize)]
pub struct AssignSlotRequest {
    pub spool_id: String,
    pub ams_id: u32,
    pub tray_id: u32,
}

/// POST /api/printers/:serial/assign-slot - Run the slot-assignment
/// workflow for a spool
async fn assign_slot(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Json(request): Json<AssignSlotRequest>,
) -> Result<Json<AssignmentOutcome>, CoreError> {
    let outcome = state
        .assigner
        .assign(&AssignmentRequest {
            spool_id: request.spool_id,
            serial,
            ams_id: request.ams_id,
            tray_id: request.tray_id,
        })
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ReadRfidRequest {
    pub ams_id: i32,
    pub tray_id: i32,
}

/// POST /api/printers/:serial/read-rfid - Trigger an RFID re-read
async fn read_rfid(
    State(state): State<Arc<AppState>>,
    Path(serial): Path<String>,
    Json(request): Json<ReadRfidRequest>,
) -> Result<StatusCode, CoreError> {
    let handle = state
        .registry
        .handle(&serial)
        .await
        .ok_or_else(|| CoreError::Unavailable(serial.clone()))?;
    state
        .dispatcher
        .send(
            &handle,
            PrinterCommand::ReadRfid {
                ams_id: request.ams_id,
                tray_id: request.tray_id,
            },
        )
        .await?;
    Ok(StatusCode::OK)
}
