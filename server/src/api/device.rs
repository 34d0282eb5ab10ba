use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::CoreError;
use crate::websocket::DeviceCommand;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(device_status))
        .route("/tare", post(tare_scale))
        .route("/calibrate", post(calibrate_scale))
        .route("/write-tag", post(write_tag))
        .route("/notify", post(notify))
}

#[derive(Debug, Serialize)]
pub struct DeviceStatus {
    connected: bool,
    last_weight: Option<f64>,
    weight_stable: bool,
    current_tag_id: Option<String>,
}

/// GET /api/device/status - Device connection status
async fn device_status(State(state): State<Arc<AppState>>) -> Json<DeviceStatus> {
    let (_, snapshot) = state.bus.subscribe();
    Json(DeviceStatus {
        connected: snapshot.device.connected,
        last_weight: snapshot.device.last_weight,
        weight_stable: snapshot.device.weight_stable,
        current_tag_id: snapshot.device.current_tag_id,
    })
}

async fn send_to_device(state: &AppState, command: DeviceCommand) -> Result<(), CoreError> {
    let sender = state
        .device
        .command_sender()
        .await
        .ok_or_else(|| CoreError::Unavailable("device".into()))?;
    sender
        .send(command)
        .await
        .map_err(|_| CoreError::Unavailable("device".into()))
}

/// POST /api/device/tare - Tare the scale
async fn tare_scale(State(state): State<Arc<AppState>>) -> Result<StatusCode, CoreError> {
    send_to_device(&state, DeviceCommand::TareScale).await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct CalibrateRequest {
    pub known_weight: f64,
}

/// POST /api/device/calibrate - Calibrate the scale with a known weight
async fn calibrate_scale(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CalibrateRequest>,
) -> Result<StatusCode, CoreError> {
    send_to_device(
        &state,
        DeviceCommand::CalibrateScale {
            known_weight: request.known_weight,
        },
    )
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct WriteTagRequest {
    pub spool_id: String,
}

/// POST /api/device/write-tag - Encode the current tag with a spool
async fn write_tag(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WriteTagRequest>,
) -> Result<StatusCode, CoreError> {
    let spool = crate::db::get_spool(&state.db, &request.spool_id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("spool {}", request.spool_id)))?;

    send_to_device(
        &state,
        DeviceCommand::WriteTag {
            request_id: uuid::Uuid::new_v4().to_string(),
            data: serde_json::to_value(&spool).unwrap_or_default(),
        },
    )
    .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct NotifyRequest {
    pub message: String,
    pub duration_ms: Option<u32>,
}

/// POST /api/device/notify - Show a message on the device display
async fn notify(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NotifyRequest>,
) -> Result<StatusCode, CoreError> {
    send_to_device(
        &state,
        DeviceCommand::Notify {
            message: request.message,
            duration_ms: request.duration_ms.unwrap_or(3000),
        },
    )
    .await?;
    Ok(StatusCode::OK)
}
