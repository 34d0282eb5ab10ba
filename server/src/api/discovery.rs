use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, extract::State, routing::post};
use serde::Deserialize;

use crate::AppState;
use crate::discovery::DiscoveredPrinter;
use crate::error::CoreError;

const DEFAULT_SCAN_MS: u64 = 5000;
const MAX_SCAN_MS: u64 = 60_000;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/scan", post(scan))
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub timeout_ms: Option<u64>,
}

/// POST /api/discovery/scan - Listen for printers on the LAN for a bounded
/// window and return the candidates heard from
async fn scan(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<Vec<DiscoveredPrinter>>, CoreError> {
    let timeout_ms = request.timeout_ms.unwrap_or(DEFAULT_SCAN_MS).min(MAX_SCAN_MS);
    let printers = state
        .registry
        .discover(Duration::from_millis(timeout_ms))
        .await?;
    Ok(Json(printers))
}
