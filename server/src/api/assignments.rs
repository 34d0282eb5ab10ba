use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};

use crate::AppState;
use crate::db::StagedAssignment;
use crate::error::CoreError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/staged", get(list_staged))
        .route(
            "/staged/{serial}/{ams_id}/{tray_id}",
            axum::routing::delete(cancel_staged),
        )
}

/// GET /api/assignments/staged - All pending staged assignments
async fn list_staged(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<StagedAssignment>>, CoreError> {
    Ok(Json(state.assigner.list_staged().await?))
}

/// DELETE /api/assignments/staged/:serial/:ams_id/:tray_id - User cancel
async fn cancel_staged(
    State(state): State<Arc<AppState>>,
    Path((serial, ams_id, tray_id)): Path<(String, i64, i64)>,
) -> Result<StatusCode, CoreError> {
    state.assigner.cancel_staged(&serial, ams_id, tray_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
