use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};

use crate::AppState;
use crate::db::{Spool, SpoolInput};
use crate::error::CoreError;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_spools).post(create_spool))
        .route(
            "/{id}",
            get(get_spool).put(update_spool).delete(delete_spool),
        )
}

/// GET /api/spools - List all spools
async fn list_spools(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Spool>>, CoreError> {
    let spools = sqlx::query_as::<_, Spool>("SELECT * FROM spools ORDER BY created_at DESC")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(spools))
}

/// GET /api/spools/:id - Get a single spool
async fn get_spool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Spool>, CoreError> {
    crate::db::get_spool(&state.db, &id)
        .await?
        .map(Json)
        .ok_or_else(|| CoreError::NotFound(format!("spool {id}")))
}

/// POST /api/spools - Create a spool
async fn create_spool(
    State(state): State<Arc<AppState>>,
    Json(input): Json<SpoolInput>,
) -> Result<(StatusCode, Json<Spool>), CoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO spools (id, tag_id, material, subtype, color_name, rgba, brand,
                            label_weight, core_weight, weight_current, slicer_filament,
                            nozzle_temp_min, nozzle_temp_max, note, tag_type)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&input.tag_id)
    .bind(&input.material)
    .bind(&input.subtype)
    .bind(&input.color_name)
    .bind(&input.rgba)
    .bind(&input.brand)
    .bind(input.label_weight)
    .bind(input.core_weight)
    .bind(input.weight_current)
    .bind(&input.slicer_filament)
    .bind(input.nozzle_temp_min)
    .bind(input.nozzle_temp_max)
    .bind(&input.note)
    .bind(&input.tag_type)
    .execute(&state.db)
    .await
    .map_err(|e| {
        if e.to_string().contains("UNIQUE constraint failed") {
            CoreError::Conflict(format!("tag {:?}", input.tag_id))
        } else {
            CoreError::Database(e)
        }
    })?;

    let spool = crate::db::get_spool(&state.db, &id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("spool {id}")))?;
    Ok((StatusCode::CREATED, Json(spool)))
}

/// PUT /api/spools/:id - Update a spool
async fn update_spool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<SpoolInput>,
) -> Result<Json<Spool>, CoreError> {
    let result = sqlx::query(
        r#"
        UPDATE spools SET
            tag_id = COALESCE(?, tag_id),
            material = ?,
            subtype = COALESCE(?, subtype),
            color_name = COALESCE(?, color_name),
            rgba = COALESCE(?, rgba),
            brand = COALESCE(?, brand),
            label_weight = COALESCE(?, label_weight),
            core_weight = COALESCE(?, core_weight),
            weight_current = COALESCE(?, weight_current),
            slicer_filament = COALESCE(?, slicer_filament),
            nozzle_temp_min = COALESCE(?, nozzle_temp_min),
            nozzle_temp_max = COALESCE(?, nozzle_temp_max),
            note = COALESCE(?, note),
            tag_type = COALESCE(?, tag_type),
            updated_at = strftime('%s', 'now')
        WHERE id = ?
        "#,
    )
    .bind(&input.tag_id)
    .bind(&input.material)
    .bind(&input.subtype)
    .bind(&input.color_name)
    .bind(&input.rgba)
    .bind(&input.brand)
    .bind(input.label_weight)
    .bind(input.core_weight)
    .bind(input.weight_current)
    .bind(&input.slicer_filament)
    .bind(input.nozzle_temp_min)
    .bind(input.nozzle_temp_max)
    .bind(&input.note)
    .bind(&input.tag_type)
    .bind(&id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!("spool {id}")));
    }

    let spool = crate::db::get_spool(&state.db, &id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("spool {id}")))?;
    Ok(Json(spool))
}

/// DELETE /api/spools/:id - Delete a spool
async fn delete_spool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CoreError> {
    let result = sqlx::query("DELETE FROM spools WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;
    if result.rows_affected() == 0 {
        return Err(CoreError::NotFound(format!("spool {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
