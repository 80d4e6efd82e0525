//! Tick orchestration routes (`spec.md` §4.12, §6).

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::Utc;
use fh_types::{BusinessId, FhError};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize, Default)]
pub struct TickParams {
    bucket: Option<String>,
    apply_recompute: Option<bool>,
    materialize_work: Option<bool>,
    limit_cases: Option<usize>,
}

/// `POST /api/system/tick/{business_id}`.
pub async fn run_tick(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<TickParams>,
) -> ApiResult<Json<fh_tick::TickResult>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let result = fh_tick::run_tick(
        &mut tx,
        business_id,
        params.bucket,
        params.apply_recompute.unwrap_or(true),
        params.materialize_work.unwrap_or(true),
        params.limit_cases,
        now,
    )
    .await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(result))
}

#[derive(Serialize)]
pub struct LastTickResponse {
    bucket: String,
    started_at: chrono::DateTime<Utc>,
    finished_at: Option<chrono::DateTime<Utc>>,
}

/// `GET /api/system/last-tick/{business_id}`: the most recently started
/// `tick_run` row, finished or not.
pub async fn last_tick(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<Option<LastTickResponse>>> {
    let row = sqlx::query("SELECT bucket, started_at, finished_at FROM tick_run WHERE business_id = $1 ORDER BY started_at DESC LIMIT 1")
        .bind(business_id)
        .fetch_optional(state.db.pool())
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

    let Some(row) = row else { return Ok(Json(None)) };
    Ok(Json(Some(LastTickResponse {
        bucket: row.try_get("bucket").map_err(|e| FhError::Storage(e.to_string()))?,
        started_at: row.try_get("started_at").map_err(|e| FhError::Storage(e.to_string()))?,
        finished_at: row.try_get("finished_at").map_err(|e| FhError::Storage(e.to_string()))?,
    })))
}
