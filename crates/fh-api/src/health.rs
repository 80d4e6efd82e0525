//! Health-score compute/explain routes (`spec.md` §4.11, §6).

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::Utc;
use fh_types::{BusinessId, FhError};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /api/health_score/{business_id}`.
pub async fn score(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<fh_health_score::HealthScore>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let score = fh_health_score::compute_score_for_business(&mut conn, BusinessId(business_id), Utc::now()).await?;
    Ok(Json(score))
}

#[derive(Deserialize, Default)]
pub struct ExplainChangeParams {
    since_hours: Option<i64>,
    limit: Option<usize>,
}

/// `GET /api/health_score/{business_id}/explain_change`.
pub async fn explain_change(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<ExplainChangeParams>,
) -> ApiResult<Json<fh_health_score::ChangeExplanation>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let explanation = fh_health_score::explain_change(
        &mut conn,
        BusinessId(business_id),
        params.since_hours.unwrap_or(24),
        params.limit.unwrap_or(10),
        Utc::now(),
    )
    .await?;
    Ok(Json(explanation))
}
