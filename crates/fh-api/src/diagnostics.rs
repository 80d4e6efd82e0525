//! Composed diagnostics views (`spec.md` §6), not backed by a dedicated
//! engine-crate function — each handler assembles its view directly from
//! a handful of tables the existing services already own.

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use fh_types::{BusinessId, FhError};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Serialize)]
pub struct IntegrationStatusDto {
    provider: String,
    status: String,
    last_sync_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    integrations: Vec<IntegrationStatusDto>,
    open_signal_count: usize,
    active_case_count: usize,
    open_work_item_count: usize,
    monitor: Option<fh_tick::MonitorStatus>,
}

/// `GET /api/diagnostics/status/{business_id}`: a single-call operational
/// snapshot for a business — integration health, open signal/case/work
/// counts, and the monitoring coordinator's cursor state.
pub async fn status(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<StatusResponse>> {
    let business_id = BusinessId(business_id);
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;

    let rows = sqlx::query("SELECT provider, status, last_sync_at, last_error, last_error_at FROM integration_connection WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let integrations = rows
        .into_iter()
        .map(|row| {
            Ok(IntegrationStatusDto {
                provider: row.try_get("provider").map_err(|e| FhError::Storage(e.to_string()))?,
                status: row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?,
                last_sync_at: row.try_get("last_sync_at").map_err(|e| FhError::Storage(e.to_string()))?,
                last_error: row.try_get("last_error").map_err(|e| FhError::Storage(e.to_string()))?,
                last_error_at: row.try_get("last_error_at").map_err(|e| FhError::Storage(e.to_string()))?,
            })
        })
        .collect::<Result<Vec<_>, FhError>>()?;

    let open_signal_count = fh_signals::SignalRepo::fetch_all(&mut conn, business_id)
        .await?
        .into_iter()
        .filter(|s| s.status == fh_types::SignalStatus::Open)
        .count();
    let active_case_count = fh_cases::CaseRepo::list_active_for_business(&mut conn, business_id).await?.len();
    let open_work_item_count = fh_work::WorkItemRepo::list_for_business(&mut conn, business_id)
        .await?
        .into_iter()
        .filter(|w| w.status == fh_types::WorkItemStatus::Open)
        .count();
    let monitor = fh_tick::monitor_status(&mut conn, business_id).await?;

    Ok(Json(StatusResponse {
        integrations,
        open_signal_count,
        active_case_count,
        open_work_item_count,
        monitor,
    }))
}

#[derive(Serialize)]
pub struct IngestionDiagnostics {
    raw_event_count: usize,
    posted_txn_count: usize,
    projection_error_count: usize,
    projection_errors: Vec<ProjectionErrorDto>,
    uncategorized_count: usize,
}

#[derive(Serialize)]
pub struct ProjectionErrorDto {
    source_event_id: String,
    error_code: String,
    error_detail: String,
}

/// `GET /api/diagnostics/ingestion/{business_id}`: raw-event and projection
/// health, plus the uncategorized-transaction backlog `fh-actions` would
/// otherwise surface only as a `fix_mapping` action.
pub async fn ingestion(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<IngestionDiagnostics>> {
    let business_id = BusinessId(business_id);
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;

    let raw = fh_raw_events::RawEventRepo::fetch_all(&mut conn, business_id, None).await?;
    let raw_event_count = raw.len();
    let (txns, errors) = fh_projection::project(&raw);

    let uncategorized_row = sqlx::query("SELECT count(*) AS count FROM processing_event_state WHERE business_id = $1 AND status = 'normalized'")
        .bind(business_id.0)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let uncategorized_count: i64 = uncategorized_row.try_get("count").map_err(|e| FhError::Storage(e.to_string()))?;

    Ok(Json(IngestionDiagnostics {
        raw_event_count,
        posted_txn_count: txns.len(),
        projection_error_count: errors.len(),
        projection_errors: errors
            .iter()
            .map(|e| ProjectionErrorDto {
                source_event_id: e.source_event_id.clone(),
                error_code: e.error_code.clone(),
                error_detail: e.error_detail.clone(),
            })
            .collect(),
        uncategorized_count: uncategorized_count as usize,
    }))
}
