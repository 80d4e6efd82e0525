//! Pulse monitoring coordinator routes (`spec.md` §4.13, §6).

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::Utc;
use fh_types::{BusinessId, FhError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /monitor/status/{business_id}`.
pub async fn status(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<Option<fh_tick::MonitorStatus>>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let status = fh_tick::monitor_status(&mut conn, BusinessId(business_id)).await?;
    Ok(Json(status))
}

#[derive(Deserialize, Default)]
pub struct PulseParams {
    force: Option<bool>,
}

#[derive(Serialize)]
pub struct DiagnosticDto {
    detector: &'static str,
    ran: bool,
    skipped_reason: Option<String>,
    fired: bool,
    evidence_keys: Vec<String>,
}

impl From<&fh_detectors::DetectorDiagnostic> for DiagnosticDto {
    fn from(d: &fh_detectors::DetectorDiagnostic) -> Self {
        DiagnosticDto {
            detector: d.detector,
            ran: d.ran,
            skipped_reason: d.skipped_reason.clone(),
            fired: d.fired,
            evidence_keys: d.evidence_keys.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct PulseResponse {
    ran: bool,
    skipped_reason: Option<String>,
    signals_reconciled: usize,
    diagnostics: Vec<DiagnosticDto>,
}

/// `POST /monitor/pulse/{business_id}`.
pub async fn pulse(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<PulseParams>,
) -> ApiResult<Json<PulseResponse>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let outcome = fh_tick::pulse(&mut tx, business_id, now, params.force.unwrap_or(false)).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(PulseResponse {
        ran: outcome.ran,
        skipped_reason: outcome.skipped_reason,
        signals_reconciled: outcome.signals_reconciled,
        diagnostics: outcome.diagnostics.iter().map(DiagnosticDto::from).collect(),
    }))
}
