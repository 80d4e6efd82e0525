//! Signal list/status/explain routes (`spec.md` §4.5, §4.6, §6).

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use fh_types::{BusinessId, FhError, SignalId, SignalStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Serialize)]
pub struct SignalDto {
    signal_id: String,
    signal_type: String,
    status: String,
    severity: String,
    title: String,
    summary: String,
    payload: Value,
    detected_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

fn status_str(status: SignalStatus) -> &'static str {
    match status {
        SignalStatus::Open => "open",
        SignalStatus::InProgress => "in_progress",
        SignalStatus::Resolved => "resolved",
        SignalStatus::Ignored => "ignored",
    }
}

fn severity_str(severity: fh_types::Severity) -> &'static str {
    match severity {
        fh_types::Severity::Info => "info",
        fh_types::Severity::Low => "low",
        fh_types::Severity::Medium => "medium",
        fh_types::Severity::Warning => "warning",
        fh_types::Severity::High => "high",
        fh_types::Severity::Critical => "critical",
    }
}

impl From<&fh_signals::HealthSignalState> for SignalDto {
    fn from(row: &fh_signals::HealthSignalState) -> Self {
        SignalDto {
            signal_id: row.signal_id.0.clone(),
            signal_type: row.signal_type.clone(),
            status: status_str(row.status).to_string(),
            severity: severity_str(row.severity).to_string(),
            title: row.title.clone(),
            summary: row.summary.clone(),
            payload: row.payload_json.clone(),
            detected_at: row.detected_at,
            last_seen_at: row.last_seen_at,
            resolved_at: row.resolved_at,
            updated_at: row.updated_at,
        }
    }
}

/// `GET /api/signals/{business_id}`: every persisted signal, open and
/// resolved alike — callers filter client-side.
pub async fn list(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SignalDto>>> {
    let business_id = BusinessId(business_id);
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let rows = fh_signals::SignalRepo::fetch_all(&mut conn, business_id).await?;
    Ok(Json(rows.iter().map(SignalDto::from).collect()))
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    status: String,
}

fn parse_status(s: &str) -> ApiResult<SignalStatus> {
    match s {
        "open" => Ok(SignalStatus::Open),
        "in_progress" => Ok(SignalStatus::InProgress),
        "resolved" => Ok(SignalStatus::Resolved),
        "ignored" => Ok(SignalStatus::Ignored),
        other => Err(FhError::Validation(format!("unknown signal status {other}")).into()),
    }
}

/// `POST /api/signals/{business_id}/{signal_id}/status`.
pub async fn update_status(
    State(state): State<AppState>,
    Path((business_id, signal_id)): Path<(Uuid, String)>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<Json<SignalDto>> {
    let business_id = BusinessId(business_id);
    let signal_id = SignalId(signal_id);
    let next = parse_status(&body.status)?;
    let now = Utc::now();

    let mut tx = state.db.begin().await?;
    let row = fh_signals::SignalRepo::fetch_one(&mut tx, business_id, &signal_id)
        .await?
        .ok_or_else(|| FhError::NotFound(format!("signal {} not found", signal_id.0)))?;
    let (updated, audit) = fh_signals::update_status(row, next, now);
    fh_signals::SignalRepo::upsert(&mut tx, &updated).await?;
    fh_audit::log_audit_event(&mut tx, business_id, audit.kind, audit.before, Some(audit.after), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;

    Ok(Json(SignalDto::from(&updated)))
}

#[derive(Serialize)]
pub struct AnchorVerification {
    anchor_key: String,
    evidence_key: String,
    recorded_value: Option<f64>,
    recomputed_value: f64,
    matches: bool,
}

#[derive(Serialize)]
pub struct ExplainResponse {
    signal: SignalDto,
    anchors: Vec<AnchorVerification>,
}

/// `GET /api/signals/{business_id}/{signal_id}/explain`: re-runs each of the
/// signal's `ledger_anchors` queries against the current projection and
/// compares the recomputed total against the value recorded in the
/// signal's payload at detection time (`spec.md` §8's ledger-anchor
/// reproducibility property).
pub async fn explain(
    State(state): State<AppState>,
    Path((business_id, signal_id)): Path<(Uuid, String)>,
) -> ApiResult<Json<ExplainResponse>> {
    let business_id = BusinessId(business_id);
    let signal_id = SignalId(signal_id);

    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let row = fh_signals::SignalRepo::fetch_one(&mut conn, business_id, &signal_id)
        .await?
        .ok_or_else(|| FhError::NotFound(format!("signal {} not found", signal_id.0)))?;

    let raw = fh_raw_events::RawEventRepo::fetch_all(&mut conn, business_id, None).await?;
    let (txns, _errors) = fh_projection::project(&raw);

    let mut anchors = Vec::new();
    let empty = Vec::new();
    let declared_anchors = row.payload_json.get("ledger_anchors").and_then(Value::as_array).unwrap_or(&empty);
    for anchor in declared_anchors {
        let anchor_key = anchor.get("anchor_key").and_then(Value::as_str).unwrap_or("").to_string();
        let start = anchor
            .get("query")
            .and_then(|q| q.get("start"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let end = anchor
            .get("query")
            .and_then(|q| q.get("end"))
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let direction = anchor
            .get("query")
            .and_then(|q| q.get("direction"))
            .and_then(Value::as_str)
            .map(|d| match d {
                "inflow" => fh_types::Direction::Inflow,
                _ => fh_types::Direction::Outflow,
            });
        let merchant_keys = anchor
            .get("query")
            .and_then(|q| q.get("merchant_keys"))
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect::<Vec<_>>());

        let (Some(start), Some(end)) = (start, end) else { continue };
        let filters = fh_ledger::LedgerFilters {
            direction,
            merchant_keys,
            source_event_ids: None,
        };
        let result = fh_ledger::ledger_query(&txns, start, end, &filters, None, 0);
        let recomputed = match direction {
            Some(fh_types::Direction::Inflow) => result.summary.total_in.to_f64(),
            _ => result.summary.total_out.to_f64(),
        };

        let evidence_keys = anchor.get("evidence_keys").and_then(Value::as_array).cloned().unwrap_or_default();
        for evidence_key in evidence_keys {
            let Some(evidence_key) = evidence_key.as_str() else { continue };
            let recorded_value = row.payload_json.get(evidence_key).and_then(Value::as_f64);
            let matches = recorded_value.is_some_and(|v| (v - recomputed).abs() < 0.01);
            anchors.push(AnchorVerification {
                anchor_key: anchor_key.clone(),
                evidence_key: evidence_key.to_string(),
                recorded_value,
                recomputed_value: recomputed,
                matches,
            });
        }
    }

    Ok(Json(ExplainResponse {
        signal: SignalDto::from(&row),
        anchors,
    }))
}
