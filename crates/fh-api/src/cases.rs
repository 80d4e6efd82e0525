//! Case list/detail/timeline/status/anchor routes (`spec.md` §4.7, §6).

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use fh_types::{BusinessId, CaseId, CaseStatus, FhError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::{AppState, CallerIdentity};

fn domain_str(domain: fh_types::Domain) -> &'static str {
    match domain {
        fh_types::Domain::Liquidity => "liquidity",
        fh_types::Domain::Revenue => "revenue",
        fh_types::Domain::Expense => "expense",
        fh_types::Domain::Timing => "timing",
        fh_types::Domain::Concentration => "concentration",
        fh_types::Domain::Hygiene => "hygiene",
        fh_types::Domain::Unknown => "unknown",
    }
}

fn status_str(status: CaseStatus) -> &'static str {
    match status {
        CaseStatus::Open => "open",
        CaseStatus::Monitoring => "monitoring",
        CaseStatus::Escalated => "escalated",
        CaseStatus::Resolved => "resolved",
        CaseStatus::Dismissed => "dismissed",
        CaseStatus::Reopened => "reopened",
    }
}

fn parse_status(s: &str) -> ApiResult<CaseStatus> {
    Ok(match s {
        "open" => CaseStatus::Open,
        "monitoring" => CaseStatus::Monitoring,
        "escalated" => CaseStatus::Escalated,
        "resolved" => CaseStatus::Resolved,
        "dismissed" => CaseStatus::Dismissed,
        "reopened" => CaseStatus::Reopened,
        other => return Err(FhError::Validation(format!("unknown case status {other}")).into()),
    })
}

fn severity_str(severity: fh_types::Severity) -> &'static str {
    match severity {
        fh_types::Severity::Low | fh_types::Severity::Info => "low",
        fh_types::Severity::Medium | fh_types::Severity::Warning => "medium",
        fh_types::Severity::High => "high",
        fh_types::Severity::Critical => "critical",
    }
}

#[derive(Serialize)]
pub struct CaseDto {
    id: Uuid,
    domain: &'static str,
    status: &'static str,
    primary_signal_type: String,
    severity: &'static str,
    opened_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    risk_score_snapshot: f64,
    assigned_to: Option<String>,
    next_review_at: Option<DateTime<Utc>>,
}

impl From<&fh_cases::Case> for CaseDto {
    fn from(case: &fh_cases::Case) -> Self {
        CaseDto {
            id: case.id.0,
            domain: domain_str(case.domain),
            status: status_str(case.status),
            primary_signal_type: case.primary_signal_type.clone(),
            severity: severity_str(case.severity),
            opened_at: case.opened_at,
            last_activity_at: case.last_activity_at,
            closed_at: case.closed_at,
            risk_score_snapshot: case.risk_score_snapshot,
            assigned_to: case.assigned_to.clone(),
            next_review_at: case.next_review_at,
        }
    }
}

/// `GET /api/cases/{business_id}`: every case regardless of status.
pub async fn list(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> ApiResult<Json<Vec<CaseDto>>> {
    let business_id = BusinessId(business_id);
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let cases = fh_cases::CaseRepo::list_for_business(&mut conn, business_id).await?;
    Ok(Json(cases.iter().map(CaseDto::from).collect()))
}

/// `GET /api/cases/{business_id}/{case_id}`.
pub async fn detail(
    State(state): State<AppState>,
    Path((_business_id, case_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<CaseDto>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let case = fh_cases::CaseRepo::fetch_case(&mut conn, CaseId(case_id)).await?;
    Ok(Json(CaseDto::from(&case)))
}

#[derive(Serialize)]
pub struct CaseEventDto {
    id: Uuid,
    kind: String,
    payload: Value,
    occurred_at: DateTime<Utc>,
}

impl From<&fh_cases::CaseEvent> for CaseEventDto {
    fn from(event: &fh_cases::CaseEvent) -> Self {
        CaseEventDto {
            id: event.id,
            kind: event.kind.clone(),
            payload: event.payload_json.clone(),
            occurred_at: event.occurred_at,
        }
    }
}

/// `GET /api/cases/{business_id}/{case_id}/timeline`.
pub async fn timeline(
    State(state): State<AppState>,
    Path((_business_id, case_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<Vec<CaseEventDto>>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let events = fh_cases::CaseRepo::list_case_events(&mut conn, CaseId(case_id)).await?;
    Ok(Json(events.iter().map(CaseEventDto::from).collect()))
}

#[derive(Deserialize)]
pub struct UpdateCaseStatusRequest {
    status: String,
}

/// `POST /api/cases/{business_id}/{case_id}/status`.
pub async fn update_status(
    State(state): State<AppState>,
    Path((business_id, case_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<UpdateCaseStatusRequest>,
) -> ApiResult<Json<CaseDto>> {
    let business_id = BusinessId(business_id);
    let case_id = CaseId(case_id);
    let next = parse_status(&body.status)?;
    let now = Utc::now();

    let mut tx = state.db.begin().await?;
    let mut case = fh_cases::CaseRepo::fetch_case(&mut tx, case_id).await?;
    fh_cases::validate_transition(case.status, next)?;
    let before = json!({"status": status_str(case.status)});
    case.status = next;
    case.last_activity_at = now;
    if matches!(next, CaseStatus::Resolved | CaseStatus::Dismissed) {
        case.closed_at = Some(now);
    } else {
        case.closed_at = None;
    }
    fh_cases::CaseRepo::update_case(&mut tx, &case).await?;
    let after = json!({"status": status_str(case.status)});
    fh_cases::CaseRepo::insert_case_event(&mut tx, case_id, business_id, "CASE_STATUS_CHANGED", json!({"before": before, "after": after}), now).await?;
    fh_audit::log_audit_event(&mut tx, business_id, "case_status_changed", Some(before), Some(after), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;

    Ok(Json(CaseDto::from(&case)))
}

#[derive(Deserialize)]
pub struct AddNoteRequest {
    note: String,
}

/// `POST /api/cases/{business_id}/{case_id}/note`: appends a free-text
/// `CASE_NOTE_ADDED` timeline entry, attributed to the caller.
pub async fn add_note(
    State(state): State<AppState>,
    Path((business_id, case_id)): Path<(Uuid, Uuid)>,
    caller: CallerIdentity,
    Json(body): Json<AddNoteRequest>,
) -> ApiResult<Json<CaseEventDto>> {
    let business_id = BusinessId(business_id);
    let case_id = CaseId(case_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let payload = json!({"note": body.note, "author": caller.label()});
    let event = fh_cases::CaseRepo::insert_case_event(&mut tx, case_id, business_id, "CASE_NOTE_ADDED", payload.clone(), now).await?;
    fh_audit::log_audit_event(&mut tx, business_id, "case_note_added", None, Some(payload), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(CaseEventDto::from(&event)))
}

#[derive(Deserialize)]
pub struct AnchorRequest {
    anchor_key: String,
    payload: Option<Value>,
}

#[derive(Serialize)]
pub struct AnchorResponse {
    changed: bool,
}

/// `POST /api/cases/{business_id}/{case_id}/attach-ledger-anchor`.
pub async fn attach_ledger_anchor(
    State(state): State<AppState>,
    Path((_business_id, case_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<AnchorRequest>,
) -> ApiResult<Json<AnchorResponse>> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let changed = fh_cases::attach_ledger_anchor(&mut tx, CaseId(case_id), &body.anchor_key, body.payload, now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(AnchorResponse { changed }))
}

/// `POST /api/cases/{business_id}/{case_id}/detach-ledger-anchor`.
pub async fn detach_ledger_anchor(
    State(state): State<AppState>,
    Path((_business_id, case_id)): Path<(Uuid, Uuid)>,
    Json(body): Json<AnchorRequest>,
) -> ApiResult<Json<AnchorResponse>> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let changed = fh_cases::detach_ledger_anchor(&mut tx, CaseId(case_id), &body.anchor_key, now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(AnchorResponse { changed }))
}
