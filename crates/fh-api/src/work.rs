//! Work-item list/complete/snooze/materialize routes (`spec.md` §4.8, §6).

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use fh_types::{BusinessId, FhError, WorkItemStatus, WorkItemType};
use fh_work::{WorkItemInputs, WorkItemRow};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

fn item_type_str(item_type: WorkItemType) -> &'static str {
    match item_type {
        WorkItemType::SlaBreach => "sla_breach",
        WorkItemType::PlanOverdue => "plan_overdue",
        WorkItemType::NoPlan => "no_plan",
        WorkItemType::HighSeverityTriage => "high_severity_triage",
        WorkItemType::ReviewDue => "review_due",
        WorkItemType::UnassignedCase => "unassigned_case",
    }
}

fn status_str(status: WorkItemStatus) -> &'static str {
    match status {
        WorkItemStatus::Open => "open",
        WorkItemStatus::Snoozed => "snoozed",
        WorkItemStatus::Completed => "completed",
    }
}

#[derive(Serialize)]
pub struct WorkItemDto {
    id: Uuid,
    case_id: Uuid,
    idempotency_key: String,
    item_type: &'static str,
    priority: i32,
    status: &'static str,
    due_at: Option<DateTime<Utc>>,
    snoozed_until: Option<DateTime<Utc>>,
}

impl From<&WorkItemRow> for WorkItemDto {
    fn from(row: &WorkItemRow) -> Self {
        WorkItemDto {
            id: row.id,
            case_id: row.case_id.0,
            idempotency_key: row.idempotency_key.clone(),
            item_type: item_type_str(row.item_type),
            priority: row.priority,
            status: status_str(row.status),
            due_at: row.due_at,
            snoozed_until: row.snoozed_until,
        }
    }
}

/// `GET /api/work/{business_id}`.
pub async fn list(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<Vec<WorkItemDto>>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let rows = fh_work::WorkItemRepo::list_for_business(&mut conn, BusinessId(business_id)).await?;
    Ok(Json(rows.iter().map(WorkItemDto::from).collect()))
}

/// `POST /api/work/{business_id}/{id}/complete`.
pub async fn complete(State(state): State<AppState>, Path((_business_id, id)): Path<(Uuid, Uuid)>) -> ApiResult<Json<()>> {
    let mut tx = state.db.begin().await?;
    fh_work::WorkItemRepo::complete_by_user(&mut tx, id).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(()))
}

#[derive(Deserialize)]
pub struct SnoozeRequest {
    until: DateTime<Utc>,
}

/// `POST /api/work/{business_id}/{id}/snooze`.
pub async fn snooze(
    State(state): State<AppState>,
    Path((_business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<SnoozeRequest>,
) -> ApiResult<Json<()>> {
    let mut tx = state.db.begin().await?;
    fh_work::WorkItemRepo::snooze(&mut tx, id, body.until).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(()))
}

#[derive(Serialize, Default)]
pub struct MaterializeResponse {
    cases_considered: usize,
    created: usize,
    refreshed: usize,
    auto_resolved: usize,
}

/// `POST /api/work/{business_id}/materialize`: runs `fh_work::materialize`
/// over every active case, assembling each case's `WorkItemInputs` from a
/// no-op `recompute_case(apply=false)` read plus its oldest active plan.
pub async fn materialize(State(state): State<AppState>, Path(business_id): Path<Uuid>) -> ApiResult<Json<MaterializeResponse>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;

    let cases = fh_cases::CaseRepo::list_active_for_business(&mut tx, business_id).await?;
    let mut response = MaterializeResponse { cases_considered: cases.len(), ..Default::default() };

    for case in &cases {
        let recompute = fh_cases::recompute_case(&mut tx, case.id, false, now).await?;
        let active_plan_created_at = fh_cases::CaseRepo::oldest_active_plan_created_at(&mut tx, case.id).await?;
        let inputs = WorkItemInputs {
            case_id: case.id,
            status: case.status,
            severity: recompute.derived.severity,
            opened_at: case.opened_at,
            next_review_at: case.next_review_at,
            assigned_to: case.assigned_to.clone(),
            computed_sla_breached: recompute.derived.computed_sla_breached,
            computed_plan_overdue: recompute.derived.computed_plan_overdue,
            open_signal_count_30d: recompute.derived.computed_open_signal_count_30d,
            active_plan_created_at,
            has_active_plan: active_plan_created_at.is_some(),
            now,
        };
        let outcome = fh_work::materialize(&mut tx, business_id, &inputs, now).await?;
        response.created += outcome.created;
        response.refreshed += outcome.refreshed;
        response.auto_resolved += outcome.auto_resolved;
    }

    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(response))
}
