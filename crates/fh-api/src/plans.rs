//! Observational plan lifecycle routes (`spec.md` §4.10, §6).

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use fh_plans::{NewCondition, PlanConditionType};
use fh_types::{BusinessId, CaseId, FhError, MetricDirection, PlanId, PlanStatus, PlanVerdict, SignalId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

fn status_str(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::Draft => "draft",
        PlanStatus::Active => "active",
        PlanStatus::Succeeded => "succeeded",
        PlanStatus::Failed => "failed",
        PlanStatus::Canceled => "canceled",
    }
}

fn parse_status(s: &str) -> ApiResult<PlanStatus> {
    Ok(match s {
        "succeeded" => PlanStatus::Succeeded,
        "failed" => PlanStatus::Failed,
        "canceled" => PlanStatus::Canceled,
        other => return Err(FhError::Validation(format!("unknown close outcome {other}")).into()),
    })
}

fn verdict_str(v: PlanVerdict) -> &'static str {
    match v {
        PlanVerdict::NoChange => "no_change",
        PlanVerdict::Improving => "improving",
        PlanVerdict::Worsening => "worsening",
        PlanVerdict::Success => "success",
        PlanVerdict::Failure => "failure",
    }
}

fn condition_type_str(t: PlanConditionType) -> &'static str {
    match t {
        PlanConditionType::SignalResolved => "signal_resolved",
        PlanConditionType::MetricDelta => "metric_delta",
    }
}

fn parse_condition_type(s: &str) -> ApiResult<PlanConditionType> {
    Ok(match s {
        "signal_resolved" => PlanConditionType::SignalResolved,
        "metric_delta" => PlanConditionType::MetricDelta,
        other => return Err(FhError::Validation(format!("unknown plan condition type {other}")).into()),
    })
}

fn parse_direction(s: &str) -> ApiResult<MetricDirection> {
    Ok(match s {
        "improve" => MetricDirection::Improve,
        "worsen" => MetricDirection::Worsen,
        "resolve" => MetricDirection::Resolve,
        other => return Err(FhError::Validation(format!("unknown plan condition direction {other}")).into()),
    })
}

#[derive(Serialize)]
pub struct PlanDto {
    id: Uuid,
    case_id: Uuid,
    title: String,
    status: &'static str,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    assigned_to: Option<String>,
    last_verdict: Option<&'static str>,
    last_refreshed_at: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
}

impl From<&fh_plans::Plan> for PlanDto {
    fn from(plan: &fh_plans::Plan) -> Self {
        PlanDto {
            id: plan.id.0,
            case_id: plan.case_id.0,
            title: plan.title.clone(),
            status: status_str(plan.status),
            created_at: plan.created_at,
            activated_at: plan.activated_at,
            closed_at: plan.closed_at,
            assigned_to: plan.assigned_to.clone(),
            last_verdict: plan.last_verdict.map(verdict_str),
            last_refreshed_at: plan.last_refreshed_at,
            idempotency_key: plan.idempotency_key.clone(),
        }
    }
}

#[derive(Deserialize)]
pub struct ConditionRequest {
    condition_type: String,
    source_signal_id: Option<String>,
    metric_key: Option<String>,
    baseline_window_days: Option<i32>,
    evaluation_window_days: i32,
    threshold: Option<f64>,
    direction: Option<String>,
}

#[derive(Deserialize)]
pub struct CreatePlanRequest {
    business_id: Uuid,
    case_id: Uuid,
    title: String,
    assigned_to: Option<String>,
    idempotency_key: Option<String>,
    conditions: Vec<ConditionRequest>,
}

/// `POST /api/plans`.
pub async fn create(State(state): State<AppState>, Json(body): Json<CreatePlanRequest>) -> ApiResult<Json<PlanDto>> {
    let conditions = body
        .conditions
        .iter()
        .map(|c| {
            Ok(NewCondition {
                condition_type: parse_condition_type(&c.condition_type)?,
                source_signal_id: c.source_signal_id.clone().map(SignalId),
                metric_key: c.metric_key.clone(),
                baseline_window_days: c.baseline_window_days,
                evaluation_window_days: c.evaluation_window_days,
                threshold: c.threshold,
                direction: c.direction.as_deref().map(parse_direction).transpose()?,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let plan = fh_plans::create_plan(
        &mut tx,
        BusinessId(body.business_id),
        CaseId(body.case_id),
        &body.title,
        body.assigned_to.as_deref(),
        body.idempotency_key.as_deref(),
        &conditions,
        now,
    )
    .await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(PlanDto::from(&plan)))
}

/// `POST /api/plans/{business_id}/{id}/activate`.
pub async fn activate(State(state): State<AppState>, Path((business_id, id)): Path<(Uuid, Uuid)>) -> ApiResult<Json<PlanDto>> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let plan = fh_plans::activate(&mut tx, BusinessId(business_id), PlanId(id), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(PlanDto::from(&plan)))
}

#[derive(Deserialize)]
pub struct AssignRequest {
    assigned_to: Option<String>,
}

/// `POST /api/plans/{business_id}/{id}/assign`.
pub async fn assign(
    State(state): State<AppState>,
    Path((business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<AssignRequest>,
) -> ApiResult<Json<PlanDto>> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let plan = fh_plans::assign(&mut tx, BusinessId(business_id), PlanId(id), body.assigned_to.as_deref(), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(PlanDto::from(&plan)))
}

#[derive(Deserialize)]
pub struct NoteRequest {
    note: String,
}

/// `POST /api/plans/{business_id}/{id}/note`.
pub async fn add_note(
    State(state): State<AppState>,
    Path((business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<NoteRequest>,
) -> ApiResult<Json<()>> {
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    fh_plans::add_note(&mut tx, BusinessId(business_id), PlanId(id), &body.note, now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(()))
}

#[derive(Serialize)]
pub struct ObservationDto {
    verdict: &'static str,
    observed_at: DateTime<Utc>,
    evidence: serde_json::Value,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    observation: ObservationDto,
    success: bool,
}

/// `POST /api/plans/{business_id}/{id}/refresh`: resolves each
/// `signal_resolved` condition's source signal from the business's current
/// `health_signal_state` rows, then delegates to `fh_plans::refresh`.
pub async fn refresh(State(state): State<AppState>, Path((business_id, id)): Path<(Uuid, Uuid)>) -> ApiResult<Json<RefreshResponse>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;

    let signals = fh_signals::SignalRepo::fetch_all(&mut tx, business_id).await?;
    let lookup = move |signal_id: &SignalId| -> Option<fh_plans::SignalSnapshot> {
        signals.iter().find(|s| &s.signal_id == signal_id).map(|s| fh_plans::SignalSnapshot {
            status: s.status,
            resolved_at: s.resolved_at,
            updated_at: s.updated_at,
        })
    };

    let (observation, success) = fh_plans::refresh(&mut tx, business_id, PlanId(id), lookup, now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;

    Ok(Json(RefreshResponse {
        observation: ObservationDto {
            verdict: verdict_str(observation.verdict),
            observed_at: observation.observed_at,
            evidence: observation.evidence_json,
        },
        success,
    }))
}

#[derive(Deserialize)]
pub struct CloseRequest {
    outcome: String,
    note: Option<String>,
}

/// `POST /api/plans/{business_id}/{id}/close`.
pub async fn close(
    State(state): State<AppState>,
    Path((business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<CloseRequest>,
) -> ApiResult<Json<PlanDto>> {
    let outcome = parse_status(&body.outcome)?;
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let plan = fh_plans::close(&mut tx, BusinessId(business_id), PlanId(id), outcome, body.note.as_deref(), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(PlanDto::from(&plan)))
}

/// `GET /api/plans/case/{case_id}`: every plan on a case, newest first.
pub async fn list_for_case(State(state): State<AppState>, Path(case_id): Path<Uuid>) -> ApiResult<Json<Vec<PlanDto>>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let plans = fh_plans::PlanRepo::list_for_case(&mut conn, CaseId(case_id)).await?;
    Ok(Json(plans.iter().map(PlanDto::from).collect()))
}

#[derive(Deserialize)]
pub struct FromActionRequest {
    case_id: Uuid,
    action_id: Uuid,
    title: String,
    assigned_to: Option<String>,
    evaluation_window_days: i32,
}

/// `POST /api/plans/{business_id}/from_action`: seeds a single-condition
/// plan from an open action, carrying its `source_signal_id` forward as a
/// `signal_resolved` condition — the common case of "turn this action into
/// a tracked remediation".
pub async fn from_action(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Json(body): Json<FromActionRequest>,
) -> ApiResult<Json<PlanDto>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;

    let actions = fh_actions::ActionRepo::list_for_business(&mut tx, business_id).await?;
    let action = actions
        .iter()
        .find(|a| a.id == body.action_id)
        .ok_or_else(|| FhError::NotFound(format!("action {}", body.action_id)))?;
    let source_signal_id = action.source_signal_id.clone().ok_or_else(|| {
        FhError::Validation("action has no source_signal_id to track".into())
    })?;

    let conditions = vec![NewCondition {
        condition_type: PlanConditionType::SignalResolved,
        source_signal_id: Some(SignalId(source_signal_id)),
        metric_key: None,
        baseline_window_days: None,
        evaluation_window_days: body.evaluation_window_days,
        threshold: None,
        direction: None,
    }];

    let plan = fh_plans::create_plan(
        &mut tx,
        business_id,
        CaseId(body.case_id),
        &body.title,
        body.assigned_to.as_deref(),
        Some(&format!("from_action:{}", body.action_id)),
        &conditions,
        now,
    )
    .await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(PlanDto::from(&plan)))
}
