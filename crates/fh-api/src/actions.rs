//! Action item list/generate/resolve/snooze/assign routes (`spec.md` §4.9, §6).

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::{DateTime, Duration, Utc};
use fh_actions::{ActionRow, ActionsContext, IntegrationSnapshot, OutflowLine};
use fh_types::{ActionStatus, ActionType, BusinessId, FhError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

fn action_type_str(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::FixMapping => "fix_mapping",
        ActionType::InvestigateAnomaly => "investigate_anomaly",
        ActionType::SyncIntegration => "sync_integration",
        ActionType::ReviewVendor => "review_vendor",
    }
}

fn status_str(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Open => "open",
        ActionStatus::Done => "done",
        ActionStatus::Ignored => "ignored",
        ActionStatus::Snoozed => "snoozed",
    }
}

fn parse_status(s: &str) -> ApiResult<ActionStatus> {
    Ok(match s {
        "open" => ActionStatus::Open,
        "done" => ActionStatus::Done,
        "ignored" => ActionStatus::Ignored,
        "snoozed" => ActionStatus::Snoozed,
        other => return Err(FhError::Validation(format!("unknown action status {other}")).into()),
    })
}

#[derive(Serialize)]
pub struct ActionDto {
    id: Uuid,
    idempotency_key: String,
    action_type: &'static str,
    priority: i32,
    status: &'static str,
    source_signal_id: Option<String>,
    evidence: Value,
    rationale: Value,
    resolved_at: Option<DateTime<Utc>>,
    resolution_reason: Option<String>,
    snoozed_until: Option<DateTime<Utc>>,
    assigned_to: Option<String>,
}

impl From<&ActionRow> for ActionDto {
    fn from(row: &ActionRow) -> Self {
        ActionDto {
            id: row.id,
            idempotency_key: row.idempotency_key.clone(),
            action_type: action_type_str(row.action_type),
            priority: row.priority,
            status: status_str(row.status),
            source_signal_id: row.source_signal_id.clone(),
            evidence: row.evidence_json.clone(),
            rationale: row.rationale_json.clone(),
            resolved_at: row.resolved_at,
            resolution_reason: row.resolution_reason.clone(),
            snoozed_until: row.snoozed_until,
            assigned_to: row.assigned_to.clone(),
        }
    }
}

/// `GET /api/actions/{business_id}`.
pub async fn list(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> ApiResult<Json<Vec<ActionDto>>> {
    let business_id = BusinessId(business_id);
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let rows = fh_actions::ActionRepo::list_for_business(&mut conn, business_id).await?;
    Ok(Json(rows.iter().map(ActionDto::from).collect()))
}

async fn fetch_uncategorized(conn: &mut sqlx::PgConnection, business_id: BusinessId) -> ApiResult<(i64, Vec<String>)> {
    let rows = sqlx::query("SELECT source_event_id FROM processing_event_state WHERE business_id = $1 AND status = 'normalized'")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let ids: Vec<String> = rows
        .into_iter()
        .map(|row| row.try_get::<String, _>("source_event_id").map_err(|e| FhError::Storage(e.to_string())))
        .collect::<Result<_, FhError>>()?;
    let count = ids.len() as i64;
    let sample = ids.into_iter().take(10).collect();
    Ok((count, sample))
}

async fn fetch_integrations(conn: &mut sqlx::PgConnection, business_id: BusinessId) -> ApiResult<Vec<IntegrationSnapshot>> {
    let rows = sqlx::query("SELECT provider, status, last_sync_at FROM integration_connection WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    rows.into_iter()
        .map(|row| {
            let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
            Ok(IntegrationSnapshot {
                provider: row.try_get("provider").map_err(|e| FhError::Storage(e.to_string()))?,
                connected: status == "connected",
                last_sync_at: row.try_get("last_sync_at").map_err(|e| FhError::Storage(e.to_string()))?,
            })
        })
        .collect::<Result<Vec<_>, FhError>>()
        .map_err(Into::into)
}

#[derive(Serialize)]
pub struct GenerateResponse {
    created_count: usize,
    updated_count: usize,
    suppressed_count: usize,
}

/// `POST /api/actions/{business_id}/refresh`: re-runs the four candidate
/// generators against freshly-read state and merges them through the
/// suppression pipeline.
pub async fn refresh(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> ApiResult<Json<GenerateResponse>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;

    let (uncategorized_count, sample_uncategorized_event_ids) = fetch_uncategorized(&mut tx, business_id).await?;
    let open_signals = fh_signals::SignalRepo::fetch_all(&mut tx, business_id)
        .await?
        .into_iter()
        .filter(|s| s.status == fh_types::SignalStatus::Open)
        .collect::<Vec<_>>();
    let integrations = fetch_integrations(&mut tx, business_id).await?;

    let flapping_since = now - Duration::days(fh_actions::FLAPPING_WINDOW_DAYS);
    let mut flapping_transition_counts = HashMap::new();
    for signal in &open_signals {
        let count = fh_actions::count_signal_transitions(&mut tx, business_id, &signal.signal_id.0, flapping_since, now).await?;
        flapping_transition_counts.insert(signal.signal_id.0.clone(), count);
    }

    let raw = fh_raw_events::RawEventRepo::fetch_all(&mut tx, business_id, None).await?;
    let (txns, _errors) = fh_projection::project(&raw);
    let window_start = now - Duration::days(90);
    let outflows_90d: Vec<OutflowLine> = txns
        .iter()
        .filter(|t| t.occurred_at >= window_start && t.direction == fh_types::Direction::Outflow)
        .map(|t| OutflowLine {
            occurred_at: t.occurred_at,
            vendor: t.counterparty.clone().unwrap_or_else(|| t.description.clone()),
            amount: t.amount.to_f64(),
        })
        .collect();

    let ctx = ActionsContext {
        business_id,
        now,
        uncategorized_count,
        sample_uncategorized_event_ids: &sample_uncategorized_event_ids,
        open_signals: &open_signals,
        integrations: &integrations,
        outflows_90d: &outflows_90d,
        flapping_transition_counts: &flapping_transition_counts,
    };
    let outcome = fh_actions::generate(&mut tx, &ctx).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;

    Ok(Json(GenerateResponse {
        created_count: outcome.created_count,
        updated_count: outcome.updated_count,
        suppressed_count: outcome.suppressed_count,
    }))
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    status: String,
    reason: Option<String>,
}

/// `POST /api/actions/{business_id}/{id}/resolve`.
pub async fn resolve(
    State(state): State<AppState>,
    Path((_business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<ResolveRequest>,
) -> ApiResult<Json<()>> {
    let status = parse_status(&body.status)?;
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    fh_actions::ActionRepo::resolve(&mut tx, id, status, body.reason.as_deref(), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(()))
}

#[derive(Deserialize)]
pub struct SnoozeRequest {
    until: DateTime<Utc>,
    reason: Option<String>,
}

/// `POST /api/actions/{business_id}/{id}/snooze`.
pub async fn snooze(
    State(state): State<AppState>,
    Path((_business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<SnoozeRequest>,
) -> ApiResult<Json<()>> {
    let mut tx = state.db.begin().await?;
    fh_actions::ActionRepo::snooze(&mut tx, id, body.until, body.reason.as_deref()).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(()))
}

#[derive(Deserialize)]
pub struct AssignRequest {
    assigned_to: Option<String>,
}

/// `POST /api/actions/{business_id}/{id}/assign`.
pub async fn assign(
    State(state): State<AppState>,
    Path((business_id, id)): Path<(Uuid, Uuid)>,
    Json(body): Json<AssignRequest>,
) -> ApiResult<Json<()>> {
    let business_id = BusinessId(business_id);
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    fh_actions::assign(&mut tx, business_id, id, body.assigned_to.as_deref(), now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(()))
}
