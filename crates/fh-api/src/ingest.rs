//! Raw-event ingest, provider handshake and processing routes
//! (`spec.md` §4.1, §4.4, §6).

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::response::Json;
use chrono::Utc;
use fh_domain::CategoryRule;
use fh_types::{BusinessId, EventType, FhError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Serialize)]
pub struct LinkTokenResponse {
    link_token: String,
}

pub async fn create_link_token(
    State(state): State<AppState>,
    Path((_provider, business_id)): Path<(String, Uuid)>,
) -> ApiResult<Json<LinkTokenResponse>> {
    let link_token = state.provider.create_link_token(&business_id.to_string()).await?;
    Ok(Json(LinkTokenResponse { link_token }))
}

#[derive(Deserialize)]
pub struct ExchangeRequest {
    public_token: String,
}

#[derive(Serialize)]
pub struct ExchangeResponse {
    connected: bool,
}

pub async fn exchange_public_token(
    State(state): State<AppState>,
    Path((_provider, business_id)): Path<(String, Uuid)>,
    Json(body): Json<ExchangeRequest>,
) -> ApiResult<Json<ExchangeResponse>> {
    let access_token = state
        .provider
        .exchange_public_token(&business_id.to_string(), &body.public_token)
        .await?;
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    upsert_connection(&mut conn, BusinessId(business_id), state.provider.name(), "connected", None, Utc::now()).await?;
    // the access token itself is not persisted here: this pilot's stub
    // provider never issues one a caller could reuse, and a real
    // provider's token storage needs its own encrypted-at-rest column,
    // which `fh-config`'s `PLAID_ALLOW_PLAINTEXT_TOKENS` flag anticipates
    // but this schema does not yet carry.
    let _ = access_token;
    Ok(Json(ExchangeResponse { connected: true }))
}

#[derive(Serialize, Default)]
pub struct SyncResponse {
    events_ingested: usize,
    next_cursor: Option<String>,
}

pub async fn sync(
    State(state): State<AppState>,
    Path((_provider, business_id)): Path<(String, Uuid)>,
) -> ApiResult<Json<SyncResponse>> {
    let business_id = BusinessId(business_id);
    let page = state.provider.sync(&business_id.to_string(), "", None).await?;
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let mut ingested = 0usize;
    for event in &page.events {
        if let Some(outcome) = ingest_raw_event(&mut tx, business_id, state.provider.name(), event, now).await? {
            if outcome.inserted {
                ingested += 1;
            }
        }
    }
    upsert_connection(&mut tx, business_id, state.provider.name(), if page.connected { "connected" } else { "disconnected" }, None, now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(SyncResponse { events_ingested: ingested, next_cursor: page.next_cursor }))
}

/// `POST /integrations/{business_id}/{provider}/replay`: re-pulls the
/// provider's full feed from scratch, ignoring any stored sync cursor —
/// the recovery path when a prior ingest run was lost or corrupted.
/// Idempotent inserts mean replaying a feed already ingested is a no-op.
pub async fn replay(
    State(state): State<AppState>,
    Path((business_id, _provider)): Path<(Uuid, String)>,
) -> ApiResult<Json<SyncResponse>> {
    let business_id = BusinessId(business_id);
    let page = state.provider.sync(&business_id.to_string(), "", None).await?;
    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let mut ingested = 0usize;
    for event in &page.events {
        if let Some(outcome) = ingest_raw_event(&mut tx, business_id, state.provider.name(), event, now).await? {
            if outcome.inserted {
                ingested += 1;
            }
        }
    }
    upsert_connection(&mut tx, business_id, state.provider.name(), if page.connected { "connected" } else { "disconnected" }, None, now).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(SyncResponse { events_ingested: ingested, next_cursor: page.next_cursor }))
}

/// `POST /api/webhooks/{provider}`: verifies the signature before ingesting
/// anything (`spec.md` §6: "a webhook whose signature does not verify must
/// never reach ingest").
pub async fn webhook(
    State(state): State<AppState>,
    Path(_provider): Path<String>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> ApiResult<Json<SyncResponse>> {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
        .collect();
    let verification = state.provider.verify_webhook(&header_map, &body);
    if !verification.ok {
        return Err(FhError::Validation(format!(
            "webhook signature verification failed: {}",
            verification.reason.unwrap_or_default()
        ))
        .into());
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| FhError::Validation(format!("malformed webhook body: {e}")))?;
    let business_id = payload
        .get("business_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| FhError::Validation("webhook payload missing business_id".into()))?;
    let business_id = BusinessId(business_id);
    let events = payload.get("events").and_then(Value::as_array).cloned().unwrap_or_default();

    let now = Utc::now();
    let mut tx = state.db.begin().await?;
    let mut ingested = 0usize;
    for event in &events {
        if let Some(outcome) = ingest_raw_event(&mut tx, business_id, state.provider.name(), event, now).await? {
            if outcome.inserted {
                ingested += 1;
            }
        }
    }
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(SyncResponse { events_ingested: ingested, next_cursor: None }))
}

/// One raw-event revision, whatever the provider's own JSON shape, needs
/// `source_event_id`/`occurred_at`/`event_version`; unparseable entries are
/// dropped rather than aborting the whole batch (`spec.md` §4.1's
/// per-event insert is independent).
async fn ingest_raw_event(
    conn: &mut sqlx::PgConnection,
    business_id: BusinessId,
    source: &str,
    event: &Value,
    now: chrono::DateTime<Utc>,
) -> ApiResult<Option<fh_raw_events::InsertOutcome>> {
    let Some(source_event_id) = event.get("source_event_id").and_then(Value::as_str) else {
        tracing::warn!(%business_id, "dropping raw event with no source_event_id");
        return Ok(None);
    };
    let occurred_at = event
        .get("occurred_at")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);
    let event_version = event.get("event_version").and_then(Value::as_i64).unwrap_or(1);
    let event_type = match event.get("event_type").and_then(Value::as_str) {
        Some("removed") => EventType::Removed,
        Some("modified") => EventType::Modified,
        _ => EventType::Added,
    };
    let canonical = event.get("canonical_source_event_id").and_then(Value::as_str);

    let outcome = fh_raw_events::RawEventRepo::insert(
        conn,
        business_id,
        source,
        source_event_id,
        canonical,
        occurred_at,
        event.clone(),
        event_version,
        event_type,
    )
    .await?;
    Ok(Some(outcome))
}

async fn upsert_connection(
    conn: &mut sqlx::PgConnection,
    business_id: BusinessId,
    provider: &str,
    status: &str,
    last_error: Option<&str>,
    now: chrono::DateTime<Utc>,
) -> ApiResult<()> {
    sqlx::query(
        "INSERT INTO integration_connection (id, business_id, provider, status, last_sync_at, last_error, last_error_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (business_id, provider) DO UPDATE SET \
           status = EXCLUDED.status, last_sync_at = EXCLUDED.last_sync_at, \
           last_error = EXCLUDED.last_error, last_error_at = EXCLUDED.last_error_at",
    )
    .bind(Uuid::new_v4())
    .bind(business_id.0)
    .bind(provider)
    .bind(status)
    .bind(now)
    .bind(last_error)
    .bind(last_error.map(|_| now))
    .execute(&mut *conn)
    .await
    .map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(())
}

async fn fetch_category_rules_and_hints(
    conn: &mut sqlx::PgConnection,
    business_id: BusinessId,
) -> ApiResult<(Vec<CategoryRule>, HashMap<String, Uuid>)> {
    let rule_rows = sqlx::query("SELECT id, business_id, match_text, category_id, priority FROM category_rule WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let rules = rule_rows
        .into_iter()
        .map(|row| {
            Ok(CategoryRule {
                id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                business_id,
                match_text: row.try_get("match_text").map_err(|e| FhError::Storage(e.to_string()))?,
                category_id: row.try_get("category_id").map_err(|e| FhError::Storage(e.to_string()))?,
                priority: row.try_get("priority").map_err(|e| FhError::Storage(e.to_string()))?,
            })
        })
        .collect::<Result<Vec<_>, FhError>>()?;

    let map_rows = sqlx::query("SELECT system_key, category_id FROM business_category_map WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let mut hints = HashMap::with_capacity(map_rows.len());
    for row in map_rows {
        let system_key: String = row.try_get("system_key").map_err(|e| FhError::Storage(e.to_string()))?;
        let category_id: Uuid = row.try_get("category_id").map_err(|e| FhError::Storage(e.to_string()))?;
        hints.insert(system_key, category_id);
    }
    Ok((rules, hints))
}

#[derive(Serialize)]
pub struct ProcessResponse {
    #[serde(flatten)]
    counts: fh_processing::ProcessCounts,
}

/// `POST /api/processing/{business_id}/run`: normalize + categorize every
/// not-yet-terminal raw event.
pub async fn run_processing(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
) -> ApiResult<Json<ProcessResponse>> {
    let business_id = BusinessId(business_id);
    let mut tx = state.db.begin().await?;
    let (rules, hints) = fetch_category_rules_and_hints(&mut tx, business_id).await?;
    let counts = fh_processing::process_new_events(&mut tx, business_id, None, &rules, &hints, Utc::now()).await?;
    tx.commit().await.map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(Json(ProcessResponse { counts }))
}
