//! Append-only per-business event log (`spec.md` §3's `AuditLog`/`ChangeLog`,
//! component M). `spec.md` §9 names it the single source of truth every
//! signal/case/action/plan/work transition must go through —
//! `HealthScoreEngine::ExplainChange` and daily-brief progress both read it.
//!
//! Two operations: append an entry, and list entries for a business within
//! a window, ordered `(created_at, id)` per `spec.md` §5.

#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use fh_types::{BusinessId, FhError};
use serde_json::Value;
use sqlx::PgConnection;
use uuid::Uuid;

/// One row of the audit log.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Surrogate primary key.
    pub id: Uuid,
    /// Tenant.
    pub business_id: BusinessId,
    /// Stable event kind, e.g. `"signal_detected"`, `"CASE_ESCALATED"`.
    pub kind: String,
    /// State before the change, if applicable.
    pub before_state: Option<Value>,
    /// State after the change, if applicable.
    pub after_state: Option<Value>,
    /// When the transition happened.
    pub occurred_at: DateTime<Utc>,
}

/// Append one audit row. Never fails the caller's transaction on its own —
/// any write error is still propagated, but callers are expected to run this
/// inside the same transaction as the state change it documents so both
/// commit or abort together (`spec.md` §9: "persist every transition through
/// the same audit writer").
pub async fn log_audit_event(
    conn: &mut PgConnection,
    business_id: BusinessId,
    kind: &str,
    before_state: Option<Value>,
    after_state: Option<Value>,
    occurred_at: DateTime<Utc>,
) -> Result<AuditEntry, FhError> {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO audit_log (id, business_id, kind, before_state, after_state, occurred_at) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(id)
    .bind(business_id.0)
    .bind(kind)
    .bind(&before_state)
    .bind(&after_state)
    .bind(occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| FhError::Storage(e.to_string()))?;

    Ok(AuditEntry {
        id,
        business_id,
        kind: kind.to_string(),
        before_state,
        after_state,
        occurred_at,
    })
}

/// List audit entries for a business within `[since, until]`, ordered by
/// `(occurred_at, id)` ascending — `spec.md` §5's total-order guarantee.
/// `kind_prefix`, if set, restricts to kinds starting with that prefix (used
/// by `ActionPolicy`'s flapping check, which only cares about signal status
/// transitions).
pub async fn list_audit_events(
    conn: &mut PgConnection,
    business_id: BusinessId,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    kind_prefix: Option<&str>,
) -> Result<Vec<AuditEntry>, FhError> {
    use sqlx::Row;
    let rows = if let Some(prefix) = kind_prefix {
        let pattern = format!("{prefix}%");
        sqlx::query(
            "SELECT id, business_id, kind, before_state, after_state, occurred_at FROM audit_log \
             WHERE business_id = $1 AND occurred_at >= $2 AND occurred_at <= $3 AND kind LIKE $4 \
             ORDER BY occurred_at ASC, id ASC",
        )
        .bind(business_id.0)
        .bind(since)
        .bind(until)
        .bind(pattern)
        .fetch_all(&mut *conn)
        .await
    } else {
        sqlx::query(
            "SELECT id, business_id, kind, before_state, after_state, occurred_at FROM audit_log \
             WHERE business_id = $1 AND occurred_at >= $2 AND occurred_at <= $3 \
             ORDER BY occurred_at ASC, id ASC",
        )
        .bind(business_id.0)
        .bind(since)
        .bind(until)
        .fetch_all(&mut *conn)
        .await
    }
    .map_err(|e| FhError::Storage(e.to_string()))?;

    rows.into_iter()
        .map(|row| {
            Ok(AuditEntry {
                id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                kind: row.try_get("kind").map_err(|e| FhError::Storage(e.to_string()))?,
                before_state: row.try_get("before_state").map_err(|e| FhError::Storage(e.to_string()))?,
                after_state: row.try_get("after_state").map_err(|e| FhError::Storage(e.to_string()))?,
                occurred_at: row.try_get("occurred_at").map_err(|e| FhError::Storage(e.to_string()))?,
            })
        })
        .collect()
}
