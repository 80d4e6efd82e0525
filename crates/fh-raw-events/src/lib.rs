//! Append-only log of provider events (`spec.md` §4.1, component A).
//!
//! `RawEvent` rows are immutable once inserted; idempotence is enforced at
//! the `(business_id, source, source_event_id)` unique key via
//! [`fh_store::insert_idempotent`]. The projection basis every downstream
//! consumer reads is [`latest_per_canonical`], a pure function over an
//! already-fetched slice so it can be unit-tested without a database.

#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use fh_types::{BusinessId, EventType, FhError};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use uuid::Uuid;

/// One immutable row of the provider event log.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Surrogate primary key.
    pub id: Uuid,
    /// Tenant.
    pub business_id: BusinessId,
    /// Provider name, e.g. `"plaid"`.
    pub source: String,
    /// Provider-assigned id for this specific revision.
    pub source_event_id: String,
    /// Stable id across added/modified/removed revisions of the same
    /// underlying transaction.
    pub canonical_source_event_id: String,
    /// When the provider says this happened.
    pub occurred_at: DateTime<Utc>,
    /// Opaque provider payload.
    pub payload: Value,
    /// Monotone within a canonical id.
    pub event_version: i64,
    /// `added` / `modified` / `removed`.
    pub event_type: EventType,
    /// Convenience flag mirroring `event_type == removed`.
    pub is_removed: bool,
    /// `sha256(business_id|source|source_event_id|payload)`, stored for
    /// dedupe diagnostics.
    pub event_fingerprint: String,
    /// When this row was written to the log (not `occurred_at`).
    pub created_at: DateTime<Utc>,
}

/// Result of [`RawEventRepo::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    /// `false` when the dedupe key already existed; no row was written.
    pub inserted: bool,
}

fn event_fingerprint(business_id: BusinessId, source: &str, source_event_id: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(business_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(source_event_id.as_bytes());
    hasher.update(b"|");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Resolve the canonical id per `spec.md` §4.1: an explicit value wins, then
/// `payload.meta.canonical_source_event_id`, then
/// `payload.transaction.transaction_id`, then the event's own id.
#[must_use]
pub fn resolve_canonical_id(
    explicit: Option<&str>,
    payload: &Value,
    source_event_id: &str,
) -> String {
    if let Some(id) = explicit {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(id) = payload
        .get("meta")
        .and_then(|m| m.get("canonical_source_event_id"))
        .and_then(Value::as_str)
    {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(id) = payload
        .get("transaction")
        .and_then(|t| t.get("transaction_id"))
        .and_then(Value::as_str)
    {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    source_event_id.to_string()
}

/// Pick, out of an already-fetched slice of revisions for one business, the
/// single latest row per `canonical_source_event_id` — the row maximizing
/// `(event_version, occurred_at, source_event_id)` — optionally dropping
/// tombstones. Pure; no I/O. This is `spec.md` §4.1's `LatestPerCanonical`.
#[must_use]
pub fn latest_per_canonical(rows: &[RawEvent], include_removed: bool) -> Vec<&RawEvent> {
    use std::collections::HashMap;

    let mut winners: HashMap<&str, &RawEvent> = HashMap::new();
    for row in rows {
        let key = row.canonical_source_event_id.as_str();
        match winners.get(key) {
            None => {
                winners.insert(key, row);
            }
            Some(current) => {
                let challenger = (row.event_version, row.occurred_at, &row.source_event_id);
                let incumbent = (current.event_version, current.occurred_at, &current.source_event_id);
                if challenger > incumbent {
                    winners.insert(key, row);
                }
            }
        }
    }

    let mut out: Vec<&RawEvent> = winners
        .into_values()
        .filter(|row| include_removed || !row.is_removed)
        .collect();
    out.sort_by(|a, b| (a.occurred_at, &a.source_event_id).cmp(&(b.occurred_at, &b.source_event_id)));
    out
}

/// Repository wrapping the `raw_event` table.
pub struct RawEventRepo;

impl RawEventRepo {
    /// Insert one revision. Returns `inserted: false` without raising when
    /// `(business_id, source, source_event_id)` already exists — the
    /// savepoint dance in [`fh_store::insert_idempotent`] guarantees a
    /// concurrent duplicate never poisons the caller's transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        conn: &mut PgConnection,
        business_id: BusinessId,
        source: &str,
        source_event_id: &str,
        canonical_source_event_id: Option<&str>,
        occurred_at: DateTime<Utc>,
        payload: Value,
        event_version: i64,
        event_type: EventType,
    ) -> Result<InsertOutcome, FhError> {
        let canonical = resolve_canonical_id(canonical_source_event_id, &payload, source_event_id);
        let is_removed = matches!(event_type, EventType::Removed);
        let fingerprint = event_fingerprint(business_id, source, source_event_id, &payload);
        let event_type_str = match event_type {
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Removed => "removed",
        };
        let id = Uuid::new_v4();
        let savepoint = format!("raw_event_{}", id.simple());

        let inserted = fh_store::insert_idempotent(conn, &savepoint, |c| {
            sqlx::query(
                "INSERT INTO raw_event \
                 (id, business_id, source, source_event_id, canonical_source_event_id, \
                  occurred_at, payload, event_version, event_type, is_removed, event_fingerprint) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(id)
            .bind(business_id.0)
            .bind(source)
            .bind(source_event_id)
            .bind(&canonical)
            .bind(occurred_at)
            .bind(&payload)
            .bind(event_version)
            .bind(event_type_str)
            .bind(is_removed)
            .bind(&fingerprint)
            .execute(c)
        })
        .await?;

        Ok(InsertOutcome { inserted })
    }

    /// Fetch every revision for a business (optionally scoped to one
    /// provider), newest revisions first is not guaranteed here — callers
    /// pass the result through [`latest_per_canonical`].
    pub async fn fetch_all(
        conn: &mut PgConnection,
        business_id: BusinessId,
        source: Option<&str>,
    ) -> Result<Vec<RawEvent>, FhError> {
        let rows = if let Some(source) = source {
            sqlx::query(
                "SELECT id, business_id, source, source_event_id, canonical_source_event_id, \
                        occurred_at, payload, event_version, event_type, is_removed, \
                        event_fingerprint, created_at \
                 FROM raw_event WHERE business_id = $1 AND source = $2",
            )
            .bind(business_id.0)
            .bind(source)
            .fetch_all(&mut *conn)
            .await
        } else {
            sqlx::query(
                "SELECT id, business_id, source, source_event_id, canonical_source_event_id, \
                        occurred_at, payload, event_version, event_type, is_removed, \
                        event_fingerprint, created_at \
                 FROM raw_event WHERE business_id = $1",
            )
            .bind(business_id.0)
            .fetch_all(&mut *conn)
            .await
        }
        .map_err(|e| FhError::Storage(e.to_string()))?;

        use sqlx::Row;
        rows.into_iter()
            .map(|row| {
                let event_type_str: String = row.try_get("event_type").map_err(|e| FhError::Storage(e.to_string()))?;
                let event_type = match event_type_str.as_str() {
                    "added" => EventType::Added,
                    "modified" => EventType::Modified,
                    "removed" => EventType::Removed,
                    other => return Err(FhError::Storage(format!("unknown event_type {other}"))),
                };
                Ok(RawEvent {
                    id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    source: row.try_get("source").map_err(|e| FhError::Storage(e.to_string()))?,
                    source_event_id: row.try_get("source_event_id").map_err(|e| FhError::Storage(e.to_string()))?,
                    canonical_source_event_id: row
                        .try_get("canonical_source_event_id")
                        .map_err(|e| FhError::Storage(e.to_string()))?,
                    occurred_at: row.try_get("occurred_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    payload: row.try_get("payload").map_err(|e| FhError::Storage(e.to_string()))?,
                    event_version: row.try_get("event_version").map_err(|e| FhError::Storage(e.to_string()))?,
                    event_type,
                    is_removed: row.try_get("is_removed").map_err(|e| FhError::Storage(e.to_string()))?,
                    event_fingerprint: row
                        .try_get("event_fingerprint")
                        .map_err(|e| FhError::Storage(e.to_string()))?,
                    created_at: row.try_get("created_at").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn event(version: i64, occurred: DateTime<Utc>, source_event_id: &str, removed: bool) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            business_id: BusinessId::new(),
            source: "plaid".into(),
            source_event_id: source_event_id.into(),
            canonical_source_event_id: "tx1".into(),
            occurred_at: occurred,
            payload: json!({}),
            event_version: version,
            event_type: if removed { EventType::Removed } else { EventType::Modified },
            is_removed: removed,
            event_fingerprint: "f".into(),
            created_at: occurred,
        }
    }

    #[test]
    fn latest_version_wins() {
        let rows = vec![
            event(1, at(2024, 1, 1), "tx1", false),
            event(2, at(2024, 1, 2), "tx1", false),
        ];
        let latest = latest_per_canonical(&rows, false);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].event_version, 2);
    }

    #[test]
    fn tombstone_removes_from_projection() {
        let rows = vec![
            event(1, at(2024, 1, 1), "tx1", false),
            event(2, at(2024, 1, 2), "tx1", false),
            event(3, at(2024, 1, 3), "tx1", true),
        ];
        assert_eq!(latest_per_canonical(&rows, false).len(), 0);
        assert_eq!(latest_per_canonical(&rows, true).len(), 1);
    }

    #[test]
    fn canonical_id_resolution_order() {
        let payload = json!({"meta": {"canonical_source_event_id": "meta-id"}});
        assert_eq!(resolve_canonical_id(None, &payload, "fallback"), "meta-id");

        let payload = json!({"transaction": {"transaction_id": "txn-id"}});
        assert_eq!(resolve_canonical_id(None, &payload, "fallback"), "txn-id");

        let payload = json!({});
        assert_eq!(resolve_canonical_id(None, &payload, "fallback"), "fallback");

        let payload = json!({"meta": {"canonical_source_event_id": "meta-id"}});
        assert_eq!(resolve_canonical_id(Some("explicit"), &payload, "fallback"), "explicit");
    }
}
