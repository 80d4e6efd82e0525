//! Idempotent per-event normalize/categorize pipeline (`spec.md` §4.4,
//! component D).
//!
//! The per-event normalize/categorize state machine below is written
//! directly from `spec.md` §4.4's text: idempotent re-entry skips
//! already-terminal states, and errors on one event never block sibling
//! events in the same batch.

#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use fh_domain::{CategorizationSource, CategoryRule};
use fh_projection::{project, PostedTxn, ProjectionError};
use fh_raw_events::RawEvent;
use fh_types::{BusinessId, FhError};
use sqlx::PgConnection;
use std::collections::HashMap;
use uuid::Uuid;

/// Terminal/intermediate status of one event's processing, `spec.md` §3's
/// `ProcessingEventState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    /// Never processed.
    New,
    /// Amount/direction/vendor parsed, not yet categorized.
    Normalized,
    /// A `TxnCategorization` row exists.
    Categorized,
    /// Normalization failed; terminal, not retried automatically.
    Error,
}

impl ProcessingStatus {
    fn as_str(self) -> &'static str {
        match self {
            ProcessingStatus::New => "new",
            ProcessingStatus::Normalized => "normalized",
            ProcessingStatus::Categorized => "categorized",
            ProcessingStatus::Error => "error",
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, ProcessingStatus::Categorized | ProcessingStatus::Error)
    }

    fn from_str(s: &str) -> Self {
        match s {
            "normalized" => ProcessingStatus::Normalized,
            "categorized" => ProcessingStatus::Categorized,
            "error" => ProcessingStatus::Error,
            _ => ProcessingStatus::New,
        }
    }
}

/// Counts returned by [`process_new_events`], also what the
/// `processing_completed` audit entry's `after_state` carries.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ProcessCounts {
    /// Candidates examined this call.
    pub processed: usize,
    /// Reached (or already sat at) `normalized`.
    pub normalized: usize,
    /// Reached (or already sat at) `categorized`.
    pub categorized: usize,
    /// Reached (or already sat at) `error`.
    pub errored: usize,
    /// Already terminal before this call; skipped, not reprocessed.
    pub skipped: usize,
}

/// Resolve a category for one posted transaction, preferring an explicit
/// `CategoryRule` match (highest `priority` first, matched against
/// description or merchant key) and falling back to the business's
/// provider-supplied category-hint mapping.
#[must_use]
pub fn categorize_txn(
    txn: &PostedTxn,
    rules: &[CategoryRule],
    hint_map: &HashMap<String, Uuid>,
) -> Option<(Uuid, CategorizationSource, f64)> {
    let mut sorted_rules: Vec<&CategoryRule> = rules.iter().collect();
    sorted_rules.sort_by(|a, b| b.priority.cmp(&a.priority));

    for rule in sorted_rules {
        let needle = rule.match_text.to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let haystack_hits = txn.description.to_lowercase().contains(&needle)
            || txn
                .merchant_key
                .as_deref()
                .is_some_and(|key| key.contains(&needle));
        if haystack_hits {
            return Some((rule.category_id, CategorizationSource::Rule, 1.0));
        }
    }

    if let Some(hint) = &txn.category_hint {
        if let Some(category_id) = hint_map.get(hint) {
            return Some((*category_id, CategorizationSource::VendorMap, 0.8));
        }
    }

    None
}

/// Fetch candidate raw events, project them, and drive each candidate's
/// `ProcessingEventState` to `normalized`/`categorized`/`error`, skipping
/// already-terminal rows. Emits `processing_started`/`processing_completed`
/// audit entries with before/after counts; per-event errors are captured in
/// `ProcessingEventState` and the running count, never raised to the caller.
pub async fn process_new_events(
    conn: &mut PgConnection,
    business_id: BusinessId,
    source_event_ids: Option<&[String]>,
    rules: &[CategoryRule],
    hint_map: &HashMap<String, Uuid>,
    now: DateTime<Utc>,
) -> Result<ProcessCounts, FhError> {
    let raw_events = RawEventRepoFacade::fetch_all(conn, business_id).await?;
    let (txns, proj_errors) = project(&raw_events);

    let existing = fetch_existing_states(conn, business_id).await?;

    let mut counts = ProcessCounts::default();

    fh_audit::log_audit_event(
        conn,
        business_id,
        "processing_started",
        None,
        Some(serde_json::json!({"candidate_count": txns.len() + proj_errors.len()})),
        now,
    )
    .await?;

    for txn in &txns {
        if !wanted(source_event_ids, &txn.source_event_id) {
            continue;
        }
        let status = existing
            .get(&txn.source_event_id)
            .copied()
            .unwrap_or(ProcessingStatus::New);
        if status.is_terminal() {
            counts.skipped += 1;
            continue;
        }
        counts.processed += 1;

        match categorize_txn(txn, rules, hint_map) {
            Some((category_id, source, confidence)) => {
                upsert_categorization(conn, business_id, &txn.source_event_id, category_id, source, confidence, now).await?;
                upsert_state(conn, business_id, &txn.source_event_id, ProcessingStatus::Categorized, None, None, now).await?;
                counts.categorized += 1;
            }
            None => {
                upsert_state(conn, business_id, &txn.source_event_id, ProcessingStatus::Normalized, None, None, now).await?;
                counts.normalized += 1;
            }
        }
    }

    for err in &proj_errors {
        if !wanted(source_event_ids, &err.source_event_id) {
            continue;
        }
        let status = existing
            .get(&err.source_event_id)
            .copied()
            .unwrap_or(ProcessingStatus::New);
        if status.is_terminal() {
            counts.skipped += 1;
            continue;
        }
        counts.processed += 1;
        upsert_state(
            conn,
            business_id,
            &err.source_event_id,
            ProcessingStatus::Error,
            Some(&err.error_code),
            Some(&err.error_detail),
            now,
        )
        .await?;
        fh_audit::log_audit_event(
            conn,
            business_id,
            "processing_error",
            None,
            Some(serde_json::json!({
                "source_event_id": err.source_event_id,
                "error_code": err.error_code,
                "error_detail": err.error_detail,
            })),
            now,
        )
        .await?;
        counts.errored += 1;
    }

    fh_audit::log_audit_event(
        conn,
        business_id,
        "processing_completed",
        None,
        Some(serde_json::to_value(counts).unwrap_or_default()),
        now,
    )
    .await?;

    Ok(counts)
}

fn wanted(filter: Option<&[String]>, source_event_id: &str) -> bool {
    match filter {
        None => true,
        Some(ids) => ids.iter().any(|id| id == source_event_id),
    }
}

async fn fetch_existing_states(
    conn: &mut PgConnection,
    business_id: BusinessId,
) -> Result<HashMap<String, ProcessingStatus>, FhError> {
    use sqlx::Row;
    let rows = sqlx::query("SELECT source_event_id, status FROM processing_event_state WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        let source_event_id: String = row.try_get("source_event_id").map_err(|e| FhError::Storage(e.to_string()))?;
        let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
        map.insert(source_event_id, ProcessingStatus::from_str(&status));
    }
    Ok(map)
}

#[allow(clippy::too_many_arguments)]
async fn upsert_state(
    conn: &mut PgConnection,
    business_id: BusinessId,
    source_event_id: &str,
    status: ProcessingStatus,
    error_code: Option<&str>,
    error_detail: Option<&str>,
    processed_at: DateTime<Utc>,
) -> Result<(), FhError> {
    sqlx::query(
        "INSERT INTO processing_event_state (business_id, source_event_id, status, error_code, error_detail, processed_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (business_id, source_event_id) DO UPDATE SET \
         status = EXCLUDED.status, error_code = EXCLUDED.error_code, \
         error_detail = EXCLUDED.error_detail, processed_at = EXCLUDED.processed_at",
    )
    .bind(business_id.0)
    .bind(source_event_id)
    .bind(status.as_str())
    .bind(error_code)
    .bind(error_detail)
    .bind(processed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(())
}

async fn upsert_categorization(
    conn: &mut PgConnection,
    business_id: BusinessId,
    source_event_id: &str,
    category_id: Uuid,
    source: CategorizationSource,
    confidence: f64,
    created_at: DateTime<Utc>,
) -> Result<(), FhError> {
    let source_str = match source {
        CategorizationSource::Manual => "manual",
        CategorizationSource::Rule => "rule",
        CategorizationSource::VendorMap => "vendor_map",
        CategorizationSource::Sim => "sim",
    };
    sqlx::query(
        "INSERT INTO txn_categorization (business_id, source_event_id, category_id, source, confidence, note, created_at) \
         VALUES ($1, $2, $3, $4, $5, NULL, $6) \
         ON CONFLICT (business_id, source_event_id) DO UPDATE SET \
         category_id = EXCLUDED.category_id, source = EXCLUDED.source, confidence = EXCLUDED.confidence",
    )
    .bind(business_id.0)
    .bind(source_event_id)
    .bind(category_id)
    .bind(source_str)
    .bind(confidence)
    .bind(created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(())
}

/// Thin facade so this crate doesn't need to know `fh_raw_events`'s
/// connection-borrowing signature at two call sites.
struct RawEventRepoFacade;

impl RawEventRepoFacade {
    async fn fetch_all(conn: &mut PgConnection, business_id: BusinessId) -> Result<Vec<RawEvent>, FhError> {
        fh_raw_events::RawEventRepo::fetch_all(conn, business_id, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fh_types::Direction;

    fn txn_with(description: &str, merchant_key: Option<&str>, hint: Option<&str>) -> PostedTxn {
        PostedTxn {
            business_id: BusinessId::new(),
            source_event_id: "tx1".into(),
            canonical_source_event_id: "tx1".into(),
            source: "plaid".into(),
            occurred_at: Utc::now(),
            amount: fh_types::Money::from_f64(10.0),
            direction: Direction::Outflow,
            signed_amount: fh_types::Money::from_f64(-10.0),
            description: description.into(),
            counterparty: None,
            merchant_key: merchant_key.map(str::to_string),
            category_hint: hint.map(str::to_string),
        }
    }

    #[test]
    fn rule_match_beats_hint_map() {
        let category_id = Uuid::new_v4();
        let rule = CategoryRule {
            id: Uuid::new_v4(),
            business_id: BusinessId::new(),
            match_text: "acme".into(),
            category_id,
            priority: 10,
        };
        let txn = txn_with("payment to acme corp", Some("acme corp"), Some("rent"));
        let hint_map = HashMap::new();
        let result = categorize_txn(&txn, &[rule], &hint_map).unwrap();
        assert_eq!(result.0, category_id);
        assert_eq!(result.1, CategorizationSource::Rule);
    }

    #[test]
    fn falls_back_to_hint_map_when_no_rule_matches() {
        let category_id = Uuid::new_v4();
        let mut hint_map = HashMap::new();
        hint_map.insert("rent".to_string(), category_id);
        let txn = txn_with("monthly payment", None, Some("rent"));
        let result = categorize_txn(&txn, &[], &hint_map).unwrap();
        assert_eq!(result.0, category_id);
        assert_eq!(result.1, CategorizationSource::VendorMap);
    }

    #[test]
    fn no_match_leaves_uncategorized() {
        let txn = txn_with("mystery charge", None, None);
        assert!(categorize_txn(&txn, &[], &HashMap::new()).is_none());
    }
}
