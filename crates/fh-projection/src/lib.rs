//! Computes the posted-transaction view from the raw event log
//! (`spec.md` §4.2, component B).
//!
//! The field rules below are written directly from the specification text
//! against a Plaid-shaped payload (the provider every other detector/ledger
//! example in this workspace assumes).

#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use fh_raw_events::{latest_per_canonical, RawEvent};
use fh_types::{BusinessId, Direction, Money};
use serde_json::Value;

/// One row of the posted-transaction view, `spec.md` §3's `PostedTransaction`.
#[derive(Debug, Clone)]
pub struct PostedTxn {
    /// Tenant.
    pub business_id: BusinessId,
    /// Stable id carried through from the raw event.
    pub source_event_id: String,
    /// Groups revisions of the same underlying transaction.
    pub canonical_source_event_id: String,
    /// Provider name.
    pub source: String,
    /// When the provider says it posted.
    pub occurred_at: DateTime<Utc>,
    /// Always non-negative.
    pub amount: Money,
    /// Which way the money moved.
    pub direction: Direction,
    /// `amount` if inflow, `-amount` if outflow.
    pub signed_amount: Money,
    /// Free-text description, best-effort.
    pub description: String,
    /// Counterparty/merchant name, if the provider carried one.
    pub counterparty: Option<String>,
    /// Normalized lookup key for vendor-grouping detectors, e.g. lowercased
    /// and punctuation-stripped counterparty.
    pub merchant_key: Option<String>,
    /// Provider-suggested category, used as a categorization hint only.
    pub category_hint: Option<String>,
}

/// Why a single raw event failed to project. Surfaces as
/// `ProcessingEventState{status: error}` in `fh-processing`, never drops the
/// rest of the projection.
#[derive(Debug, Clone)]
pub struct ProjectionError {
    /// The raw event's own id, for correlating with `ProcessingEventState`.
    pub source_event_id: String,
    /// Stable machine-readable reason.
    pub error_code: String,
    /// Human-readable detail.
    pub error_detail: String,
}

/// Lowercase, trim, and collapse a merchant/counterparty name into a stable
/// grouping key. Mirrors the normalization every vendor-keyed detector in
/// `fh-detectors` depends on for a stable `dimension_key`.
#[must_use]
pub fn normalize_vendor(raw: &str) -> String {
    let lower = raw.trim().to_lowercase();
    let mut key = String::with_capacity(lower.len());
    let mut last_was_space = false;
    for ch in lower.chars() {
        if ch.is_alphanumeric() {
            key.push(ch);
            last_was_space = false;
        } else if !last_was_space {
            key.push(' ');
            last_was_space = true;
        }
    }
    key.trim().to_string()
}

fn transaction_field<'a>(payload: &'a Value, key: &str) -> Option<&'a Value> {
    payload.get("transaction").and_then(|t| t.get(key))
}

fn parse_amount(payload: &Value) -> Option<f64> {
    transaction_field(payload, "amount").and_then(Value::as_f64)
}

fn parse_direction(payload: &Value, amount: f64) -> Direction {
    if let Some(explicit) = transaction_field(payload, "direction").and_then(Value::as_str) {
        match explicit {
            "inflow" => return Direction::Inflow,
            "outflow" => return Direction::Outflow,
            _ => {}
        }
    }
    // Plaid convention: a negative amount is money moving into the account.
    if amount < 0.0 {
        Direction::Inflow
    } else {
        Direction::Outflow
    }
}

fn parse_description(payload: &Value) -> String {
    transaction_field(payload, "description")
        .and_then(Value::as_str)
        .or_else(|| transaction_field(payload, "name").and_then(Value::as_str))
        .unwrap_or("")
        .to_string()
}

fn parse_counterparty(payload: &Value) -> Option<String> {
    transaction_field(payload, "counterparty")
        .and_then(Value::as_str)
        .or_else(|| transaction_field(payload, "merchant_name").and_then(Value::as_str))
        .map(str::to_string)
}

fn parse_category_hint(payload: &Value) -> Option<String> {
    if let Some(hint) = transaction_field(payload, "category_hint").and_then(Value::as_str) {
        return Some(hint.to_string());
    }
    transaction_field(payload, "personal_finance_category")
        .and_then(|pfc| pfc.get("primary"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Parse a single latest-per-canonical raw event into a posted row.
/// `None` on success path never happens; parse failures return `Err`.
pub fn parse_posted_txn(raw: &RawEvent) -> Result<PostedTxn, ProjectionError> {
    let amount = parse_amount(&raw.payload).ok_or_else(|| ProjectionError {
        source_event_id: raw.source_event_id.clone(),
        error_code: "missing_amount".to_string(),
        error_detail: "payload.transaction.amount is missing or not numeric".to_string(),
    })?;

    let direction = parse_direction(&raw.payload, amount);
    let amount = Money::from_f64(amount.abs());
    let signed_amount = match direction {
        Direction::Inflow => amount,
        Direction::Outflow => -amount,
    };

    let counterparty = parse_counterparty(&raw.payload);
    let merchant_key = counterparty.as_deref().map(normalize_vendor);

    Ok(PostedTxn {
        business_id: raw.business_id,
        source_event_id: raw.source_event_id.clone(),
        canonical_source_event_id: raw.canonical_source_event_id.clone(),
        source: raw.source.clone(),
        occurred_at: raw.occurred_at,
        amount,
        direction,
        signed_amount,
        description: parse_description(&raw.payload),
        counterparty,
        merchant_key,
        category_hint: parse_category_hint(&raw.payload),
    })
}

/// Full `spec.md` §4.2 pipeline: dedupe to the latest revision per canonical
/// id, drop tombstones, parse each survivor, and return both the successfully
/// projected rows (stably sorted by `(occurred_at, source_event_id)`) and any
/// per-row failures.
#[must_use]
pub fn project(raw_events: &[RawEvent]) -> (Vec<PostedTxn>, Vec<ProjectionError>) {
    let latest = latest_per_canonical(raw_events, false);
    let mut txns = Vec::with_capacity(latest.len());
    let mut errors = Vec::new();
    for row in latest {
        match parse_posted_txn(row) {
            Ok(txn) => txns.push(txn),
            Err(e) => errors.push(e),
        }
    }
    txns.sort_by(|a, b| (a.occurred_at, &a.source_event_id).cmp(&(b.occurred_at, &b.source_event_id)));
    (txns, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fh_types::EventType;
    use serde_json::json;
    use uuid::Uuid;

    fn raw(source_event_id: &str, amount: f64, occurred: DateTime<Utc>) -> RawEvent {
        RawEvent {
            id: Uuid::new_v4(),
            business_id: BusinessId::new(),
            source: "plaid".into(),
            source_event_id: source_event_id.into(),
            canonical_source_event_id: source_event_id.into(),
            occurred_at: occurred,
            payload: json!({"transaction": {"amount": amount, "merchant_name": "Acme Corp"}}),
            event_version: 1,
            event_type: EventType::Added,
            is_removed: false,
            event_fingerprint: "f".into(),
            created_at: occurred,
        }
    }

    #[test]
    fn negative_amount_is_inflow() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let txn = parse_posted_txn(&raw("tx1", -10.0, at)).unwrap();
        assert_eq!(txn.direction, Direction::Inflow);
        assert_eq!(txn.signed_amount, Money::from_f64(10.0));
    }

    #[test]
    fn positive_amount_is_outflow() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let txn = parse_posted_txn(&raw("tx1", 25.0, at)).unwrap();
        assert_eq!(txn.direction, Direction::Outflow);
        assert_eq!(txn.signed_amount, Money::from_f64(-25.0));
        assert_eq!(txn.merchant_key.as_deref(), Some("acme corp"));
    }

    #[test]
    fn missing_amount_is_a_projection_error_not_a_panic() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut row = raw("tx1", 0.0, at);
        row.payload = json!({"transaction": {}});
        let err = parse_posted_txn(&row).unwrap_err();
        assert_eq!(err.error_code, "missing_amount");
    }
}
