//! Persistent signal-state table and its lifecycle (`spec.md` §4.6,
//! component F). `fh-detectors` runs pure, stateless detector functions
//! every cycle; this crate reconciles that transient output onto the
//! durable `health_signal_state` table, so a signal that keeps firing on
//! the same dimension keeps the same row instead of growing duplicates.
//!
//! `reconcile` is designed directly from `spec.md` §4.6's text: upsert every
//! detected signal, resolve everything not re-detected. The cooldown-gate
//! check is a cursor comparison, generalized into [`should_skip_reconcile`]
//! so `fh-tick`'s `Pulse` and this crate share one definition of "nothing
//! changed".

#![deny(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use fh_detectors::DetectedSignal;
use fh_types::{BusinessId, FhError, Severity, SignalId, SignalStatus};
use serde_json::Value;
use sqlx::PgConnection;

/// A persisted row of `health_signal_state` (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct HealthSignalState {
    /// Tenant.
    pub business_id: BusinessId,
    /// `"{signal_type}:{fingerprint}"`.
    pub signal_id: SignalId,
    /// Stable detector name.
    pub signal_type: String,
    /// Dimension-derived hash, the second half of `signal_id`.
    pub fingerprint: String,
    /// Lifecycle status.
    pub status: SignalStatus,
    /// Current severity (may rise/fall as the detector re-fires).
    pub severity: Severity,
    /// Short human title.
    pub title: String,
    /// One or two sentence summary.
    pub summary: String,
    /// `window`, stats and `ledger_anchors`, as emitted by the detector.
    pub payload_json: Value,
    /// First time this `signal_id` was seen.
    pub detected_at: DateTime<Utc>,
    /// Most recent time the detector re-fired on this dimension.
    pub last_seen_at: DateTime<Utc>,
    /// Set when the signal transitions to `resolved`, cleared on reopen.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Last time any field on this row changed.
    pub updated_at: DateTime<Utc>,
}

impl HealthSignalState {
    fn from_detected(business_id: BusinessId, detected: &DetectedSignal, now: DateTime<Utc>) -> Self {
        Self {
            business_id,
            signal_id: SignalId(format!("{}:{}", detected.signal_type, detected.fingerprint)),
            signal_type: detected.signal_type.clone(),
            fingerprint: detected.fingerprint.clone(),
            status: SignalStatus::Open,
            severity: detected.severity,
            title: detected.title.clone(),
            summary: detected.summary.clone(),
            payload_json: detected.payload.clone(),
            detected_at: now,
            last_seen_at: now,
            resolved_at: None,
            updated_at: now,
        }
    }

    fn as_json(&self) -> Value {
        serde_json::json!({
            "signal_id": self.signal_id.0,
            "signal_type": self.signal_type,
            "status": status_str(self.status),
            "severity": severity_str(self.severity),
            "title": self.title,
            "summary": self.summary,
            "detected_at": self.detected_at.to_rfc3339(),
            "last_seen_at": self.last_seen_at.to_rfc3339(),
            "resolved_at": self.resolved_at.map(|t| t.to_rfc3339()),
        })
    }
}

fn status_str(status: SignalStatus) -> &'static str {
    match status {
        SignalStatus::Open => "open",
        SignalStatus::InProgress => "in_progress",
        SignalStatus::Resolved => "resolved",
        SignalStatus::Ignored => "ignored",
    }
}

fn status_from_str(s: &str) -> Result<SignalStatus, FhError> {
    match s {
        "open" => Ok(SignalStatus::Open),
        "in_progress" => Ok(SignalStatus::InProgress),
        "resolved" => Ok(SignalStatus::Resolved),
        "ignored" => Ok(SignalStatus::Ignored),
        other => Err(FhError::Validation(format!("unknown signal status {other}"))),
    }
}

fn severity_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "info",
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::Warning => "warning",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn severity_from_str(s: &str) -> Result<Severity, FhError> {
    match s {
        "info" => Ok(Severity::Info),
        "low" => Ok(Severity::Low),
        "medium" => Ok(Severity::Medium),
        "warning" => Ok(Severity::Warning),
        "high" => Ok(Severity::High),
        "critical" => Ok(Severity::Critical),
        other => Err(FhError::Validation(format!("unknown severity {other}"))),
    }
}

/// One audit entry `reconcile`/`update_status` wants written, still
/// unpersisted — the caller writes it via `fh_audit::log_audit_event`
/// inside the same transaction as the state change.
#[derive(Debug, Clone)]
pub struct PendingAudit {
    /// `"signal_detected"` / `"signal_updated"` / `"signal_resolved"` /
    /// `"signal_status_changed"`.
    pub kind: &'static str,
    /// State before the change, `None` for a brand-new row.
    pub before: Option<Value>,
    /// State after the change.
    pub after: Value,
}

/// Pure result of [`reconcile`]: the full post-reconciliation row set plus
/// the audit entries the transition produced. No I/O.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    /// Every row that should now exist, in signal-id order.
    pub rows: Vec<HealthSignalState>,
    /// Audit entries to persist alongside the rows.
    pub audit: Vec<PendingAudit>,
}

/// `spec.md` §4.6's `Reconcile`, the pure half: given the currently
/// persisted rows and this cycle's detector output, compute the full next
/// state. Detected signals upsert; persisted rows not re-detected resolve
/// (unless already `ignored`/`resolved`).
#[must_use]
pub fn reconcile(
    business_id: BusinessId,
    existing: &[HealthSignalState],
    detected: &[DetectedSignal],
    now: DateTime<Utc>,
) -> ReconcileOutcome {
    use std::collections::HashMap;

    let mut by_id: HashMap<String, HealthSignalState> =
        existing.iter().map(|row| (row.signal_id.0.clone(), row.clone())).collect();
    let mut audit = Vec::new();
    let detected_ids: std::collections::HashSet<String> = detected
        .iter()
        .map(|d| format!("{}:{}", d.signal_type, d.fingerprint))
        .collect();

    for d in detected {
        let id = format!("{}:{}", d.signal_type, d.fingerprint);
        match by_id.get(&id).cloned() {
            None => {
                let row = HealthSignalState::from_detected(business_id, d, now);
                audit.push(PendingAudit {
                    kind: "signal_detected",
                    before: None,
                    after: row.as_json(),
                });
                by_id.insert(id, row);
            }
            Some(mut row) => {
                let before = row.as_json();
                row.severity = d.severity;
                row.title = d.title.clone();
                row.summary = d.summary.clone();
                row.payload_json = d.payload.clone();
                row.last_seen_at = now;
                row.updated_at = now;
                let kind = match row.status {
                    SignalStatus::Resolved => {
                        row.status = SignalStatus::Open;
                        row.resolved_at = None;
                        "signal_updated"
                    }
                    SignalStatus::Ignored => "signal_updated",
                    _ => "signal_updated",
                };
                audit.push(PendingAudit {
                    kind,
                    before: Some(before),
                    after: row.as_json(),
                });
                by_id.insert(id, row);
            }
        }
    }

    for row in by_id.values_mut() {
        if detected_ids.contains(&row.signal_id.0) {
            continue;
        }
        if matches!(row.status, SignalStatus::Open | SignalStatus::InProgress) {
            let before = row.as_json();
            row.status = SignalStatus::Resolved;
            row.resolved_at = Some(now);
            row.updated_at = now;
            audit.push(PendingAudit {
                kind: "signal_resolved",
                before: Some(before),
                after: row.as_json(),
            });
        }
    }

    let mut rows: Vec<HealthSignalState> = by_id.into_values().collect();
    rows.sort_by(|a, b| a.signal_id.0.cmp(&b.signal_id.0));
    ReconcileOutcome { rows, audit }
}

/// `spec.md` §4.6's cooldown gate, shared with `fh-tick`'s `Pulse`
/// (§4.13 step 2): skip a reconcile cycle when the newest event cursor is
/// unchanged and the last pulse was recent, unless the caller forces it.
#[must_use]
pub fn should_skip_reconcile(
    newest_cursor: Option<(DateTime<Utc>, &str)>,
    last_cursor: Option<(DateTime<Utc>, &str)>,
    now: DateTime<Utc>,
    last_pulse_at: Option<DateTime<Utc>>,
    force_run: bool,
) -> bool {
    if force_run {
        return false;
    }
    let cursor_unchanged = match (newest_cursor, last_cursor) {
        (Some(a), Some(b)) => a.0 == b.0 && a.1 == b.1,
        (None, None) => true,
        _ => false,
    };
    let recently_pulsed = last_pulse_at.is_some_and(|t| now - t < Duration::minutes(10));
    cursor_unchanged && recently_pulsed
}

/// `spec.md` §4.6's user-driven `UpdateStatus`. Pure: the caller persists
/// the returned row and audit entry.
pub fn update_status(
    mut row: HealthSignalState,
    next: SignalStatus,
    now: DateTime<Utc>,
) -> (HealthSignalState, PendingAudit) {
    let before = row.as_json();
    row.status = next;
    row.resolved_at = if matches!(next, SignalStatus::Resolved) { Some(now) } else { None };
    row.updated_at = now;
    let after = row.as_json();
    (
        row,
        PendingAudit {
            kind: "signal_status_changed",
            before: Some(before),
            after,
        },
    )
}

/// Repository wrapping `health_signal_state`.
pub struct SignalRepo;

impl SignalRepo {
    /// Fetch every persisted row for a business, ordered by `signal_id`.
    pub async fn fetch_all(conn: &mut PgConnection, business_id: BusinessId) -> Result<Vec<HealthSignalState>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT business_id, signal_id, signal_type, fingerprint, status, severity, title, \
                    summary, payload_json, detected_at, last_seen_at, resolved_at, updated_at \
             FROM health_signal_state WHERE business_id = $1 ORDER BY signal_id ASC",
        )
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
                let severity_str: String = row.try_get("severity").map_err(|e| FhError::Storage(e.to_string()))?;
                Ok(HealthSignalState {
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    signal_id: SignalId(row.try_get("signal_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    signal_type: row.try_get("signal_type").map_err(|e| FhError::Storage(e.to_string()))?,
                    fingerprint: row.try_get("fingerprint").map_err(|e| FhError::Storage(e.to_string()))?,
                    status: status_from_str(&status_str)?,
                    severity: severity_from_str(&severity_str)?,
                    title: row.try_get("title").map_err(|e| FhError::Storage(e.to_string()))?,
                    summary: row.try_get("summary").map_err(|e| FhError::Storage(e.to_string()))?,
                    payload_json: row.try_get("payload_json").map_err(|e| FhError::Storage(e.to_string()))?,
                    detected_at: row.try_get("detected_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    last_seen_at: row.try_get("last_seen_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    resolved_at: row.try_get("resolved_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    updated_at: row.try_get("updated_at").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    /// Fetch one row by signal id, if present.
    pub async fn fetch_one(
        conn: &mut PgConnection,
        business_id: BusinessId,
        signal_id: &SignalId,
    ) -> Result<Option<HealthSignalState>, FhError> {
        Ok(Self::fetch_all(conn, business_id)
            .await?
            .into_iter()
            .find(|row| &row.signal_id == signal_id))
    }

    /// Upsert a single row (insert or full-column update), keyed on
    /// `(business_id, signal_id)`.
    pub async fn upsert(conn: &mut PgConnection, row: &HealthSignalState) -> Result<(), FhError> {
        sqlx::query(
            "INSERT INTO health_signal_state \
             (business_id, signal_id, signal_type, fingerprint, status, severity, title, summary, \
              payload_json, detected_at, last_seen_at, resolved_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
             ON CONFLICT (business_id, signal_id) DO UPDATE SET \
               status = EXCLUDED.status, severity = EXCLUDED.severity, title = EXCLUDED.title, \
               summary = EXCLUDED.summary, payload_json = EXCLUDED.payload_json, \
               last_seen_at = EXCLUDED.last_seen_at, resolved_at = EXCLUDED.resolved_at, \
               updated_at = EXCLUDED.updated_at",
        )
        .bind(row.business_id.0)
        .bind(&row.signal_id.0)
        .bind(&row.signal_type)
        .bind(&row.fingerprint)
        .bind(status_str(row.status))
        .bind(severity_str(row.severity))
        .bind(&row.title)
        .bind(&row.summary)
        .bind(&row.payload_json)
        .bind(row.detected_at)
        .bind(row.last_seen_at)
        .bind(row.resolved_at)
        .bind(row.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Fetch the current rows, reconcile against this cycle's detector output,
/// persist every changed/new row and write the matching audit entries — all
/// inside the caller's transaction. This is what `fh-tick`'s `Pulse` calls
/// once per bucket; the cooldown gate ([`should_skip_reconcile`]) is checked
/// by the caller before getting here.
pub async fn reconcile_and_persist(
    conn: &mut PgConnection,
    business_id: BusinessId,
    detected: &[DetectedSignal],
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, FhError> {
    let existing = SignalRepo::fetch_all(conn, business_id).await?;
    let outcome = reconcile(business_id, &existing, detected, now);
    for row in &outcome.rows {
        SignalRepo::upsert(conn, row).await?;
    }
    for entry in &outcome.audit {
        fh_audit::log_audit_event(conn, business_id, entry.kind, entry.before.clone(), Some(entry.after.clone()), now).await?;
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn detected(signal_type: &str, fingerprint: &str, severity: Severity) -> DetectedSignal {
        DetectedSignal {
            signal_type: signal_type.to_string(),
            fingerprint: fingerprint.to_string(),
            domain: fh_types::Domain::Expense,
            severity,
            title: "t".into(),
            summary: "s".into(),
            payload: json!({}),
            ledger_anchors: vec![],
        }
    }

    #[test]
    fn new_signal_opens() {
        let outcome = reconcile(
            BusinessId::new(),
            &[],
            &[detected("expense_creep_by_vendor", "f1", Severity::Medium)],
            at(2024, 1, 1),
        );
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(outcome.rows[0].status, SignalStatus::Open);
        assert_eq!(outcome.audit.len(), 1);
        assert_eq!(outcome.audit[0].kind, "signal_detected");
    }

    #[test]
    fn undetected_open_signal_resolves() {
        let business_id = BusinessId::new();
        let existing = vec![HealthSignalState {
            business_id,
            signal_id: SignalId::new("expense_creep_by_vendor", "f1"),
            signal_type: "expense_creep_by_vendor".into(),
            fingerprint: "f1".into(),
            status: SignalStatus::Open,
            severity: Severity::Medium,
            title: "t".into(),
            summary: "s".into(),
            payload_json: json!({}),
            detected_at: at(2024, 1, 1),
            last_seen_at: at(2024, 1, 1),
            resolved_at: None,
            updated_at: at(2024, 1, 1),
        }];
        let outcome = reconcile(business_id, &existing, &[], at(2024, 1, 5));
        assert_eq!(outcome.rows[0].status, SignalStatus::Resolved);
        assert_eq!(outcome.rows[0].resolved_at, Some(at(2024, 1, 5)));
        assert_eq!(outcome.audit[0].kind, "signal_resolved");
    }

    #[test]
    fn ignored_signal_stays_ignored_when_undetected() {
        let business_id = BusinessId::new();
        let existing = vec![HealthSignalState {
            business_id,
            signal_id: SignalId::new("expense_creep_by_vendor", "f1"),
            signal_type: "expense_creep_by_vendor".into(),
            fingerprint: "f1".into(),
            status: SignalStatus::Ignored,
            severity: Severity::Medium,
            title: "t".into(),
            summary: "s".into(),
            payload_json: json!({}),
            detected_at: at(2024, 1, 1),
            last_seen_at: at(2024, 1, 1),
            resolved_at: None,
            updated_at: at(2024, 1, 1),
        }];
        let outcome = reconcile(business_id, &existing, &[], at(2024, 1, 5));
        assert_eq!(outcome.rows[0].status, SignalStatus::Ignored);
        assert!(outcome.audit.is_empty());
    }

    #[test]
    fn resolved_signal_reopens_when_redetected() {
        let business_id = BusinessId::new();
        let existing = vec![HealthSignalState {
            business_id,
            signal_id: SignalId::new("expense_creep_by_vendor", "f1"),
            signal_type: "expense_creep_by_vendor".into(),
            fingerprint: "f1".into(),
            status: SignalStatus::Resolved,
            severity: Severity::Medium,
            title: "t".into(),
            summary: "s".into(),
            payload_json: json!({}),
            detected_at: at(2024, 1, 1),
            last_seen_at: at(2024, 1, 1),
            resolved_at: Some(at(2024, 1, 3)),
            updated_at: at(2024, 1, 3),
        }];
        let outcome = reconcile(
            business_id,
            &existing,
            &[detected("expense_creep_by_vendor", "f1", Severity::High)],
            at(2024, 1, 5),
        );
        assert_eq!(outcome.rows[0].status, SignalStatus::Open);
        assert_eq!(outcome.rows[0].resolved_at, None);
        assert_eq!(outcome.rows[0].severity, Severity::High);
    }

    #[test]
    fn cooldown_gate_skips_unless_forced() {
        let cursor = (at(2024, 1, 1), "tx1");
        assert!(should_skip_reconcile(
            Some(cursor),
            Some(cursor),
            at(2024, 1, 1) + Duration::minutes(5),
            Some(at(2024, 1, 1)),
            false
        ));
        assert!(!should_skip_reconcile(
            Some(cursor),
            Some(cursor),
            at(2024, 1, 1) + Duration::minutes(5),
            Some(at(2024, 1, 1)),
            true
        ));
        assert!(!should_skip_reconcile(
            Some(cursor),
            Some((at(2024, 1, 2), "tx2")),
            at(2024, 1, 1) + Duration::minutes(5),
            Some(at(2024, 1, 1)),
            false
        ));
    }
}
