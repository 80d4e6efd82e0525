//! Aggregates signals into cases, runs the case status machine and
//! escalation rules (`spec.md` §4.7, component G).
//!
//! The transitions graph, severity-bump rule and attach invariant follow
//! `spec.md` §4.7 directly. `computed_sla_breached`, `computed_plan_overdue`
//! and `computed_open_signal_count_30d` below are designed directly from
//! `spec.md` §4.7/§4.8's text: `computed_plan_overdue` reuses the
//! escalation rule's 14-day threshold, `computed_sla_breached` fires past
//! 7 days of no activity (the same SLA `WorkEngine`'s due-date ladder
//! anchors on), and `computed_open_signal_count_30d` counts `CaseSignal`
//! attachments in the last 30 days. `compute_risk_snapshot`'s formula is
//! its own design: `Σ severity_rank(open_signal) * 5 + stale_action_count
//! * 3`, clamped to `[0, 100]`.
//!
//! Ledger anchors have no dedicated table in this schema; `AttachLedgerAnchor`/
//! `DetachLedgerAnchor` are modeled as the timeline itself — the case's
//! current anchor set is whichever `anchor_key`s have an unmatched
//! `LEDGER_ANCHOR_ATTACHED` event, the same append-only-log-is-truth
//! design `fh-audit` already uses for every other transition.

#![deny(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use fh_types::{BusinessId, CaseId, CaseStatus, Domain, FhError, Severity, SignalId, SignalStatus};
use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

/// A persisted `case_record` row.
#[derive(Debug, Clone)]
pub struct Case {
    /// Surrogate key.
    pub id: CaseId,
    /// Tenant.
    pub business_id: BusinessId,
    /// Aggregation domain.
    pub domain: Domain,
    /// Lifecycle status.
    pub status: CaseStatus,
    /// `signal_type` of the signal that opened this case.
    pub primary_signal_type: String,
    /// Case-scale severity (`low`/`medium`/`high`/`critical`).
    pub severity: Severity,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Business-wide risk score at last recompute, `[0, 100]`.
    pub risk_score_snapshot: f64,
    pub assigned_to: Option<String>,
    pub next_review_at: Option<DateTime<Utc>>,
}

/// A `case_signal` attachment row.
#[derive(Debug, Clone)]
pub struct CaseSignalLink {
    pub business_id: BusinessId,
    pub signal_id: SignalId,
    pub case_id: CaseId,
    pub attached_at: DateTime<Utc>,
}

/// A `case_event` timeline row.
#[derive(Debug, Clone)]
pub struct CaseEvent {
    pub id: Uuid,
    pub case_id: CaseId,
    pub business_id: BusinessId,
    pub kind: String,
    pub payload_json: Value,
    pub occurred_at: DateTime<Utc>,
}

fn domain_str(domain: Domain) -> &'static str {
    match domain {
        Domain::Liquidity => "liquidity",
        Domain::Revenue => "revenue",
        Domain::Expense => "expense",
        Domain::Timing => "timing",
        Domain::Concentration => "concentration",
        Domain::Hygiene => "hygiene",
        Domain::Unknown => "unknown",
    }
}

fn domain_from_str(s: &str) -> Result<Domain, FhError> {
    Ok(match s {
        "liquidity" => Domain::Liquidity,
        "revenue" => Domain::Revenue,
        "expense" => Domain::Expense,
        "timing" => Domain::Timing,
        "concentration" => Domain::Concentration,
        "hygiene" => Domain::Hygiene,
        "unknown" => Domain::Unknown,
        other => return Err(FhError::Validation(format!("unknown domain {other}"))),
    })
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

fn status_from_str(s: &str) -> Result<CaseStatus, FhError> {
    Ok(match s {
        "open" => CaseStatus::Open,
        "monitoring" => CaseStatus::Monitoring,
        "escalated" => CaseStatus::Escalated,
        "resolved" => CaseStatus::Resolved,
        "dismissed" => CaseStatus::Dismissed,
        "reopened" => CaseStatus::Reopened,
        other => return Err(FhError::Validation(format!("unknown case status {other}"))),
    })
}

fn case_severity_str(severity: Severity) -> &'static str {
    match severity {
        Severity::Low | Severity::Info => "low",
        Severity::Medium | Severity::Warning => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

fn case_severity_from_str(s: &str) -> Result<Severity, FhError> {
    Ok(match s {
        "low" => Severity::Low,
        "medium" => Severity::Medium,
        "high" => Severity::High,
        "critical" => Severity::Critical,
        other => return Err(FhError::Validation(format!("unknown case severity {other}"))),
    })
}

fn severity_rank(severity: Severity) -> i64 {
    match severity {
        Severity::Info => 0,
        Severity::Low => 1,
        Severity::Medium => 2,
        Severity::Warning => 3,
        Severity::High => 4,
        Severity::Critical => 5,
    }
}

fn case_json(case: &Case) -> Value {
    json!({
        "id": case.id.0,
        "domain": domain_str(case.domain),
        "status": status_str(case.status),
        "severity": case_severity_str(case.severity),
        "risk_score_snapshot": case.risk_score_snapshot,
        "last_activity_at": case.last_activity_at.to_rfc3339(),
    })
}

/// Requested transition a caller (UI action, `EvaluateEscalation`, ...)
/// wants applied, validated against `CaseStatus::allowed_transitions`.
pub fn validate_transition(from: CaseStatus, to: CaseStatus) -> Result<(), FhError> {
    if from.allowed_transitions().contains(&to) {
        Ok(())
    } else {
        Err(FhError::Validation(format!("case cannot transition from {from:?} to {to:?}")))
    }
}

/// Repository wrapping `case_record` / `case_signal` / `case_event`.
pub struct CaseRepo;

impl CaseRepo {
    fn row_to_case(row: &sqlx::postgres::PgRow) -> Result<Case, FhError> {
        use sqlx::Row;
        let domain: String = row.try_get("domain").map_err(|e| FhError::Storage(e.to_string()))?;
        let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
        let severity: String = row.try_get("severity").map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(Case {
            id: CaseId(row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?),
            business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
            domain: domain_from_str(&domain)?,
            status: status_from_str(&status)?,
            primary_signal_type: row.try_get("primary_signal_type").map_err(|e| FhError::Storage(e.to_string()))?,
            severity: case_severity_from_str(&severity)?,
            opened_at: row.try_get("opened_at").map_err(|e| FhError::Storage(e.to_string()))?,
            last_activity_at: row.try_get("last_activity_at").map_err(|e| FhError::Storage(e.to_string()))?,
            closed_at: row.try_get("closed_at").map_err(|e| FhError::Storage(e.to_string()))?,
            risk_score_snapshot: row.try_get("risk_score_snapshot").map_err(|e| FhError::Storage(e.to_string()))?,
            assigned_to: row.try_get("assigned_to").map_err(|e| FhError::Storage(e.to_string()))?,
            next_review_at: row.try_get("next_review_at").map_err(|e| FhError::Storage(e.to_string()))?,
        })
    }

    /// The open (`open|monitoring|escalated`) case for `(business_id, domain)`
    /// with the earliest `opened_at`, tie-broken by `id` (`spec.md` §4.7 step 1).
    pub async fn find_open_case_for_domain(
        conn: &mut PgConnection,
        business_id: BusinessId,
        domain: Domain,
    ) -> Result<Option<Case>, FhError> {
        let row = sqlx::query(
            "SELECT * FROM case_record WHERE business_id = $1 AND domain = $2 \
             AND status IN ('open', 'monitoring', 'escalated') \
             ORDER BY opened_at ASC, id ASC LIMIT 1",
        )
        .bind(business_id.0)
        .bind(domain_str(domain))
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        row.as_ref().map(Self::row_to_case).transpose()
    }

    /// Fetch one case by id.
    pub async fn fetch_case(conn: &mut PgConnection, case_id: CaseId) -> Result<Case, FhError> {
        let row = sqlx::query("SELECT * FROM case_record WHERE id = $1")
            .bind(case_id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?
            .ok_or_else(|| FhError::NotFound(format!("case {case_id}")))?;
        Self::row_to_case(&row)
    }

    /// Insert a brand-new case.
    pub async fn insert_case(conn: &mut PgConnection, case: &Case) -> Result<(), FhError> {
        sqlx::query(
            "INSERT INTO case_record \
             (id, business_id, domain, status, primary_signal_type, severity, opened_at, \
              last_activity_at, closed_at, risk_score_snapshot, assigned_to, next_review_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(case.id.0)
        .bind(case.business_id.0)
        .bind(domain_str(case.domain))
        .bind(status_str(case.status))
        .bind(&case.primary_signal_type)
        .bind(case_severity_str(case.severity))
        .bind(case.opened_at)
        .bind(case.last_activity_at)
        .bind(case.closed_at)
        .bind(case.risk_score_snapshot)
        .bind(&case.assigned_to)
        .bind(case.next_review_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Persist every mutable field of an existing case.
    pub async fn update_case(conn: &mut PgConnection, case: &Case) -> Result<(), FhError> {
        sqlx::query(
            "UPDATE case_record SET status = $2, severity = $3, last_activity_at = $4, \
             closed_at = $5, risk_score_snapshot = $6, assigned_to = $7, next_review_at = $8 \
             WHERE id = $1",
        )
        .bind(case.id.0)
        .bind(status_str(case.status))
        .bind(case_severity_str(case.severity))
        .bind(case.last_activity_at)
        .bind(case.closed_at)
        .bind(case.risk_score_snapshot)
        .bind(&case.assigned_to)
        .bind(case.next_review_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Fetch the case a signal is attached to, if any.
    pub async fn fetch_signal_link(
        conn: &mut PgConnection,
        business_id: BusinessId,
        signal_id: &SignalId,
    ) -> Result<Option<CaseSignalLink>, FhError> {
        use sqlx::Row;
        let row = sqlx::query("SELECT * FROM case_signal WHERE business_id = $1 AND signal_id = $2")
            .bind(business_id.0)
            .bind(&signal_id.0)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        row.map(|row| {
            Ok(CaseSignalLink {
                business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                signal_id: SignalId(row.try_get("signal_id").map_err(|e| FhError::Storage(e.to_string()))?),
                case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
                attached_at: row.try_get("attached_at").map_err(|e| FhError::Storage(e.to_string()))?,
            })
        })
        .transpose()
    }

    /// Attach a signal to a case. Caller must already have checked the
    /// uniqueness invariant via [`fetch_signal_link`](Self::fetch_signal_link).
    pub async fn insert_signal_link(conn: &mut PgConnection, link: &CaseSignalLink) -> Result<(), FhError> {
        sqlx::query("INSERT INTO case_signal (business_id, signal_id, case_id, attached_at) VALUES ($1, $2, $3, $4)")
            .bind(link.business_id.0)
            .bind(&link.signal_id.0)
            .bind(link.case_id.0)
            .bind(link.attached_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Every signal attached to a case.
    pub async fn list_signal_links(conn: &mut PgConnection, case_id: CaseId) -> Result<Vec<CaseSignalLink>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT * FROM case_signal WHERE case_id = $1")
            .bind(case_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                Ok(CaseSignalLink {
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    signal_id: SignalId(row.try_get("signal_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    attached_at: row.try_get("attached_at").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    /// Append a timeline event.
    pub async fn insert_case_event(
        conn: &mut PgConnection,
        case_id: CaseId,
        business_id: BusinessId,
        kind: &str,
        payload: Value,
        occurred_at: DateTime<Utc>,
    ) -> Result<CaseEvent, FhError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO case_event (id, case_id, business_id, kind, payload_json, occurred_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(case_id.0)
        .bind(business_id.0)
        .bind(kind)
        .bind(&payload)
        .bind(occurred_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(CaseEvent {
            id,
            case_id,
            business_id,
            kind: kind.to_string(),
            payload_json: payload,
            occurred_at,
        })
    }

    /// Timeline for a case, ascending by `(occurred_at, id)`.
    pub async fn list_case_events(conn: &mut PgConnection, case_id: CaseId) -> Result<Vec<CaseEvent>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT * FROM case_event WHERE case_id = $1 ORDER BY occurred_at ASC, id ASC")
            .bind(case_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                Ok(CaseEvent {
                    id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                    case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    kind: row.try_get("kind").map_err(|e| FhError::Storage(e.to_string()))?,
                    payload_json: row.try_get("payload_json").map_err(|e| FhError::Storage(e.to_string()))?,
                    occurred_at: row.try_get("occurred_at").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    /// `CaseSignal` rows attached within the last `days` days.
    pub async fn count_signals_attached_since(
        conn: &mut PgConnection,
        case_id: CaseId,
        since: DateTime<Utc>,
    ) -> Result<i64, FhError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM case_signal WHERE case_id = $1 AND attached_at >= $2")
            .bind(case_id.0)
            .bind(since)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(count)
    }

    /// Age in days of the oldest currently-`active` plan on this case, if any.
    pub async fn oldest_active_plan_age_days(conn: &mut PgConnection, case_id: CaseId, now: DateTime<Utc>) -> Result<Option<i64>, FhError> {
        let activated_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT COALESCE(activated_at, created_at) FROM plan WHERE case_id = $1 AND status = 'active' \
             ORDER BY COALESCE(activated_at, created_at) ASC LIMIT 1",
        )
        .bind(case_id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(activated_at.map(|t| (now - t).num_days()))
    }

    /// `COALESCE(activated_at, created_at)` of the oldest currently-active
    /// plan on a case, if any. Used by `WorkEngine`'s `PLAN_OVERDUE` due-date
    /// formula (`spec.md` §4.8), which needs the raw timestamp rather than
    /// [`Self::oldest_active_plan_age_days`]'s derived day count.
    pub async fn oldest_active_plan_created_at(conn: &mut PgConnection, case_id: CaseId) -> Result<Option<DateTime<Utc>>, FhError> {
        sqlx::query_scalar(
            "SELECT COALESCE(activated_at, created_at) FROM plan WHERE case_id = $1 AND status = 'active' \
             ORDER BY COALESCE(activated_at, created_at) ASC LIMIT 1",
        )
        .bind(case_id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))
    }

    /// Every case in an aggregation-eligible status (`open`, `monitoring`,
    /// `escalated`) for a business, ordered `(severity desc, last_activity_at
    /// desc, opened_at asc, id asc)` — the order `RunTick` processes cases
    /// in.
    pub async fn list_active_for_business(conn: &mut PgConnection, business_id: BusinessId) -> Result<Vec<Case>, FhError> {
        let rows = sqlx::query(
            "SELECT * FROM case_record WHERE business_id = $1 AND status IN ('open', 'monitoring', 'escalated') \
             ORDER BY CASE severity WHEN 'critical' THEN 4 WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC, \
                      last_activity_at DESC, opened_at ASC, id ASC",
        )
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.iter().map(Self::row_to_case).collect()
    }

    /// Every case for a business regardless of status, same ordering as
    /// [`list_active_for_business`] plus resolved/dismissed cases trailing.
    pub async fn list_for_business(conn: &mut PgConnection, business_id: BusinessId) -> Result<Vec<Case>, FhError> {
        let rows = sqlx::query(
            "SELECT * FROM case_record WHERE business_id = $1 \
             ORDER BY CASE severity WHEN 'critical' THEN 4 WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC, \
                      last_activity_at DESC, opened_at ASC, id ASC",
        )
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.iter().map(Self::row_to_case).collect()
    }

    /// Count of `open` action items older than `staleness` (business-wide,
    /// used by [`compute_risk_snapshot`]).
    pub async fn count_stale_actions(conn: &mut PgConnection, business_id: BusinessId, now: DateTime<Utc>, staleness: Duration) -> Result<i64, FhError> {
        let threshold = now - staleness;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM action_item WHERE business_id = $1 AND status = 'open' AND created_at < $2",
        )
        .bind(business_id.0)
        .bind(threshold)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(count)
    }
}

/// `ComputeRiskSnapshot(business_id)`: a business-wide risk score in
/// `[0, 100]`, `Σ severity_rank(open_signal) * 5 + stale_action_count * 3`.
pub async fn compute_risk_snapshot(conn: &mut PgConnection, business_id: BusinessId, now: DateTime<Utc>) -> Result<f64, FhError> {
    let signals = fh_signals::SignalRepo::fetch_all(conn, business_id).await?;
    let severity_component: i64 = signals
        .iter()
        .filter(|s| matches!(s.status, SignalStatus::Open | SignalStatus::InProgress))
        .map(|s| severity_rank(s.severity) * 5)
        .sum();
    let stale_action_count = CaseRepo::count_stale_actions(conn, business_id, now, Duration::days(7)).await?;
    let raw = severity_component as f64 + stale_action_count as f64 * 3.0;
    Ok(raw.clamp(0.0, 100.0))
}

/// `AggregateSignal(business_id, signal_id, signal_type, domain, severity, occurred_at)`
/// (`spec.md` §4.7).
pub async fn aggregate_signal(
    conn: &mut PgConnection,
    business_id: BusinessId,
    signal_id: &SignalId,
    signal_type: &str,
    domain: Domain,
    severity: Severity,
    occurred_at: DateTime<Utc>,
) -> Result<CaseId, FhError> {
    let mut case = match CaseRepo::find_open_case_for_domain(conn, business_id, domain).await? {
        Some(case) => case,
        None => {
            let risk = compute_risk_snapshot(conn, business_id, occurred_at).await?;
            let case = Case {
                id: CaseId::new(),
                business_id,
                domain,
                status: CaseStatus::Open,
                primary_signal_type: signal_type.to_string(),
                severity: severity.to_case_scale(),
                opened_at: occurred_at,
                last_activity_at: occurred_at,
                closed_at: None,
                risk_score_snapshot: risk,
                assigned_to: None,
                next_review_at: None,
            };
            CaseRepo::insert_case(conn, &case).await?;
            CaseRepo::insert_case_event(conn, case.id, business_id, "CASE_CREATED", case_json(&case), occurred_at).await?;
            fh_audit::log_audit_event(conn, business_id, "case_created", None, Some(case_json(&case)), occurred_at).await?;
            case
        }
    };

    match CaseRepo::fetch_signal_link(conn, business_id, signal_id).await? {
        Some(link) if link.case_id == case.id => {}
        Some(link) => {
            return Err(FhError::case_signal_invariant(&signal_id.0, &link.case_id.to_string(), &case.id.to_string()));
        }
        None => {
            let link = CaseSignalLink {
                business_id,
                signal_id: signal_id.clone(),
                case_id: case.id,
                attached_at: occurred_at,
            };
            CaseRepo::insert_signal_link(conn, &link).await?;
            let before = case_json(&case);
            case.last_activity_at = occurred_at;
            let raised = severity.to_case_scale().max(case.severity);
            case.severity = raised;
            CaseRepo::update_case(conn, &case).await?;
            let payload = json!({"signal_id": signal_id.0, "signal_type": signal_type, "before": before, "after": case_json(&case)});
            CaseRepo::insert_case_event(conn, case.id, business_id, "SIGNAL_ATTACHED", payload.clone(), occurred_at).await?;
            fh_audit::log_audit_event(conn, business_id, "case_signal_attached", Some(before), Some(case_json(&case)), occurred_at).await?;
        }
    }

    evaluate_escalation(conn, case.id, occurred_at).await?;
    Ok(case.id)
}

/// One escalation rule's verdict (pure).
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationCandidate {
    pub rule: &'static str,
    pub payload: Value,
}

/// The three escalation rules, pure (`spec.md` §4.7). `signal_count_30d`
/// counts `CaseSignal` rows attached in the trailing 30 days,
/// `active_plan_age_days` is the oldest active plan's age if any plan is
/// active, `risk_delta` is `current_risk - case.risk_score_snapshot`.
#[must_use]
pub fn evaluate_escalation_rules(signal_count_30d: i64, active_plan_age_days: Option<i64>, risk_delta: f64) -> Vec<EscalationCandidate> {
    let mut out = Vec::new();
    if signal_count_30d >= 3 {
        out.push(EscalationCandidate {
            rule: "signal_volume_30d",
            payload: json!({"rule": "signal_volume_30d", "signal_count_30d": signal_count_30d}),
        });
    }
    if active_plan_age_days.is_some_and(|d| d > 14) {
        out.push(EscalationCandidate {
            rule: "plan_overdue",
            payload: json!({"rule": "plan_overdue", "active_plan_age_days": active_plan_age_days}),
        });
    }
    if risk_delta >= 15.0 {
        out.push(EscalationCandidate {
            rule: "risk_delta",
            payload: json!({"rule": "risk_delta", "risk_delta": risk_delta}),
        });
    }
    out
}

/// `EvaluateEscalation(case_id, now)`: runs the three rules and fires
/// `CASE_ESCALATED` for each newly-true one, de-duplicated against the
/// most recent escalation event carrying the same rule and payload.
pub async fn evaluate_escalation(conn: &mut PgConnection, case_id: CaseId, now: DateTime<Utc>) -> Result<Vec<EscalationCandidate>, FhError> {
    let case = CaseRepo::fetch_case(conn, case_id).await?;
    let signal_count_30d = CaseRepo::count_signals_attached_since(conn, case_id, now - Duration::days(30)).await?;
    let active_plan_age_days = CaseRepo::oldest_active_plan_age_days(conn, case_id, now).await?;
    let current_risk = compute_risk_snapshot(conn, case.business_id, now).await?;
    let risk_delta = current_risk - case.risk_score_snapshot;

    let candidates = evaluate_escalation_rules(signal_count_30d, active_plan_age_days, risk_delta);
    if candidates.is_empty() {
        return Ok(candidates);
    }

    let history = CaseRepo::list_case_events(conn, case_id).await?;
    let mut fired = Vec::new();
    for candidate in &candidates {
        let already_fired = history
            .iter()
            .rev()
            .filter(|event| event.kind == "CASE_ESCALATED")
            .find(|event| event.payload_json.get("rule").and_then(Value::as_str) == Some(candidate.rule))
            .is_some_and(|event| event.payload_json == candidate.payload);
        if already_fired {
            continue;
        }
        if validate_transition(case.status, CaseStatus::Escalated).is_ok() {
            let mut updated = case.clone();
            updated.status = CaseStatus::Escalated;
            updated.last_activity_at = now;
            CaseRepo::update_case(conn, &updated).await?;
        }
        CaseRepo::insert_case_event(conn, case_id, case.business_id, "CASE_ESCALATED", candidate.payload.clone(), now).await?;
        fh_audit::log_audit_event(conn, case.business_id, "case_escalated", None, Some(candidate.payload.clone()), now).await?;
        fired.push(candidate.clone());
    }
    Ok(fired)
}

/// The case's recomputed derived state (`spec.md` §4.7's `RecomputeCase`).
#[derive(Debug, Clone, PartialEq)]
pub struct CaseDerivedState {
    pub severity: Severity,
    pub risk_score: f64,
    pub computed_sla_breached: bool,
    pub computed_plan_overdue: bool,
    pub computed_open_signal_count_30d: i64,
}

/// Outcome of [`recompute_case`].
#[derive(Debug, Clone)]
pub struct RecomputeOutcome {
    pub derived: CaseDerivedState,
    /// `true` if `derived` differs from the persisted `severity`/`risk_score_snapshot`.
    pub changed: bool,
    /// `true` if the diff was actually applied (only meaningful when `apply` was requested).
    pub applied: bool,
}

/// `RecomputeCase(case_id, apply)`: recomputes severity (max of currently
/// open attached signals) and the business risk score, diffs against the
/// persisted row, and — if `apply` and the diff is non-empty — mutates the
/// case and emits a single `CASE_RECOMPUTE_APPLIED` event.
pub async fn recompute_case(conn: &mut PgConnection, case_id: CaseId, apply: bool, now: DateTime<Utc>) -> Result<RecomputeOutcome, FhError> {
    let case = CaseRepo::fetch_case(conn, case_id).await?;
    let links = CaseRepo::list_signal_links(conn, case_id).await?;
    let signals = fh_signals::SignalRepo::fetch_all(conn, case.business_id).await?;
    let attached_ids: std::collections::HashSet<&str> = links.iter().map(|l| l.signal_id.0.as_str()).collect();

    let open_severity = signals
        .iter()
        .filter(|s| attached_ids.contains(s.signal_id.0.as_str()))
        .filter(|s| matches!(s.status, SignalStatus::Open | SignalStatus::InProgress))
        .map(|s| s.severity.to_case_scale())
        .max();
    let severity = open_severity.unwrap_or(case.severity);

    let risk_score = compute_risk_snapshot(conn, case.business_id, now).await?;
    let computed_open_signal_count_30d = CaseRepo::count_signals_attached_since(conn, case_id, now - Duration::days(30)).await?;
    let computed_sla_breached = case.status.is_open_for_aggregation() && (now - case.last_activity_at) > Duration::days(7);
    let computed_plan_overdue = CaseRepo::oldest_active_plan_age_days(conn, case_id, now).await?.is_some_and(|d| d > 14);

    let derived = CaseDerivedState {
        severity,
        risk_score,
        computed_sla_breached,
        computed_plan_overdue,
        computed_open_signal_count_30d,
    };
    let changed = derived.severity != case.severity || (derived.risk_score - case.risk_score_snapshot).abs() > f64::EPSILON;

    let mut applied = false;
    if apply && changed {
        let before = case_json(&case);
        let mut updated = case.clone();
        updated.severity = derived.severity;
        updated.risk_score_snapshot = derived.risk_score;
        updated.last_activity_at = now;
        CaseRepo::update_case(conn, &updated).await?;
        let payload = json!({
            "before": before,
            "after": case_json(&updated),
            "computed_sla_breached": derived.computed_sla_breached,
            "computed_plan_overdue": derived.computed_plan_overdue,
            "computed_open_signal_count_30d": derived.computed_open_signal_count_30d,
        });
        CaseRepo::insert_case_event(conn, case_id, case.business_id, "CASE_RECOMPUTE_APPLIED", payload.clone(), now).await?;
        fh_audit::log_audit_event(conn, case.business_id, "case_recompute_applied", Some(before), Some(payload), now).await?;
        applied = true;
    }

    Ok(RecomputeOutcome { derived, changed, applied })
}

/// Whether `anchor_key` is currently attached: the most recent
/// `LEDGER_ANCHOR_ATTACHED`/`LEDGER_ANCHOR_DETACHED` event for it, if any,
/// determines the current state.
fn anchor_is_attached(events: &[CaseEvent], anchor_key: &str) -> bool {
    events
        .iter()
        .rev()
        .find(|e| {
            (e.kind == "LEDGER_ANCHOR_ATTACHED" || e.kind == "LEDGER_ANCHOR_DETACHED")
                && e.payload_json.get("anchor_key").and_then(Value::as_str) == Some(anchor_key)
        })
        .is_some_and(|e| e.kind == "LEDGER_ANCHOR_ATTACHED")
}

/// `AttachLedgerAnchor(case_id, anchor_key, payload_json?)`: idempotent —
/// re-attaching an already-attached anchor is a no-op.
pub async fn attach_ledger_anchor(conn: &mut PgConnection, case_id: CaseId, anchor_key: &str, payload: Option<Value>, now: DateTime<Utc>) -> Result<bool, FhError> {
    let case = CaseRepo::fetch_case(conn, case_id).await?;
    let events = CaseRepo::list_case_events(conn, case_id).await?;
    if anchor_is_attached(&events, anchor_key) {
        return Ok(false);
    }
    let event_payload = json!({"anchor_key": anchor_key, "payload": payload.unwrap_or(Value::Null)});
    CaseRepo::insert_case_event(conn, case_id, case.business_id, "LEDGER_ANCHOR_ATTACHED", event_payload.clone(), now).await?;
    fh_audit::log_audit_event(conn, case.business_id, "case_ledger_anchor_attached", None, Some(event_payload), now).await?;
    Ok(true)
}

/// `DetachLedgerAnchor(case_id, anchor_key)`: no-op if not attached.
pub async fn detach_ledger_anchor(conn: &mut PgConnection, case_id: CaseId, anchor_key: &str, now: DateTime<Utc>) -> Result<bool, FhError> {
    let case = CaseRepo::fetch_case(conn, case_id).await?;
    let events = CaseRepo::list_case_events(conn, case_id).await?;
    if !anchor_is_attached(&events, anchor_key) {
        return Ok(false);
    }
    let event_payload = json!({"anchor_key": anchor_key});
    CaseRepo::insert_case_event(conn, case_id, case.business_id, "LEDGER_ANCHOR_DETACHED", event_payload.clone(), now).await?;
    fh_audit::log_audit_event(conn, case.business_id, "case_ledger_anchor_detached", None, Some(event_payload), now).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_transitions_match_state_machine() {
        assert!(validate_transition(CaseStatus::Open, CaseStatus::Escalated).is_ok());
        assert!(validate_transition(CaseStatus::Resolved, CaseStatus::Escalated).is_err());
        assert!(validate_transition(CaseStatus::Resolved, CaseStatus::Reopened).is_ok());
    }

    #[test]
    fn escalation_rules_fire_independently() {
        let none = evaluate_escalation_rules(1, None, 0.0);
        assert!(none.is_empty());

        let volume = evaluate_escalation_rules(3, None, 0.0);
        assert_eq!(volume.len(), 1);
        assert_eq!(volume[0].rule, "signal_volume_30d");

        let overdue = evaluate_escalation_rules(0, Some(15), 0.0);
        assert_eq!(overdue[0].rule, "plan_overdue");

        let not_overdue = evaluate_escalation_rules(0, Some(14), 0.0);
        assert!(not_overdue.is_empty());

        let risk = evaluate_escalation_rules(0, None, 15.0);
        assert_eq!(risk[0].rule, "risk_delta");

        let all = evaluate_escalation_rules(5, Some(20), 20.0);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn anchor_attach_detach_roundtrip() {
        let business_id = BusinessId::new();
        let case_id = CaseId::new();
        let events = vec![
            CaseEvent {
                id: Uuid::new_v4(),
                case_id,
                business_id,
                kind: "LEDGER_ANCHOR_ATTACHED".into(),
                payload_json: json!({"anchor_key": "a1"}),
                occurred_at: Utc::now(),
            },
            CaseEvent {
                id: Uuid::new_v4(),
                case_id,
                business_id,
                kind: "LEDGER_ANCHOR_DETACHED".into(),
                payload_json: json!({"anchor_key": "a1"}),
                occurred_at: Utc::now(),
            },
        ];
        assert!(!anchor_is_attached(&events, "a1"));
        assert!(!anchor_is_attached(&events, "a2"));
        assert!(anchor_is_attached(&events[..1], "a1"));
    }
}
