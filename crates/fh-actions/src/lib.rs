//! Generates and suppresses action items (`spec.md` §4.9, component I).
//!
//! The four candidate generators and the idempotency-key format carry the
//! constants named in `spec.md` §4.9 (cooldown days, integration staleness
//! hours, vendor variance ratio/floor thresholds) plus the reopen and
//! material-change helpers the suppression pipeline needs. The persistence
//! floor and flapping suppression rules are layered in front of the
//! reopen/cooldown logic; the minimum signal age (24h) those rules check
//! against is this crate's own design decision.
//!
//! `action_item` carries no `title`/`summary`/`due_at` columns — `spec.md`
//! §3's `ActionItem` entity doesn't list them either, so title/summary are
//! folded into `rationale_json` at persistence time instead of a schema
//! change.

#![deny(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use fh_signals::HealthSignalState;
use fh_types::{ActionStatus, ActionType, BusinessId, FhError, SignalStatus};
use serde_json::{json, Value};
use sqlx::PgConnection;
use std::collections::HashMap;
use uuid::Uuid;

/// Minimum age a signal-sourced candidate's source signal must have before
/// an `investigate_anomaly` action is allowed to fire, satisfying
/// `spec.md` §4.9's persistence-floor rule.
pub const PERSISTENCE_MIN_AGE: Duration = Duration::hours(24);

/// Cooldown window after an action resolves before it can reopen without a
/// material change, `spec.md` §4.9.
pub const ACTION_COOLDOWN_DAYS: i64 = 14;
/// How stale `last_sync_at` must be before an integration counts as needing
/// a `sync_integration` action.
pub const INTEGRATION_STALE_HOURS: i64 = 12;
/// Vendor-variance ratio threshold for `review_vendor`.
pub const VENDOR_VARIANCE_RATIO: f64 = 0.5;
/// Minimum absolute delta (with a baseline) for `review_vendor` to fire.
pub const VENDOR_MIN_DELTA: f64 = 200.0;
/// Minimum recent-window total (no baseline) for `review_vendor` to fire.
pub const VENDOR_MIN_RECENT: f64 = 300.0;
/// Flapping window: ≥3 signal status transitions within this many days suppresses.
pub const FLAPPING_WINDOW_DAYS: i64 = 14;

fn action_type_str(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::FixMapping => "fix_mapping",
        ActionType::InvestigateAnomaly => "investigate_anomaly",
        ActionType::SyncIntegration => "sync_integration",
        ActionType::ReviewVendor => "review_vendor",
    }
}

fn action_type_from_str(s: &str) -> Result<ActionType, FhError> {
    Ok(match s {
        "fix_mapping" => ActionType::FixMapping,
        "investigate_anomaly" => ActionType::InvestigateAnomaly,
        "sync_integration" => ActionType::SyncIntegration,
        "review_vendor" => ActionType::ReviewVendor,
        other => return Err(FhError::Validation(format!("unknown action type {other}"))),
    })
}

fn status_str(status: ActionStatus) -> &'static str {
    match status {
        ActionStatus::Open => "open",
        ActionStatus::Done => "done",
        ActionStatus::Ignored => "ignored",
        ActionStatus::Snoozed => "snoozed",
    }
}

fn status_from_str(s: &str) -> Result<ActionStatus, FhError> {
    Ok(match s {
        "open" => ActionStatus::Open,
        "done" => ActionStatus::Done,
        "ignored" => ActionStatus::Ignored,
        "snoozed" => ActionStatus::Snoozed,
        other => return Err(FhError::Validation(format!("unknown action status {other}"))),
    })
}

fn idempotency_key(business_id: BusinessId, action_type: &str, source_signal_id: Option<&str>, window_start: Option<&str>, window_end: Option<&str>, dimension_key: Option<&str>) -> String {
    format!(
        "{}:{}:{}:{}:{}:{}",
        business_id,
        action_type,
        source_signal_id.unwrap_or("none"),
        window_start.unwrap_or("none"),
        window_end.unwrap_or("none"),
        dimension_key.unwrap_or("none"),
    )
}

/// One generated action candidate, pre-merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCandidate {
    pub action_type: ActionType,
    pub title: String,
    pub summary: String,
    pub priority: i32,
    pub idempotency_key: String,
    pub source_signal_id: Option<String>,
    pub evidence_json: Value,
    pub rationale_json: Value,
}

/// A provider connection row (mirrors `integration_connection`; passed in
/// rather than queried here so this crate stays storage-shape-agnostic).
#[derive(Debug, Clone)]
pub struct IntegrationSnapshot {
    pub provider: String,
    pub connected: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// A minimal outflow line, enough to drive vendor-variance aggregation —
/// deliberately smaller than `fh_projection::PostedTxn` so this crate
/// doesn't need to depend on the full ledger stack.
#[derive(Debug, Clone)]
pub struct OutflowLine {
    pub occurred_at: DateTime<Utc>,
    pub vendor: String,
    pub amount: f64,
}

/// Everything the four generators read, assembled by the caller once per
/// `Generate` cycle.
pub struct ActionsContext<'a> {
    pub business_id: BusinessId,
    pub now: DateTime<Utc>,
    pub uncategorized_count: i64,
    pub sample_uncategorized_event_ids: &'a [String],
    pub open_signals: &'a [HealthSignalState],
    pub integrations: &'a [IntegrationSnapshot],
    /// All outflow lines in the trailing 90 days, ascending by time.
    pub outflows_90d: &'a [OutflowLine],
    /// `signal_id -> count` of audit-log transitions within the flapping
    /// window (`spec.md` §4.9's flapping rule), from
    /// [`count_signal_transitions`]. A signal absent from this map is
    /// treated as having zero transitions.
    pub flapping_transition_counts: &'a HashMap<String, i64>,
}

fn vendor_of(description: &str) -> String {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Generator 1: uncategorized backlog (`spec.md` §4.9.1).
#[must_use]
pub fn uncategorized_candidates(ctx: &ActionsContext<'_>) -> Vec<ActionCandidate> {
    if ctx.uncategorized_count <= 0 {
        return vec![];
    }
    let window_end = ctx.now.format("%Y-%m-%d").to_string();
    let evidence = json!({
        "uncategorized_count": ctx.uncategorized_count,
        "sample_source_event_ids": ctx.sample_uncategorized_event_ids,
        "window": {"start": "all", "end": window_end},
    });
    let rationale = json!({
        "why_now": "New transactions arrived without a category mapping.",
        "thresholds": {"min_uncategorized": 1},
    });
    vec![ActionCandidate {
        action_type: ActionType::FixMapping,
        title: "Categorize new transactions".to_string(),
        summary: format!("{} transactions need category mappings before the ledger is complete.", ctx.uncategorized_count),
        priority: 4,
        idempotency_key: idempotency_key(ctx.business_id, "fix_mapping", None, Some("all"), Some(&window_end), Some("uncategorized")),
        source_signal_id: None,
        evidence_json: evidence,
        rationale_json: rationale,
    }]
}

fn ledger_anchors_of(payload: &Value) -> Vec<Value> {
    payload.get("ledger_anchors").and_then(Value::as_array).cloned().unwrap_or_default()
}

/// Generator 2: open signals carrying ledger anchors (`spec.md` §4.9.2).
#[must_use]
pub fn signal_candidates(ctx: &ActionsContext<'_>) -> Vec<ActionCandidate> {
    let mut out = Vec::new();
    for row in ctx.open_signals.iter().filter(|s| s.status == SignalStatus::Open) {
        let anchors = ledger_anchors_of(&row.payload_json);
        if anchors.is_empty() {
            continue;
        }
        let domain = fh_signals_domain_hint(&row.signal_type);
        let severity = format!("{:?}", row.severity).to_lowercase();
        let title = match (&domain, severity.as_str()) {
            (Some(d), sev) if !sev.is_empty() => format!("Investigate {sev} {d} anomaly"),
            (Some(d), _) => format!("Investigate {d} anomaly"),
            (None, sev) if !sev.is_empty() => format!("Investigate {sev} anomaly"),
            _ => "Investigate signal".to_string(),
        };
        let window = row.payload_json.get("window").cloned().unwrap_or(Value::Null);
        let window_start = window.get("start").and_then(Value::as_str).map(str::to_string);
        let window_end = window.get("end").and_then(Value::as_str).map(str::to_string);
        let evidence = json!({
            "signal_id": row.signal_id.0,
            "signal_type": row.signal_type,
            "signal_severity": severity,
            "signal_summary": row.summary,
            "ledger_anchors": anchors,
            "explain_ref": {"path": format!("/api/signals/{}/{}/explain", ctx.business_id, row.signal_id.0)},
        });
        let rationale = json!({
            "why_now": "Signal is open with ledger anchors requiring review.",
            "baseline_window": row.payload_json.get("baseline_window"),
            "delta": row.payload_json.get("delta"),
        });
        out.push(ActionCandidate {
            action_type: ActionType::InvestigateAnomaly,
            title,
            summary: if row.summary.is_empty() { row.title.clone() } else { row.summary.clone() },
            priority: if matches!(severity.as_str(), "high" | "critical") { 5 } else { 4 },
            idempotency_key: idempotency_key(
                ctx.business_id,
                "investigate_anomaly",
                Some(&row.signal_id.0),
                window_start.as_deref(),
                window_end.as_deref(),
                Some(domain.as_deref().unwrap_or(&row.signal_type)),
            ),
            source_signal_id: Some(row.signal_id.0.clone()),
            evidence_json: evidence,
            rationale_json: rationale,
        });
    }
    out
}

fn fh_signals_domain_hint(signal_type: &str) -> Option<String> {
    let prefix = signal_type.split('.').next().unwrap_or(signal_type);
    match prefix {
        "revenue" | "expense" | "timing" | "concentration" | "hygiene" | "liquidity" => Some(prefix.to_string()),
        _ => None,
    }
}

/// Generator 3: integration health (`spec.md` §4.9.3).
#[must_use]
pub fn integration_candidates(ctx: &ActionsContext<'_>) -> Vec<ActionCandidate> {
    let stale_threshold = ctx.now - Duration::hours(INTEGRATION_STALE_HOURS);
    let mut out = Vec::new();
    for row in ctx.integrations {
        let is_stale = row.last_sync_at.is_none_or(|t| t < stale_threshold);
        if !row.connected || is_stale {
            let reason = if !row.connected { "Integration is disconnected." } else { "Integration sync is stale." };
            let evidence = json!({
                "provider": row.provider,
                "connected": row.connected,
                "last_sync_at": row.last_sync_at.map(|t| t.to_rfc3339()),
                "stale_hours": INTEGRATION_STALE_HOURS,
            });
            let rationale = json!({
                "why_now": reason,
                "thresholds": {"stale_hours": INTEGRATION_STALE_HOURS},
            });
            out.push(ActionCandidate {
                action_type: ActionType::SyncIntegration,
                title: format!("Sync {} integration", row.provider),
                summary: reason.to_string(),
                priority: if !row.connected { 5 } else { 3 },
                idempotency_key: idempotency_key(ctx.business_id, "sync_integration", None, None, None, Some(&row.provider)),
                source_signal_id: None,
                evidence_json: evidence,
                rationale_json: rationale,
            });
        }
    }
    out
}

/// Generator 4: top-5 vendor spend variance (`spec.md` §4.9.4).
#[must_use]
pub fn vendor_variance_candidates(ctx: &ActionsContext<'_>) -> Vec<ActionCandidate> {
    let mut totals_90: HashMap<String, f64> = HashMap::new();
    for line in ctx.outflows_90d {
        *totals_90.entry(vendor_of(&line.vendor)).or_insert(0.0) += line.amount.abs();
    }
    let mut top_vendors: Vec<(String, f64)> = totals_90.into_iter().collect();
    top_vendors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    top_vendors.truncate(5);

    let recent_start = ctx.now - Duration::days(14);
    let recent_end = ctx.now;
    let baseline_start = ctx.now - Duration::days(74);
    let baseline_end = ctx.now - Duration::days(14);

    let aggregate = |vendor_name: &str, start: DateTime<Utc>, end: DateTime<Utc>| -> f64 {
        ctx.outflows_90d
            .iter()
            .filter(|l| l.occurred_at >= start && l.occurred_at < end)
            .filter(|l| vendor_of(&l.vendor) == vendor_name)
            .map(|l| l.amount.abs())
            .sum()
    };

    let mut out = Vec::new();
    for (vendor, _total_90) in top_vendors {
        let recent_total = aggregate(&vendor, recent_start, recent_end);
        let baseline_total = aggregate(&vendor, baseline_start, baseline_end);
        let delta = recent_total - baseline_total;
        let ratio = if baseline_total > 0.0 { Some(delta / baseline_total) } else { None };
        let high_variance = match ratio {
            Some(r) => r.abs() >= VENDOR_VARIANCE_RATIO && delta.abs() >= VENDOR_MIN_DELTA,
            None => recent_total >= VENDOR_MIN_RECENT,
        };
        if !high_variance {
            continue;
        }
        let evidence = json!({
            "vendor": vendor,
            "recent_total": recent_total,
            "baseline_total": baseline_total,
            "window": {
                "recent_start": recent_start.to_rfc3339(),
                "recent_end": recent_end.to_rfc3339(),
                "baseline_start": baseline_start.to_rfc3339(),
                "baseline_end": baseline_end.to_rfc3339(),
            },
        });
        let rationale = json!({
            "why_now": "Vendor spend deviated from baseline.",
            "delta": delta,
            "change_ratio": ratio,
            "thresholds": {"variance_ratio": VENDOR_VARIANCE_RATIO, "min_delta": VENDOR_MIN_DELTA, "min_recent": VENDOR_MIN_RECENT},
        });
        out.push(ActionCandidate {
            action_type: ActionType::ReviewVendor,
            title: format!("Review spend at {vendor}"),
            summary: format!("Spend in the last 14 days totaled {recent_total:.2}, versus {baseline_total:.2} in the prior 60 days."),
            priority: if ratio.is_some_and(|r| r.abs() >= 1.0) { 4 } else { 3 },
            idempotency_key: idempotency_key(ctx.business_id, "review_vendor", None, Some(&baseline_start.to_rfc3339()), Some(&recent_end.to_rfc3339()), Some(&vendor)),
            source_signal_id: None,
            evidence_json: evidence,
            rationale_json: rationale,
        });
    }
    out
}

/// All four generators, concatenated (order: uncategorized, signal, integration, vendor).
#[must_use]
pub fn generate_candidates(ctx: &ActionsContext<'_>) -> Vec<ActionCandidate> {
    let mut out = uncategorized_candidates(ctx);
    out.extend(signal_candidates(ctx));
    out.extend(integration_candidates(ctx));
    out.extend(vendor_variance_candidates(ctx));
    out
}

/// A persisted `action_item` row.
#[derive(Debug, Clone)]
pub struct ActionRow {
    pub id: Uuid,
    pub business_id: BusinessId,
    pub idempotency_key: String,
    pub action_type: ActionType,
    pub priority: i32,
    pub status: ActionStatus,
    pub source_signal_id: Option<String>,
    pub evidence_json: Value,
    pub rationale_json: Value,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_reason: Option<String>,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub assigned_to: Option<String>,
}

fn rationale_with_titles(candidate: &ActionCandidate) -> Value {
    let mut rationale = candidate.rationale_json.clone();
    if let Value::Object(map) = &mut rationale {
        map.insert("title".to_string(), json!(candidate.title));
        map.insert("summary".to_string(), json!(candidate.summary));
    }
    rationale
}

fn material_change(existing: &ActionRow, candidate: &ActionCandidate) -> bool {
    if existing.source_signal_id.is_some() && existing.source_signal_id.as_deref() == candidate.source_signal_id.as_deref() {
        let existing_severity = existing.evidence_json.get("signal_severity");
        let candidate_severity = candidate.evidence_json.get("signal_severity");
        if existing_severity != candidate_severity {
            return true;
        }
        let existing_anchors = existing.evidence_json.get("ledger_anchors");
        let candidate_anchors = candidate.evidence_json.get("ledger_anchors");
        if existing_anchors != candidate_anchors {
            return true;
        }
    }
    existing.rationale_json.get("summary") != Some(&json!(candidate.summary))
        || existing.priority != candidate.priority
        || existing.evidence_json != candidate.evidence_json
        || existing.rationale_json.get("why_now") != candidate.rationale_json.get("why_now")
}

/// Why a candidate did not produce or refresh a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    PersistenceMinAge,
    Flapping,
    CooldownAfterResolve,
    SnoozedNotDue,
}

impl SuppressReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SuppressReason::PersistenceMinAge => "persistence_min_age",
            SuppressReason::Flapping => "flapping",
            SuppressReason::CooldownAfterResolve => "cooldown_after_resolve",
            SuppressReason::SnoozedNotDue => "snoozed_not_due",
        }
    }
}

/// What to do with one candidate, decided purely.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionDecision {
    Create,
    RefreshInPlace,
    Reopen,
    Suppress(SuppressReason),
}

/// The suppression pipeline for one candidate (`spec.md` §4.9's ordered
/// rule list): idempotency refresh, then persistence floor, then flapping,
/// then cooldown-after-resolve.
#[must_use]
pub fn decide_action(
    existing: Option<&ActionRow>,
    candidate: &ActionCandidate,
    now: DateTime<Utc>,
    signal_age: Option<Duration>,
    is_flapping: bool,
) -> ActionDecision {
    if let Some(row) = existing {
        if row.status == ActionStatus::Open {
            return ActionDecision::RefreshInPlace;
        }
    }

    if candidate.source_signal_id.is_some() {
        if let Some(age) = signal_age {
            if age < PERSISTENCE_MIN_AGE {
                return ActionDecision::Suppress(SuppressReason::PersistenceMinAge);
            }
        }
        if is_flapping {
            return ActionDecision::Suppress(SuppressReason::Flapping);
        }
    }

    match existing {
        None => ActionDecision::Create,
        Some(row) => match row.status {
            ActionStatus::Snoozed => {
                if row.snoozed_until.is_some_and(|t| t > now) {
                    ActionDecision::Suppress(SuppressReason::SnoozedNotDue)
                } else {
                    ActionDecision::Reopen
                }
            }
            ActionStatus::Done | ActionStatus::Ignored => {
                if let Some(resolved_at) = row.resolved_at {
                    if now - resolved_at < Duration::days(ACTION_COOLDOWN_DAYS) && !material_change(row, candidate) {
                        return ActionDecision::Suppress(SuppressReason::CooldownAfterResolve);
                    }
                }
                ActionDecision::Reopen
            }
            ActionStatus::Open => ActionDecision::RefreshInPlace,
        },
    }
}

/// Repository wrapping `action_item`.
pub struct ActionRepo;

impl ActionRepo {
    fn row_from_sql(row: &sqlx::postgres::PgRow) -> Result<ActionRow, FhError> {
        use sqlx::Row;
        let action_type: String = row.try_get("action_type").map_err(|e| FhError::Storage(e.to_string()))?;
        let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(ActionRow {
            id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
            business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
            idempotency_key: row.try_get("idempotency_key").map_err(|e| FhError::Storage(e.to_string()))?,
            action_type: action_type_from_str(&action_type)?,
            priority: row.try_get("priority").map_err(|e| FhError::Storage(e.to_string()))?,
            status: status_from_str(&status)?,
            source_signal_id: row.try_get("source_signal_id").map_err(|e| FhError::Storage(e.to_string()))?,
            evidence_json: row.try_get("evidence_json").map_err(|e| FhError::Storage(e.to_string()))?,
            rationale_json: row.try_get("rationale_json").map_err(|e| FhError::Storage(e.to_string()))?,
            resolved_at: row.try_get("resolved_at").map_err(|e| FhError::Storage(e.to_string()))?,
            resolution_reason: row.try_get("resolution_reason").map_err(|e| FhError::Storage(e.to_string()))?,
            snoozed_until: row.try_get("snoozed_until").map_err(|e| FhError::Storage(e.to_string()))?,
            assigned_to: row.try_get("assigned_to").map_err(|e| FhError::Storage(e.to_string()))?,
        })
    }

    /// Every action item for a business.
    pub async fn list_for_business(conn: &mut PgConnection, business_id: BusinessId) -> Result<Vec<ActionRow>, FhError> {
        let rows = sqlx::query("SELECT * FROM action_item WHERE business_id = $1")
            .bind(business_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.iter().map(Self::row_from_sql).collect()
    }

    async fn insert(conn: &mut PgConnection, row: &ActionRow, now: DateTime<Utc>) -> Result<(), FhError> {
        sqlx::query(
            "INSERT INTO action_item \
             (id, business_id, idempotency_key, action_type, priority, status, source_signal_id, \
              evidence_json, rationale_json, resolved_at, resolution_reason, snoozed_until, assigned_to, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(row.id)
        .bind(row.business_id.0)
        .bind(&row.idempotency_key)
        .bind(action_type_str(row.action_type))
        .bind(row.priority)
        .bind(status_str(row.status))
        .bind(&row.source_signal_id)
        .bind(&row.evidence_json)
        .bind(&row.rationale_json)
        .bind(row.resolved_at)
        .bind(&row.resolution_reason)
        .bind(row.snoozed_until)
        .bind(&row.assigned_to)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn apply(conn: &mut PgConnection, id: Uuid, candidate: &ActionCandidate, rationale: &Value, reopen: bool) -> Result<(), FhError> {
        if reopen {
            sqlx::query(
                "UPDATE action_item SET priority = $2, source_signal_id = $3, evidence_json = $4, rationale_json = $5, \
                 status = 'open', resolution_reason = NULL, resolved_at = NULL, snoozed_until = NULL WHERE id = $1",
            )
            .bind(id)
            .bind(candidate.priority)
            .bind(&candidate.source_signal_id)
            .bind(&candidate.evidence_json)
            .bind(rationale)
            .execute(&mut *conn)
            .await
        } else {
            sqlx::query(
                "UPDATE action_item SET priority = $2, source_signal_id = $3, evidence_json = $4, rationale_json = $5 WHERE id = $1",
            )
            .bind(id)
            .bind(candidate.priority)
            .bind(&candidate.source_signal_id)
            .bind(&candidate.evidence_json)
            .bind(rationale)
            .execute(&mut *conn)
            .await
        }
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// `Resolve(action_id, status, reason?)`.
    pub async fn resolve(conn: &mut PgConnection, id: Uuid, status: ActionStatus, reason: Option<&str>, now: DateTime<Utc>) -> Result<(), FhError> {
        sqlx::query("UPDATE action_item SET status = $2, resolution_reason = $3, resolved_at = $4 WHERE id = $1")
            .bind(id)
            .bind(status_str(status))
            .bind(reason)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// `Snooze(action_id, until, reason?)`.
    pub async fn snooze(conn: &mut PgConnection, id: Uuid, until: DateTime<Utc>, reason: Option<&str>) -> Result<(), FhError> {
        sqlx::query("UPDATE action_item SET status = 'snoozed', snoozed_until = $2, resolution_reason = $3 WHERE id = $1")
            .bind(id)
            .bind(until)
            .bind(reason)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// `Assign(action_id, assigned_to?)`: sets or clears the free-text assignee.
    pub async fn assign(conn: &mut PgConnection, id: Uuid, assigned_to: Option<&str>) -> Result<(), FhError> {
        sqlx::query("UPDATE action_item SET assigned_to = $2 WHERE id = $1")
            .bind(id)
            .bind(assigned_to)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// `Assign(business_id, action_id, assigned_to?)`: each assignment emits an
/// audit row, the same pattern `fh-plans::assign` follows.
pub async fn assign(conn: &mut PgConnection, business_id: BusinessId, id: Uuid, assigned_to: Option<&str>, now: DateTime<Utc>) -> Result<(), FhError> {
    ActionRepo::assign(conn, id, assigned_to).await?;
    fh_audit::log_audit_event(
        conn,
        business_id,
        "action_assigned",
        None,
        Some(json!({"action_id": id, "assigned_to": assigned_to})),
        now,
    )
    .await?;
    Ok(())
}

/// Outcome of [`generate`].
#[derive(Debug, Clone, Default)]
pub struct GenerateOutcome {
    pub created_count: usize,
    pub updated_count: usize,
    pub suppressed_count: usize,
    pub suppression_reasons: HashMap<&'static str, usize>,
}

/// `Generate(business_id, now)`: candidates, merged against persisted rows
/// with the ordered suppression pipeline applied.
pub async fn generate(conn: &mut PgConnection, ctx: &ActionsContext<'_>) -> Result<GenerateOutcome, FhError> {
    let candidates = generate_candidates(ctx);
    let existing = ActionRepo::list_for_business(conn, ctx.business_id).await?;
    let mut outcome = GenerateOutcome::default();

    for candidate in &candidates {
        let existing_row = existing.iter().find(|row| row.idempotency_key == candidate.idempotency_key);

        let signal_age = candidate.source_signal_id.as_ref().and_then(|sid| {
            ctx.open_signals
                .iter()
                .find(|s| &s.signal_id.0 == sid)
                .map(|s| ctx.now - s.detected_at)
        });
        let is_flapping = candidate.source_signal_id.as_deref().is_some_and(|sid| {
            ctx.flapping_transition_counts.get(sid).copied().unwrap_or(0) >= 3
        });

        match decide_action(existing_row, candidate, ctx.now, signal_age, is_flapping) {
            ActionDecision::Create => {
                let row = ActionRow {
                    id: Uuid::new_v4(),
                    business_id: ctx.business_id,
                    idempotency_key: candidate.idempotency_key.clone(),
                    action_type: candidate.action_type,
                    priority: candidate.priority,
                    status: ActionStatus::Open,
                    source_signal_id: candidate.source_signal_id.clone(),
                    evidence_json: candidate.evidence_json.clone(),
                    rationale_json: rationale_with_titles(candidate),
                    resolved_at: None,
                    resolution_reason: None,
                    snoozed_until: None,
                    assigned_to: None,
                };
                ActionRepo::insert(conn, &row, ctx.now).await?;
                fh_audit::log_audit_event(conn, ctx.business_id, "action_created", None, Some(json!({"idempotency_key": candidate.idempotency_key})), ctx.now).await?;
                outcome.created_count += 1;
            }
            ActionDecision::RefreshInPlace => {
                if let Some(row) = existing_row {
                    ActionRepo::apply(conn, row.id, candidate, &rationale_with_titles(candidate), false).await?;
                    outcome.updated_count += 1;
                }
            }
            ActionDecision::Reopen => {
                if let Some(row) = existing_row {
                    ActionRepo::apply(conn, row.id, candidate, &rationale_with_titles(candidate), true).await?;
                    fh_audit::log_audit_event(conn, ctx.business_id, "action_reopened", None, Some(json!({"idempotency_key": candidate.idempotency_key})), ctx.now).await?;
                    outcome.updated_count += 1;
                }
            }
            ActionDecision::Suppress(reason) => {
                outcome.suppressed_count += 1;
                *outcome.suppression_reasons.entry(reason.as_str()).or_insert(0) += 1;
            }
        }
    }

    Ok(outcome)
}

/// Count `signal_status_changed`/`signal_detected`/`signal_resolved` audit
/// rows for one signal within `[since, now]` — the flapping check's data
/// source. Callers build a `signal_id -> count` map with this (one call per
/// candidate signal, window `[now - FLAPPING_WINDOW_DAYS, now]`) and pass it
/// to [`generate`] via `ActionsContext::flapping_transition_counts`.
pub async fn count_signal_transitions(conn: &mut PgConnection, business_id: BusinessId, signal_id: &str, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<i64, FhError> {
    let entries = fh_audit::list_audit_events(conn, business_id, since, now, Some("signal_")).await?;
    Ok(entries
        .iter()
        .filter(|e| {
            e.after_state
                .as_ref()
                .and_then(|v| v.get("signal_id"))
                .and_then(Value::as_str)
                == Some(signal_id)
        })
        .count() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(source_signal_id: Option<&str>) -> ActionCandidate {
        ActionCandidate {
            action_type: ActionType::InvestigateAnomaly,
            title: "t".into(),
            summary: "s".into(),
            priority: 4,
            idempotency_key: "k".into(),
            source_signal_id: source_signal_id.map(str::to_string),
            evidence_json: json!({}),
            rationale_json: json!({"why_now": "x"}),
        }
    }

    #[test]
    fn new_candidate_creates() {
        let now = Utc::now();
        let decision = decide_action(None, &candidate(None), now, None, false);
        assert_eq!(decision, ActionDecision::Create);
    }

    #[test]
    fn young_signal_suppressed_by_persistence_floor() {
        let now = Utc::now();
        let decision = decide_action(None, &candidate(Some("sig1")), now, Some(Duration::hours(1)), false);
        assert_eq!(decision, ActionDecision::Suppress(SuppressReason::PersistenceMinAge));
    }

    #[test]
    fn flapping_signal_suppressed() {
        let now = Utc::now();
        let decision = decide_action(None, &candidate(Some("sig1")), now, Some(Duration::days(2)), true);
        assert_eq!(decision, ActionDecision::Suppress(SuppressReason::Flapping));
    }

    #[test]
    fn open_row_always_refreshes_in_place() {
        let now = Utc::now();
        let row = ActionRow {
            id: Uuid::new_v4(),
            business_id: BusinessId::new(),
            idempotency_key: "k".into(),
            action_type: ActionType::InvestigateAnomaly,
            priority: 4,
            status: ActionStatus::Open,
            source_signal_id: Some("sig1".into()),
            evidence_json: json!({}),
            rationale_json: json!({}),
            resolved_at: None,
            resolution_reason: None,
            snoozed_until: None,
            assigned_to: None,
        };
        let decision = decide_action(Some(&row), &candidate(Some("sig1")), now, Some(Duration::hours(1)), true);
        assert_eq!(decision, ActionDecision::RefreshInPlace);
    }

    #[test]
    fn resolved_action_stays_suppressed_within_cooldown_absent_material_change() {
        let now = Utc::now();
        let row = ActionRow {
            id: Uuid::new_v4(),
            business_id: BusinessId::new(),
            idempotency_key: "k".into(),
            action_type: ActionType::FixMapping,
            priority: 4,
            status: ActionStatus::Done,
            source_signal_id: None,
            evidence_json: json!({}),
            rationale_json: json!({"why_now": "x"}),
            resolved_at: Some(now - Duration::days(3)),
            resolution_reason: Some("done".into()),
            snoozed_until: None,
            assigned_to: None,
        };
        let mut c = candidate(None);
        c.evidence_json = json!({});
        let decision = decide_action(Some(&row), &c, now, None, false);
        assert_eq!(decision, ActionDecision::Suppress(SuppressReason::CooldownAfterResolve));
    }

    #[test]
    fn resolved_action_reopens_after_cooldown_expires() {
        let now = Utc::now();
        let row = ActionRow {
            id: Uuid::new_v4(),
            business_id: BusinessId::new(),
            idempotency_key: "k".into(),
            action_type: ActionType::FixMapping,
            priority: 4,
            status: ActionStatus::Done,
            source_signal_id: None,
            evidence_json: json!({}),
            rationale_json: json!({"why_now": "x"}),
            resolved_at: Some(now - Duration::days(20)),
            resolution_reason: Some("done".into()),
            snoozed_until: None,
            assigned_to: None,
        };
        let mut c = candidate(None);
        c.evidence_json = json!({});
        let decision = decide_action(Some(&row), &c, now, None, false);
        assert_eq!(decision, ActionDecision::Reopen);
    }
}
