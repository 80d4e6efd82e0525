//! Domain-weighted penalty aggregation over open signals (`spec.md`
//! §4.11, component L).
//!
//! Domain weights, severity weights, status multipliers and the
//! persistence multiplier all carry the constants named in `spec.md`
//! §4.11, as do the contributor/domain sort key and the before/after delta
//! logic in `explain_change`. `catalog` is a small static table covering
//! exactly `spec.md` §4.5's detector set, defaulting every entry's
//! `profile_weight` to `1.0` when no more specific scoring profile applies.

#![deny(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use fh_signals::{HealthSignalState, SignalRepo};
use fh_types::{BusinessId, Domain, FhError, Severity, SignalStatus};
use serde_json::{json, Value};
use sqlx::PgConnection;

/// `DOMAIN_WEIGHTS`.
#[must_use]
pub fn domain_weight(domain: Domain) -> f64 {
    match domain {
        Domain::Liquidity => 1.4,
        Domain::Revenue => 1.2,
        Domain::Expense => 1.2,
        Domain::Timing => 1.1,
        Domain::Concentration => 0.9,
        Domain::Hygiene => 0.8,
        Domain::Unknown => 0.7,
    }
}

/// `SEVERITY_WEIGHTS`.
#[must_use]
pub fn severity_weight(severity: Severity) -> f64 {
    match severity {
        Severity::Critical => 18.0,
        Severity::High => 16.0,
        Severity::Warning => 12.0,
        Severity::Medium => 10.0,
        Severity::Low => 6.0,
        Severity::Info => 4.0,
    }
}

/// `STATUS_MULTIPLIERS`.
#[must_use]
pub fn status_multiplier(status: SignalStatus) -> f64 {
    match status {
        SignalStatus::Open => 1.0,
        SignalStatus::InProgress => 0.8,
        SignalStatus::Ignored => 0.3,
        SignalStatus::Resolved => 0.0,
    }
}

/// Per-`signal_type` scoring profile weight. Every detector in `spec.md`
/// §4.5 is listed so a lookup miss only ever happens for an unrecognized
/// `signal_type`, which still defaults to `1.0`.
fn profile_weight(signal_type: &str) -> f64 {
    match signal_type {
        "expense_creep_by_vendor" | "low_cash_runway" | "unusual_outflow_spike" | "revenue.decline_vs_baseline"
        | "revenue.volatility_spike" | "expense.spike_vs_baseline" | "expense.new_recurring"
        | "timing.inflow_outflow_mismatch" | "timing.payroll_rent_cliff" | "concentration.revenue_top_customer"
        | "concentration.expense_top_vendor" | "hygiene.uncategorized_high" | "hygiene.signal_flapping" => 1.0,
        _ => 1.0,
    }
}

/// `_persistence_multiplier`: `clamp(1 + age_days/14, 1, 2)`, where
/// `age_days` is how long the signal has been continuously observed
/// (`last_seen_at - detected_at`).
#[must_use]
pub fn persistence_multiplier(detected_at: DateTime<Utc>, last_seen_at: DateTime<Utc>) -> f64 {
    let age_days = (last_seen_at - detected_at).num_seconds() as f64 / 86_400.0;
    let age_days = age_days.max(0.0);
    (1.0 + age_days / 14.0).clamp(1.0, 2.0)
}

/// One signal's contribution to the aggregate score.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Contributor {
    /// see [`HealthSignalState::signal_id`]
    pub signal_id: String,
    /// Domain the signal's type maps onto.
    pub domain: Domain,
    /// Current lifecycle status.
    pub status: SignalStatus,
    /// Current severity.
    pub severity: Severity,
    /// This signal's penalty contribution, rounded to 2 decimals.
    pub penalty: f64,
    /// Short human-readable justification.
    pub rationale: String,
}

/// One domain's rollup: `score = max(0, 100 - Σ contributor penalty)`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DomainScore {
    /// The domain.
    pub domain: Domain,
    /// `100` minus this domain's total penalty, floored at `0`.
    pub score: f64,
    /// Sum of this domain's contributor penalties.
    pub penalty: f64,
    /// This domain's contributors, `(-penalty, domain, signal_id)` sorted.
    pub contributors: Vec<Contributor>,
}

/// `ComputeScore`'s full result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthScore {
    /// Tenant.
    pub business_id: BusinessId,
    /// `max(0, 100 - Σ penalty)` across every non-resolved signal.
    pub score: f64,
    /// When this score was computed.
    pub generated_at: DateTime<Utc>,
    /// Per-domain rollups, sorted by domain name.
    pub domains: Vec<DomainScore>,
    /// Every contributor, `(-penalty, domain, signal_id)` sorted.
    pub contributors: Vec<Contributor>,
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

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn penalty_for(state: &HealthSignalState) -> (Domain, f64) {
    let domain = fh_detectors::domain_of(&state.signal_type);
    let multiplier = status_multiplier(state.status);
    if multiplier <= 0.0 {
        return (domain, 0.0);
    }
    let penalty = domain_weight(domain)
        * severity_weight(state.severity)
        * profile_weight(&state.signal_type)
        * multiplier
        * persistence_multiplier(state.detected_at, state.last_seen_at);
    (domain, round2(penalty))
}

fn rationale_for(state: &HealthSignalState, domain: Domain, persistence: f64) -> String {
    format!(
        "{:?} {} signal {:?}; persists {:.2}x; weight={:.2}",
        state.severity,
        domain_str(domain),
        state.status,
        persistence,
        round2(domain_weight(domain) * severity_weight(state.severity)),
    )
    .to_lowercase()
}

fn sort_key(penalty: f64, domain: Domain, signal_id: &str) -> (i64, String, String) {
    // `-penalty` as a sortable integer (2-decimal fixed point) so NaN/float
    // comparisons never enter the ordering.
    (-(penalty * 100.0).round() as i64, domain_str(domain).to_string(), signal_id.to_string())
}

/// `ComputeScore(business_id)`: pure given the already-fetched signal rows.
#[must_use]
pub fn compute_score(business_id: BusinessId, states: &[HealthSignalState], now: DateTime<Utc>) -> HealthScore {
    let mut contributors = Vec::new();
    let mut domain_penalties: std::collections::BTreeMap<Domain, (f64, Vec<Contributor>)> = std::collections::BTreeMap::new();

    for state in states {
        let (domain, penalty) = penalty_for(state);
        if penalty <= 0.0 && state.status == SignalStatus::Resolved {
            continue;
        }
        let persistence = persistence_multiplier(state.detected_at, state.last_seen_at);
        let contributor = Contributor {
            signal_id: state.signal_id.0.clone(),
            domain,
            status: state.status,
            severity: state.severity,
            penalty,
            rationale: rationale_for(state, domain, persistence),
        };
        let entry = domain_penalties.entry(domain).or_insert_with(|| (0.0, Vec::new()));
        entry.0 = round2(entry.0 + penalty);
        entry.1.push(contributor.clone());
        contributors.push(contributor);
    }

    contributors.sort_by(|a, b| sort_key(a.penalty, a.domain, &a.signal_id).cmp(&sort_key(b.penalty, b.domain, &b.signal_id)));

    let mut domains: Vec<DomainScore> = domain_penalties
        .into_iter()
        .map(|(domain, (penalty, mut contribs))| {
            contribs.sort_by(|a, b| sort_key(a.penalty, a.domain, &a.signal_id).cmp(&sort_key(b.penalty, b.domain, &b.signal_id)));
            DomainScore { domain, score: (100.0 - penalty).max(0.0), penalty, contributors: contribs }
        })
        .collect();
    domains.sort_by_key(|d| domain_str(d.domain).to_string());

    let total_penalty = round2(contributors.iter().map(|c| c.penalty).sum());
    let score = (100.0 - total_penalty).max(0.0);

    HealthScore { business_id, score: round2(score), generated_at: now, domains, contributors }
}

/// Loads the signal rows `compute_score` needs and runs it.
pub async fn compute_score_for_business(conn: &mut PgConnection, business_id: BusinessId, now: DateTime<Utc>) -> Result<HealthScore, FhError> {
    let states = SignalRepo::fetch_all(conn, business_id).await?;
    Ok(compute_score(business_id, &states, now))
}

/// One change's estimated impact on the score, from [`explain_change`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChangeImpact {
    /// The affected signal.
    pub signal_id: String,
    /// Domain the signal's type maps onto.
    pub domain: Domain,
    /// Audit kind this impact was derived from.
    pub change_type: String,
    /// Estimated penalty delta: positive means the score improved.
    pub estimated_penalty_delta: f64,
    /// Short human-readable justification.
    pub rationale: String,
}

/// `ExplainChange`'s summary block.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChangeSummary {
    /// Deterministic headline derived from `net_estimated_delta`.
    pub headline: String,
    /// Sum of every returned impact's delta.
    pub net_estimated_delta: f64,
    /// Up to the 3 largest-magnitude drivers, formatted for display.
    pub top_drivers: Vec<String>,
}

/// `ExplainChange`'s full result.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChangeExplanation {
    /// Tenant.
    pub business_id: BusinessId,
    /// Every impact within the window, sorted and capped at `limit`.
    pub impacts: Vec<ChangeImpact>,
    /// Deterministic headline summary.
    pub summary: ChangeSummary,
}

fn estimate_penalty(domain: Domain, severity: Severity, status: SignalStatus, detected_at: DateTime<Utc>, last_seen_at: DateTime<Utc>) -> f64 {
    let multiplier = status_multiplier(status);
    if multiplier <= 0.0 {
        return 0.0;
    }
    round2(domain_weight(domain) * severity_weight(severity) * multiplier * persistence_multiplier(detected_at, last_seen_at))
}

/// `ExplainChange(business_id, since_hours <= 720, limit <= 20)`: re-derives
/// each audit-logged signal transition's estimated score impact from the
/// same formula `compute_score` uses, using `before_state`/`after_state`
/// JSON already captured on the audit row (`fh_signals::reconcile`'s
/// `as_json()` shape: `signal_id`, `signal_type` via the current state map,
/// `status`, `severity`, `detected_at`, `last_seen_at`).
pub async fn explain_change(
    conn: &mut PgConnection,
    business_id: BusinessId,
    since_hours: i64,
    limit: usize,
    now: DateTime<Utc>,
) -> Result<ChangeExplanation, FhError> {
    let since_hours = since_hours.clamp(1, 720);
    let limit = limit.clamp(1, 20);
    let since = now - Duration::hours(since_hours);

    let states = SignalRepo::fetch_all(conn, business_id).await?;
    let state_by_id: std::collections::HashMap<&str, &HealthSignalState> = states.iter().map(|s| (s.signal_id.0.as_str(), s)).collect();

    let entries = fh_audit::list_audit_events(conn, business_id, since, now, Some("signal_"))
        .await?
        .into_iter()
        .filter(|e| matches!(e.kind.as_str(), "signal_detected" | "signal_updated" | "signal_resolved" | "signal_status_changed"))
        .collect::<Vec<_>>();

    let mut impacts = Vec::with_capacity(entries.len());
    for entry in &entries {
        let after = entry.after_state.clone().unwrap_or(Value::Null);
        let before = entry.before_state.clone();
        let signal_id = after.get("signal_id").and_then(Value::as_str).unwrap_or_default().to_string();
        if signal_id.is_empty() {
            continue;
        }
        let signal_type = state_by_id.get(signal_id.as_str()).map(|s| s.signal_type.clone()).unwrap_or_else(|| signal_id.split(':').next().unwrap_or_default().to_string());
        let domain = fh_detectors::domain_of(&signal_type);
        let severity = state_by_id.get(signal_id.as_str()).map_or(Severity::Warning, |s| s.severity);
        let detected_at = parse_rfc3339(&after, "detected_at").unwrap_or(now);
        let last_seen_at = parse_rfc3339(&after, "last_seen_at").unwrap_or(detected_at);

        let (delta, rationale) = match entry.kind.as_str() {
            "signal_detected" => {
                let penalty = estimate_penalty(domain, severity, SignalStatus::Open, detected_at, last_seen_at);
                (-penalty, format!("detected signal increases penalty by {penalty}"))
            }
            "signal_resolved" => {
                let penalty = estimate_penalty(domain, severity, SignalStatus::Open, detected_at, last_seen_at);
                (penalty, format!("resolved signal removes estimated penalty {penalty}"))
            }
            _ => {
                let before_status = before.as_ref().and_then(|b| b.get("status")).and_then(Value::as_str).map(status_from_str).unwrap_or(Ok(SignalStatus::Open)).unwrap_or(SignalStatus::Open);
                let after_status = after.get("status").and_then(Value::as_str).map(status_from_str).unwrap_or(Ok(SignalStatus::Open)).unwrap_or(SignalStatus::Open);
                let before_penalty = estimate_penalty(domain, severity, before_status, detected_at, last_seen_at);
                let after_penalty = estimate_penalty(domain, severity, after_status, detected_at, last_seen_at);
                let delta = round2(before_penalty - after_penalty);
                (delta, format!("status changed from {before_status:?} to {after_status:?}; estimated penalty delta {delta}").to_lowercase())
            }
        };

        impacts.push(ChangeImpact {
            signal_id,
            domain,
            change_type: entry.kind.clone(),
            estimated_penalty_delta: round2(delta),
            rationale,
        });
    }

    impacts.sort_by(|a, b| {
        let ka = (-(a.estimated_penalty_delta.abs() * 100.0).round() as i64, a.change_type.clone(), a.signal_id.clone());
        let kb = (-(b.estimated_penalty_delta.abs() * 100.0).round() as i64, b.change_type.clone(), b.signal_id.clone());
        ka.cmp(&kb)
    });
    impacts.truncate(limit);

    let net_delta = round2(impacts.iter().map(|i| i.estimated_penalty_delta).sum());
    let headline = if net_delta > 0.0 {
        format!("health score likely improved by {net_delta} points from recent changes")
    } else if net_delta < 0.0 {
        format!("health score likely declined by {} points from recent changes", net_delta.abs())
    } else {
        "health score appears stable from recent changes".to_string()
    };
    let top_drivers = impacts
        .iter()
        .take(3)
        .map(|i| format!("{} ({}, {})", i.signal_id, i.change_type.replace('_', " "), i.estimated_penalty_delta))
        .collect();

    Ok(ChangeExplanation {
        business_id,
        impacts,
        summary: ChangeSummary { headline, net_estimated_delta: net_delta, top_drivers },
    })
}

fn parse_rfc3339(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value.get(key)?.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()).map(|dt| dt.with_timezone(&Utc))
}

fn status_from_str(s: &str) -> Result<SignalStatus, FhError> {
    Ok(match s {
        "open" => SignalStatus::Open,
        "in_progress" => SignalStatus::InProgress,
        "resolved" => SignalStatus::Resolved,
        "ignored" => SignalStatus::Ignored,
        other => return Err(FhError::Validation(format!("unknown signal status {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fh_types::SignalId;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn state(signal_type: &str, status: SignalStatus, severity: Severity, detected_at: DateTime<Utc>, last_seen_at: DateTime<Utc>) -> HealthSignalState {
        HealthSignalState {
            business_id: BusinessId::new(),
            signal_id: SignalId::new(signal_type, "f1"),
            signal_type: signal_type.to_string(),
            fingerprint: "f1".into(),
            status,
            severity,
            title: "t".into(),
            summary: "s".into(),
            payload_json: json!({}),
            detected_at,
            last_seen_at,
            resolved_at: None,
            updated_at: last_seen_at,
        }
    }

    #[test]
    fn resolved_signal_contributes_nothing() {
        let business_id = BusinessId::new();
        let states = vec![state("low_cash_runway", SignalStatus::Resolved, Severity::Critical, at(2026, 1, 1), at(2026, 1, 1))];
        let score = compute_score(business_id, &states, at(2026, 1, 1));
        assert_eq!(score.score, 100.0);
        assert!(score.contributors.is_empty());
    }

    #[test]
    fn open_critical_liquidity_signal_applies_expected_penalty() {
        let business_id = BusinessId::new();
        let detected = at(2026, 1, 1);
        let last_seen = at(2026, 1, 1);
        let states = vec![state("low_cash_runway", SignalStatus::Open, Severity::Critical, detected, last_seen)];
        let score = compute_score(business_id, &states, at(2026, 1, 1));
        // domain_weight(liquidity)=1.4 * severity_weight(critical)=18 * profile=1 * status=1 * persistence=1
        assert_eq!(score.contributors[0].penalty, round2(1.4 * 18.0));
        assert_eq!(score.score, round2(100.0 - 1.4 * 18.0));
    }

    #[test]
    fn persistence_multiplier_clamps_to_two() {
        let detected = at(2026, 1, 1);
        let last_seen = at(2026, 3, 1);
        assert_eq!(persistence_multiplier(detected, last_seen), 2.0);
    }

    #[test]
    fn persistence_multiplier_floor_is_one() {
        let now = at(2026, 1, 1);
        assert_eq!(persistence_multiplier(now, now), 1.0);
    }

    #[test]
    fn contributors_sorted_by_penalty_then_domain_then_signal() {
        let business_id = BusinessId::new();
        let now = at(2026, 1, 1);
        let states = vec![
            state("hygiene.uncategorized_high", SignalStatus::Open, Severity::Low, now, now),
            state("low_cash_runway", SignalStatus::Open, Severity::Critical, now, now),
        ];
        let score = compute_score(business_id, &states, now);
        assert_eq!(score.contributors[0].signal_id.split(':').next(), Some("low_cash_runway"));
    }
}
