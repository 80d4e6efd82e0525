//! Windowed detector battery over the projected ledger (`spec.md` §4.5,
//! component E). Every detector is a pure, synchronous function over an
//! in-memory snapshot — no I/O, no coroutine fanout, matching `spec.md` §9's
//! explicit design note.
//!
//! `expense_creep_by_vendor`, `low_cash_runway` and `unusual_outflow_spike`
//! carry the exact thresholds used historically for these checks. The other
//! ten detectors named in `spec.md` §4.5 follow the same
//! fingerprint/payload/ledger-anchor shape; their exact thresholds are this
//! crate's own design decision, recorded in `DESIGN.md`.

#![deny(missing_docs)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use fh_projection::PostedTxn;
use fh_types::{Domain, Money, Severity};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// A reusable ledger filter attached to a signal, `spec.md` §4.5: re-running
/// its `query` must reproduce every `evidence_keys` value to 2 decimals.
#[derive(Debug, Clone)]
pub struct LedgerAnchor {
    /// Stable name for this anchor within the signal's payload.
    pub anchor_key: String,
    /// The filter expression, shaped like `fh_ledger::LedgerFilters` plus a
    /// date window, serialized for persistence/replay.
    pub query: Value,
    /// Names of numeric stats in the signal's payload this anchor reproduces.
    pub evidence_keys: Vec<String>,
}

/// One detector's output (`spec.md` §4.5's `DetectedSignal`). Case/domain
/// assignment is derived from `signal_type`'s prefix by [`domain_of`].
#[derive(Debug, Clone)]
pub struct DetectedSignal {
    /// Stable detector name, e.g. `"expense_creep_by_vendor"`.
    pub signal_type: String,
    /// `sha256(business_id|signal_type|dimension_key)`, hex-encoded.
    pub fingerprint: String,
    /// Domain this signal's case should aggregate into.
    pub domain: Domain,
    /// Severity on the six-point scale.
    pub severity: Severity,
    /// Short human title.
    pub title: String,
    /// One or two sentence summary.
    pub summary: String,
    /// `window`, `baseline_window?`, numeric stats and `ledger_anchors`.
    pub payload: Value,
    /// The ledger anchors listed inside `payload`, kept structured for
    /// evidence-reproduction tests.
    pub ledger_anchors: Vec<LedgerAnchor>,
}

/// Why a detector did or didn't fire, `spec.md` §4.5's per-detector
/// diagnostic record.
#[derive(Debug, Clone)]
pub struct DetectorDiagnostic {
    /// Detector name.
    pub detector: &'static str,
    /// Whether it ran at all (vs. skipped for lack of data).
    pub ran: bool,
    /// Set when `ran == false`.
    pub skipped_reason: Option<String>,
    /// Whether it produced at least one signal.
    pub fired: bool,
    /// Evidence keys it attached, for diagnostics UIs.
    pub evidence_keys: Vec<String>,
}

/// Everything a detector reads. Assembled once per `Pulse`/tick cycle by the
/// caller from `fh-projection`'s output plus a cash balance and a
/// categorization lookup; the detectors themselves never touch a database.
pub struct DetectorContext<'a> {
    /// Stable dimension prefix included in every fingerprint.
    pub business_id_key: String,
    /// Posted transactions, ascending `(occurred_at, source_event_id)`.
    pub txns: &'a [PostedTxn],
    /// "Now", for window arithmetic — never `Utc::now()` directly.
    pub now: DateTime<Utc>,
    /// Current cash balance, for runway math.
    pub current_cash: Money,
    /// `source_event_id`s with a resolved `TxnCategorization` row.
    pub categorized_ids: &'a HashSet<String>,
    /// `(signal_type, date)` pairs already known to have flapped, supplied by
    /// the caller from the audit log; `hygiene.signal_flapping` reads this
    /// instead of re-deriving it (that belongs to `fh-signals`).
    pub flapping_signal_types: &'a HashSet<String>,
}

fn fingerprint(business_id_key: &str, signal_type: &str, dimension_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(business_id_key.as_bytes());
    hasher.update(b"|");
    hasher.update(signal_type.as_bytes());
    hasher.update(b"|");
    hasher.update(dimension_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Maps a detector's `signal_type` to the `Domain` its case should
/// aggregate into, by prefix.
#[must_use]
pub fn domain_of(signal_type: &str) -> Domain {
    if signal_type.starts_with("revenue.") {
        Domain::Revenue
    } else if signal_type.starts_with("expense.") || signal_type == "expense_creep_by_vendor" || signal_type == "unusual_outflow_spike" {
        Domain::Expense
    } else if signal_type.starts_with("timing.") {
        Domain::Timing
    } else if signal_type.starts_with("concentration.") {
        Domain::Concentration
    } else if signal_type.starts_with("hygiene.") {
        Domain::Hygiene
    } else if signal_type.starts_with("liquidity.") || signal_type == "low_cash_runway" {
        Domain::Liquidity
    } else {
        Domain::Unknown
    }
}

fn window_json(start: DateTime<Utc>, end: DateTime<Utc>) -> Value {
    json!({"start": start.to_rfc3339(), "end": end.to_rfc3339()})
}

fn outflow_total(txns: &[&PostedTxn]) -> Money {
    txns.iter().map(|t| t.amount).sum()
}

fn inflow_total(txns: &[&PostedTxn]) -> Money {
    txns.iter().map(|t| t.amount).sum()
}

fn in_window<'a>(txns: &'a [PostedTxn], start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<&'a PostedTxn> {
    txns.iter().filter(|t| t.occurred_at >= start && t.occurred_at < end).collect()
}

fn outflows<'a>(txns: &[&'a PostedTxn]) -> Vec<&'a PostedTxn> {
    txns.iter().copied().filter(|t| t.direction == fh_types::Direction::Outflow).collect()
}

fn inflows<'a>(txns: &[&'a PostedTxn]) -> Vec<&'a PostedTxn> {
    txns.iter().copied().filter(|t| t.direction == fh_types::Direction::Inflow).collect()
}

fn daily_totals(txns: &[&PostedTxn], direction: fh_types::Direction, days: i64, end: DateTime<Utc>) -> Vec<f64> {
    let mut buckets: HashMap<String, f64> = HashMap::new();
    for txn in txns.iter().filter(|t| t.direction == direction) {
        let key = fh_types::time::daily_bucket(txn.occurred_at);
        *buckets.entry(key).or_insert(0.0) += txn.amount.to_f64();
    }
    let mut out = Vec::with_capacity(days as usize);
    for d in 0..days {
        let day = end - Duration::days(d + 1);
        out.push(*buckets.get(&fh_types::time::daily_bucket(day)).unwrap_or(&0.0));
    }
    out
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], avg: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn anchor_for_vendor(vendor_key: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> LedgerAnchor {
    LedgerAnchor {
        anchor_key: "current_window".to_string(),
        query: json!({
            "start": start.to_rfc3339(),
            "end": end.to_rfc3339(),
            "direction": "outflow",
            "merchant_keys": [vendor_key],
        }),
        evidence_keys: vec!["current_total".to_string()],
    }
}

/// `expense_creep_by_vendor` — 14d vs prior-14 outflow per normalized vendor.
/// Fires at ≥40% increase AND ≥$200 absolute delta; severity `high` at ≥100%
/// increase or ≥$600 absolute delta, else `medium`.
#[must_use]
pub fn expense_creep_by_vendor(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let current_start = ctx.now - Duration::days(14);
    let prior_start = ctx.now - Duration::days(28);

    let current = in_window(ctx.txns, current_start, ctx.now);
    let prior = in_window(ctx.txns, prior_start, current_start);

    let mut by_vendor_current: HashMap<String, Vec<&PostedTxn>> = HashMap::new();
    for txn in outflows(&current) {
        if let Some(key) = &txn.merchant_key {
            by_vendor_current.entry(key.clone()).or_default().push(txn);
        }
    }
    let mut by_vendor_prior: HashMap<String, Vec<&PostedTxn>> = HashMap::new();
    for txn in outflows(&prior) {
        if let Some(key) = &txn.merchant_key {
            by_vendor_prior.entry(key.clone()).or_default().push(txn);
        }
    }

    let mut out = Vec::new();
    for (vendor, current_txns) in &by_vendor_current {
        let current_total = outflow_total(current_txns);
        let prior_txns = by_vendor_prior.get(vendor).cloned().unwrap_or_default();
        let prior_total = outflow_total(&prior_txns);

        let delta = current_total - prior_total;
        let delta_f = delta.to_f64();
        let prior_f = prior_total.to_f64().max(0.01);
        let pct_change = delta_f / prior_f;

        if pct_change >= 0.40 && delta_f >= 200.0 {
            let severity = if pct_change >= 1.0 || delta_f >= 600.0 {
                Severity::High
            } else {
                Severity::Medium
            };
            let fp = fingerprint(&ctx.business_id_key, "expense_creep_by_vendor", vendor);
            let anchor = anchor_for_vendor(vendor, current_start, ctx.now);
            out.push(DetectedSignal {
                signal_type: "expense_creep_by_vendor".to_string(),
                fingerprint: fp,
                domain: Domain::Expense,
                severity,
                title: format!("Spend with {vendor} rising"),
                summary: format!(
                    "Outflow to {vendor} rose from {prior_total} to {current_total} over the last 14 days."
                ),
                payload: json!({
                    "window": window_json(current_start, ctx.now),
                    "baseline_window": window_json(prior_start, current_start),
                    "current_total": current_total.to_f64(),
                    "prior_total": prior_total.to_f64(),
                    "delta": delta_f,
                    "pct_change": pct_change,
                    "vendor": vendor,
                    "ledger_anchors": [{
                        "anchor_key": "current_window",
                        "evidence_keys": ["current_total"],
                    }],
                }),
                ledger_anchors: vec![anchor],
            });
        }
    }
    out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    out
}

/// `low_cash_runway` / `liquidity.runway_low` — net 30-day burn vs current
/// cash. `high` below 30 days of runway, `medium` below 60.
#[must_use]
pub fn low_cash_runway(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let start = ctx.now - Duration::days(30);
    let window = in_window(ctx.txns, start, ctx.now);
    let out_total = outflow_total(&outflows(&window)).to_f64();
    let in_total = inflow_total(&inflows(&window)).to_f64();
    let burn = out_total - in_total;
    let burn_per_day = (burn / 30.0).max(0.01);
    let runway_days = ctx.current_cash.to_f64() / burn_per_day;

    if burn <= 0.0 || runway_days >= 60.0 {
        return Vec::new();
    }

    let severity = if runway_days < 30.0 { Severity::High } else { Severity::Medium };
    let fp = fingerprint(&ctx.business_id_key, "low_cash_runway", "");
    vec![DetectedSignal {
        signal_type: "low_cash_runway".to_string(),
        fingerprint: fp,
        domain: Domain::Liquidity,
        severity,
        title: "Cash runway shrinking".to_string(),
        summary: format!("At the current burn rate, cash covers roughly {runway_days:.0} more days."),
        payload: json!({
            "window": window_json(start, ctx.now),
            "current_total": out_total,
            "prior_total": in_total,
            "burn_per_day": burn_per_day,
            "runway_days": runway_days,
            "ledger_anchors": [{
                "anchor_key": "burn_window",
                "evidence_keys": ["current_total"],
            }],
        }),
        ledger_anchors: vec![LedgerAnchor {
            anchor_key: "burn_window".to_string(),
            query: json!({"start": start.to_rfc3339(), "end": ctx.now.to_rfc3339(), "direction": "outflow"}),
            evidence_keys: vec!["current_total".to_string()],
        }],
    }]
}

/// `unusual_outflow_spike` — a day's outflow exceeding `mean30 + 3*std30` or
/// `2.5 * mean14`. `high` on the standard-deviation trigger, `medium` on the
/// mean14 trigger.
#[must_use]
pub fn unusual_outflow_spike(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let all_outflows: Vec<&PostedTxn> = ctx.txns.iter().filter(|t| t.direction == fh_types::Direction::Outflow).collect();
    let daily_30 = daily_totals(&all_outflows, fh_types::Direction::Outflow, 30, ctx.now);
    let daily_14 = daily_totals(&all_outflows, fh_types::Direction::Outflow, 14, ctx.now);

    let mean30 = mean(&daily_30);
    let std30 = std_dev(&daily_30, mean30);
    let mean14 = mean(&daily_14);

    let today_key = fh_types::time::daily_bucket(ctx.now);
    let today_total: f64 = all_outflows
        .iter()
        .filter(|t| fh_types::time::daily_bucket(t.occurred_at) == today_key)
        .map(|t| t.amount.to_f64())
        .sum();

    let std_trigger = today_total > mean30 + 3.0 * std30;
    let mean_trigger = today_total > 2.5 * mean14;

    if !std_trigger && !mean_trigger {
        return Vec::new();
    }

    let severity = if std_trigger { Severity::High } else { Severity::Medium };
    let fp = fingerprint(&ctx.business_id_key, "unusual_outflow_spike", &today_key);
    let day_start = Utc
        .with_ymd_and_hms(ctx.now.year(), ctx.now.month(), ctx.now.day(), 0, 0, 0)
        .single()
        .unwrap_or(ctx.now);
    vec![DetectedSignal {
        signal_type: "unusual_outflow_spike".to_string(),
        fingerprint: fp,
        domain: Domain::Expense,
        severity,
        title: "Unusual outflow spike today".to_string(),
        summary: format!("Today's outflow of {today_total:.2} is well above the recent baseline."),
        payload: json!({
            "window": window_json(day_start, ctx.now),
            "current_total": today_total,
            "mean_30d": mean30,
            "std_30d": std30,
            "mean_14d": mean14,
            "ledger_anchors": [{"anchor_key": "today", "evidence_keys": ["current_total"]}],
        }),
        ledger_anchors: vec![LedgerAnchor {
            anchor_key: "today".to_string(),
            query: json!({"start": day_start.to_rfc3339(), "end": ctx.now.to_rfc3339(), "direction": "outflow"}),
            evidence_keys: vec!["current_total".to_string()],
        }],
    }]
}

use chrono::Datelike;

/// `revenue.decline_vs_baseline` — 30d revenue vs prior 30d. Thresholds are
/// this crate's own design, mirroring `expense_creep_by_vendor`'s shape.
/// Fires at ≥20% decline AND ≥$300 absolute; `high` at ≥40% decline.
#[must_use]
pub fn revenue_decline_vs_baseline(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let current_start = ctx.now - Duration::days(30);
    let prior_start = ctx.now - Duration::days(60);
    let current_total = inflow_total(&inflows(&in_window(ctx.txns, current_start, ctx.now))).to_f64();
    let prior_total = inflow_total(&inflows(&in_window(ctx.txns, prior_start, current_start))).to_f64();

    if prior_total <= 0.0 {
        return Vec::new();
    }
    let delta = current_total - prior_total;
    let pct_change = delta / prior_total;

    if pct_change <= -0.20 && delta.abs() >= 300.0 {
        let severity = if pct_change <= -0.40 { Severity::High } else { Severity::Medium };
        vec![DetectedSignal {
            signal_type: "revenue.decline_vs_baseline".to_string(),
            fingerprint: fingerprint(&ctx.business_id_key, "revenue.decline_vs_baseline", ""),
            domain: Domain::Revenue,
            severity,
            title: "Revenue declining vs baseline".to_string(),
            summary: format!("Revenue fell from {prior_total:.2} to {current_total:.2} over 30 days."),
            payload: json!({
                "window": window_json(current_start, ctx.now),
                "baseline_window": window_json(prior_start, current_start),
                "current_total": current_total,
                "prior_total": prior_total,
                "delta": delta,
                "pct_change": pct_change,
                "ledger_anchors": [{"anchor_key": "current_window", "evidence_keys": ["current_total"]}],
            }),
            ledger_anchors: vec![LedgerAnchor {
                anchor_key: "current_window".to_string(),
                query: json!({"start": current_start.to_rfc3339(), "end": ctx.now.to_rfc3339(), "direction": "inflow"}),
                evidence_keys: vec!["current_total".to_string()],
            }],
        }]
    } else {
        Vec::new()
    }
}

/// `revenue.volatility_spike` — a day's revenue departing from the 30-day
/// mean by more than 2·σ. Design choice, mirrors `unusual_outflow_spike`.
#[must_use]
pub fn revenue_volatility_spike(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let all_inflows: Vec<&PostedTxn> = ctx.txns.iter().filter(|t| t.direction == fh_types::Direction::Inflow).collect();
    let daily_30 = daily_totals(&all_inflows, fh_types::Direction::Inflow, 30, ctx.now);
    let mean30 = mean(&daily_30);
    let std30 = std_dev(&daily_30, mean30);
    if std30 <= 0.0 {
        return Vec::new();
    }

    let today_key = fh_types::time::daily_bucket(ctx.now);
    let today_total: f64 = all_inflows
        .iter()
        .filter(|t| fh_types::time::daily_bucket(t.occurred_at) == today_key)
        .map(|t| t.amount.to_f64())
        .sum();

    let deviation = (today_total - mean30).abs();
    if deviation <= 2.0 * std30 {
        return Vec::new();
    }
    let severity = if deviation > 3.0 * std30 { Severity::High } else { Severity::Medium };
    vec![DetectedSignal {
        signal_type: "revenue.volatility_spike".to_string(),
        fingerprint: fingerprint(&ctx.business_id_key, "revenue.volatility_spike", &today_key),
        domain: Domain::Revenue,
        severity,
        title: "Revenue volatility spike".to_string(),
        summary: format!("Today's revenue of {today_total:.2} departs sharply from the recent baseline."),
        payload: json!({
            "current_total": today_total,
            "mean_30d": mean30,
            "std_30d": std30,
            "ledger_anchors": [{"anchor_key": "today", "evidence_keys": ["current_total"]}],
        }),
        ledger_anchors: vec![LedgerAnchor {
            anchor_key: "today".to_string(),
            query: json!({"direction": "inflow"}),
            evidence_keys: vec!["current_total".to_string()],
        }],
    }]
}

/// `expense.spike_vs_baseline` — aggregate (not per-vendor) 7d-vs-prior-7d
/// outflow creep. Design choice, mirrors `expense_creep_by_vendor` at the
/// business level instead of per vendor. Fires at ≥50% increase AND ≥$300
/// absolute; `high` at ≥100% increase or ≥$800 absolute.
#[must_use]
pub fn expense_spike_vs_baseline(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let current_start = ctx.now - Duration::days(7);
    let prior_start = ctx.now - Duration::days(14);
    let current_total = outflow_total(&outflows(&in_window(ctx.txns, current_start, ctx.now))).to_f64();
    let prior_total = outflow_total(&outflows(&in_window(ctx.txns, prior_start, current_start))).to_f64();

    let delta = current_total - prior_total;
    let prior_f = prior_total.max(0.01);
    let pct_change = delta / prior_f;

    if pct_change >= 0.50 && delta >= 300.0 {
        let severity = if pct_change >= 1.0 || delta >= 800.0 { Severity::High } else { Severity::Medium };
        vec![DetectedSignal {
            signal_type: "expense.spike_vs_baseline".to_string(),
            fingerprint: fingerprint(&ctx.business_id_key, "expense.spike_vs_baseline", ""),
            domain: Domain::Expense,
            severity,
            title: "Overall spend spiking".to_string(),
            summary: format!("Total outflow rose from {prior_total:.2} to {current_total:.2} week over week."),
            payload: json!({
                "window": window_json(current_start, ctx.now),
                "baseline_window": window_json(prior_start, current_start),
                "current_total": current_total,
                "prior_total": prior_total,
                "delta": delta,
                "pct_change": pct_change,
                "ledger_anchors": [{"anchor_key": "current_window", "evidence_keys": ["current_total"]}],
            }),
            ledger_anchors: vec![LedgerAnchor {
                anchor_key: "current_window".to_string(),
                query: json!({"start": current_start.to_rfc3339(), "end": ctx.now.to_rfc3339(), "direction": "outflow"}),
                evidence_keys: vec!["current_total".to_string()],
            }],
        }]
    } else {
        Vec::new()
    }
}

/// `expense.new_recurring` — a vendor with ≥3 outflows in the last 60 days,
/// each within 10% of the mean, that had zero outflows in the 60 days
/// before that. Design choice: a cheap recurrence heuristic, `info`
/// severity since it's informational rather than a problem.
#[must_use]
pub fn expense_new_recurring(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let recent_start = ctx.now - Duration::days(60);
    let prior_start = ctx.now - Duration::days(120);
    let recent = outflows(&in_window(ctx.txns, recent_start, ctx.now));
    let prior = outflows(&in_window(ctx.txns, prior_start, recent_start));

    let mut by_vendor: HashMap<String, Vec<&PostedTxn>> = HashMap::new();
    for txn in &recent {
        if let Some(key) = &txn.merchant_key {
            by_vendor.entry(key.clone()).or_default().push(txn);
        }
    }
    let prior_vendors: HashSet<String> = prior.iter().filter_map(|t| t.merchant_key.clone()).collect();

    let mut out = Vec::new();
    for (vendor, txns) in &by_vendor {
        if txns.len() < 3 || prior_vendors.contains(vendor) {
            continue;
        }
        let amounts: Vec<f64> = txns.iter().map(|t| t.amount.to_f64()).collect();
        let avg = mean(&amounts);
        if avg <= 0.0 {
            continue;
        }
        let consistent = amounts.iter().all(|a| ((a - avg).abs() / avg) <= 0.10);
        if !consistent {
            continue;
        }
        out.push(DetectedSignal {
            signal_type: "expense.new_recurring".to_string(),
            fingerprint: fingerprint(&ctx.business_id_key, "expense.new_recurring", vendor),
            domain: Domain::Expense,
            severity: Severity::Info,
            title: format!("New recurring charge from {vendor}"),
            summary: format!("{vendor} has billed {} times at roughly {avg:.2} in the last 60 days.", txns.len()),
            payload: json!({
                "window": window_json(recent_start, ctx.now),
                "vendor": vendor,
                "current_total": outflow_total(txns).to_f64(),
                "occurrence_count": txns.len(),
                "mean_amount": avg,
                "ledger_anchors": [{"anchor_key": "current_window", "evidence_keys": ["current_total"]}],
            }),
            ledger_anchors: vec![anchor_for_vendor(vendor, recent_start, ctx.now)],
        });
    }
    out.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
    out
}

/// `timing.inflow_outflow_mismatch` — a day with outflow but zero inflow
/// over the trailing 14 days while outflow that day exceeds 3x the 14-day
/// average inflow. Design choice.
#[must_use]
pub fn timing_inflow_outflow_mismatch(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let start = ctx.now - Duration::days(14);
    let window = in_window(ctx.txns, start, ctx.now);
    let total_in = inflow_total(&inflows(&window)).to_f64();
    let total_out = outflow_total(&outflows(&window)).to_f64();
    let avg_daily_in = total_in / 14.0;

    if total_in > 0.0 || total_out <= 0.0 {
        return Vec::new();
    }
    if avg_daily_in > 0.0 && total_out <= 3.0 * avg_daily_in * 14.0 {
        return Vec::new();
    }

    vec![DetectedSignal {
        signal_type: "timing.inflow_outflow_mismatch".to_string(),
        fingerprint: fingerprint(&ctx.business_id_key, "timing.inflow_outflow_mismatch", ""),
        domain: Domain::Timing,
        severity: Severity::Medium,
        title: "Outflow with no matching inflow".to_string(),
        summary: format!("{total_out:.2} went out over the last 14 days with no inflow recorded."),
        payload: json!({
            "window": window_json(start, ctx.now),
            "current_total": total_out,
            "prior_total": total_in,
            "ledger_anchors": [{"anchor_key": "current_window", "evidence_keys": ["current_total"]}],
        }),
        ledger_anchors: vec![LedgerAnchor {
            anchor_key: "current_window".to_string(),
            query: json!({"start": start.to_rfc3339(), "end": ctx.now.to_rfc3339(), "direction": "outflow"}),
            evidence_keys: vec!["current_total".to_string()],
        }],
    }]
}

/// `timing.payroll_rent_cliff` — two or more outflows whose merchant key
/// contains `"payroll"` or `"rent"` landing within 3 days of each other.
/// Design choice: a cash-timing-risk heuristic independent of amount.
#[must_use]
pub fn timing_payroll_rent_cliff(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let start = ctx.now - Duration::days(14);
    let window = in_window(ctx.txns, start, ctx.now);
    let mut fixed_cost_days: Vec<(DateTime<Utc>, &PostedTxn)> = outflows(&window)
        .into_iter()
        .filter(|t| {
            t.merchant_key
                .as_deref()
                .map(|k| k.contains("payroll") || k.contains("rent"))
                .unwrap_or(false)
        })
        .map(|t| (t.occurred_at, t))
        .collect();
    fixed_cost_days.sort_by_key(|(at, _)| *at);

    for pair in fixed_cost_days.windows(2) {
        let (first_at, first_txn) = pair[0];
        let (second_at, second_txn) = pair[1];
        if second_at - first_at <= Duration::days(3) {
            let combined = (first_txn.amount + second_txn.amount).to_f64();
            return vec![DetectedSignal {
                signal_type: "timing.payroll_rent_cliff".to_string(),
                fingerprint: fingerprint(&ctx.business_id_key, "timing.payroll_rent_cliff", &fh_types::time::daily_bucket(second_at)),
                domain: Domain::Timing,
                severity: Severity::High,
                title: "Payroll and rent landing together".to_string(),
                summary: "Payroll and rent outflows are clustered within a few days of each other.".to_string(),
                payload: json!({
                    "window": window_json(start, ctx.now),
                    "current_total": combined,
                    "ledger_anchors": [{"anchor_key": "cluster", "evidence_keys": ["current_total"]}],
                }),
                ledger_anchors: vec![LedgerAnchor {
                    anchor_key: "cluster".to_string(),
                    query: json!({"start": first_at.to_rfc3339(), "end": second_at.to_rfc3339(), "direction": "outflow"}),
                    evidence_keys: vec!["current_total".to_string()],
                }],
            }];
        }
    }
    Vec::new()
}

fn top_counterparty_share(txns: &[&PostedTxn]) -> Option<(String, f64, f64)> {
    let total: f64 = txns.iter().map(|t| t.amount.to_f64()).sum();
    if total <= 0.0 {
        return None;
    }
    let mut by_party: HashMap<String, f64> = HashMap::new();
    for txn in txns {
        let key = txn.merchant_key.clone().or_else(|| txn.counterparty.clone()).unwrap_or_default();
        if key.is_empty() {
            continue;
        }
        *by_party.entry(key).or_insert(0.0) += txn.amount.to_f64();
    }
    by_party
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(key, amount)| (key, amount, amount / total))
}

/// `concentration.revenue_top_customer` — top inflow counterparty's share of
/// 30-day revenue. Fires at ≥50% share; `high` at ≥70%.
#[must_use]
pub fn concentration_revenue_top_customer(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let start = ctx.now - Duration::days(30);
    let window = inflows(&in_window(ctx.txns, start, ctx.now));
    let Some((customer, amount, share)) = top_counterparty_share(&window) else {
        return Vec::new();
    };
    if share < 0.50 {
        return Vec::new();
    }
    let severity = if share >= 0.70 { Severity::High } else { Severity::Medium };
    vec![DetectedSignal {
        signal_type: "concentration.revenue_top_customer".to_string(),
        fingerprint: fingerprint(&ctx.business_id_key, "concentration.revenue_top_customer", &customer),
        domain: Domain::Concentration,
        severity,
        title: format!("{customer} is most of your revenue"),
        summary: format!("{customer} accounts for {:.0}% of revenue over the last 30 days.", share * 100.0),
        payload: json!({
            "window": window_json(start, ctx.now),
            "customer": customer,
            "current_total": amount,
            "share": share,
            "ledger_anchors": [{"anchor_key": "current_window", "evidence_keys": ["current_total"]}],
        }),
        ledger_anchors: vec![LedgerAnchor {
            anchor_key: "current_window".to_string(),
            query: json!({"start": start.to_rfc3339(), "end": ctx.now.to_rfc3339(), "direction": "inflow", "merchant_keys": [customer]}),
            evidence_keys: vec!["current_total".to_string()],
        }],
    }]
}

/// `concentration.expense_top_vendor` — top outflow vendor's share of 30-day
/// spend. Fires at ≥40% share; `high` at ≥60%.
#[must_use]
pub fn concentration_expense_top_vendor(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let start = ctx.now - Duration::days(30);
    let window = outflows(&in_window(ctx.txns, start, ctx.now));
    let Some((vendor, amount, share)) = top_counterparty_share(&window) else {
        return Vec::new();
    };
    if share < 0.40 {
        return Vec::new();
    }
    let severity = if share >= 0.60 { Severity::High } else { Severity::Medium };
    vec![DetectedSignal {
        signal_type: "concentration.expense_top_vendor".to_string(),
        fingerprint: fingerprint(&ctx.business_id_key, "concentration.expense_top_vendor", &vendor),
        domain: Domain::Concentration,
        severity,
        title: format!("{vendor} dominates spend"),
        summary: format!("{vendor} accounts for {:.0}% of outflow over the last 30 days.", share * 100.0),
        payload: json!({
            "window": window_json(start, ctx.now),
            "vendor": vendor,
            "current_total": amount,
            "share": share,
            "ledger_anchors": [{"anchor_key": "current_window", "evidence_keys": ["current_total"]}],
        }),
        ledger_anchors: vec![anchor_for_vendor(&vendor, start, ctx.now)],
    }]
}

/// `hygiene.uncategorized_high` — share of 30-day transactions with no
/// resolved `TxnCategorization`. Fires at ≥25% share; `high` at ≥50%.
#[must_use]
pub fn hygiene_uncategorized_high(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let start = ctx.now - Duration::days(30);
    let window = in_window(ctx.txns, start, ctx.now);
    if window.is_empty() {
        return Vec::new();
    }
    let uncategorized = window.iter().filter(|t| !ctx.categorized_ids.contains(&t.source_event_id)).count();
    let share = uncategorized as f64 / window.len() as f64;
    if share < 0.25 {
        return Vec::new();
    }
    let severity = if share >= 0.50 { Severity::High } else { Severity::Medium };
    vec![DetectedSignal {
        signal_type: "hygiene.uncategorized_high".to_string(),
        fingerprint: fingerprint(&ctx.business_id_key, "hygiene.uncategorized_high", ""),
        domain: Domain::Hygiene,
        severity,
        title: "Too many uncategorized transactions".to_string(),
        summary: format!("{:.0}% of the last 30 days' transactions have no category.", share * 100.0),
        payload: json!({
            "window": window_json(start, ctx.now),
            "uncategorized_count": uncategorized,
            "total_count": window.len(),
            "share": share,
        }),
        ledger_anchors: Vec::new(),
    }]
}

/// `hygiene.signal_flapping` — a signal type the caller has already
/// determined (from the audit log) transitioned status ≥3 times in the last
/// 14 days. This detector doesn't recompute flap counts itself — that is
/// `ActionPolicy`'s job — it only surfaces the fact as a hygiene signal so
/// it shows up in the health score and case list too.
#[must_use]
pub fn hygiene_signal_flapping(ctx: &DetectorContext<'_>) -> Vec<DetectedSignal> {
    let mut flapping: Vec<&String> = ctx.flapping_signal_types.iter().collect();
    flapping.sort();
    flapping
        .into_iter()
        .map(|signal_type| DetectedSignal {
            signal_type: "hygiene.signal_flapping".to_string(),
            fingerprint: fingerprint(&ctx.business_id_key, "hygiene.signal_flapping", signal_type),
            domain: Domain::Hygiene,
            severity: Severity::Low,
            title: format!("{signal_type} is flapping"),
            summary: format!("{signal_type} has changed status repeatedly in the last 14 days."),
            payload: json!({"signal_type": signal_type}),
            ledger_anchors: Vec::new(),
        })
        .collect()
}

/// Runs every detector once and returns `(signals, diagnostics)`, `spec.md`
/// §4.5's contract.
#[must_use]
pub fn run_all(ctx: &DetectorContext<'_>) -> (Vec<DetectedSignal>, Vec<DetectorDiagnostic>) {
    let detectors: Vec<(&'static str, fn(&DetectorContext<'_>) -> Vec<DetectedSignal>)> = vec![
        ("expense_creep_by_vendor", expense_creep_by_vendor),
        ("low_cash_runway", low_cash_runway),
        ("unusual_outflow_spike", unusual_outflow_spike),
        ("revenue.decline_vs_baseline", revenue_decline_vs_baseline),
        ("revenue.volatility_spike", revenue_volatility_spike),
        ("expense.spike_vs_baseline", expense_spike_vs_baseline),
        ("expense.new_recurring", expense_new_recurring),
        ("timing.inflow_outflow_mismatch", timing_inflow_outflow_mismatch),
        ("timing.payroll_rent_cliff", timing_payroll_rent_cliff),
        ("concentration.revenue_top_customer", concentration_revenue_top_customer),
        ("concentration.expense_top_vendor", concentration_expense_top_vendor),
        ("hygiene.uncategorized_high", hygiene_uncategorized_high),
        ("hygiene.signal_flapping", hygiene_signal_flapping),
    ];

    let mut signals = Vec::new();
    let mut diagnostics = Vec::with_capacity(detectors.len());
    for (name, detector) in detectors {
        let fired = detector(ctx);
        let evidence_keys: Vec<String> = fired
            .iter()
            .flat_map(|s| s.ledger_anchors.iter().flat_map(|a| a.evidence_keys.clone()))
            .collect();
        diagnostics.push(DetectorDiagnostic {
            detector: name,
            ran: true,
            skipped_reason: None,
            fired: !fired.is_empty(),
            evidence_keys,
        });
        signals.extend(fired);
    }
    (signals, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fh_types::{BusinessId, Direction};

    fn txn(business_id: BusinessId, days_ago: i64, amount: f64, direction: Direction, merchant: &str, now: DateTime<Utc>) -> PostedTxn {
        let at = now - Duration::days(days_ago);
        PostedTxn {
            business_id,
            source_event_id: format!("tx-{days_ago}-{merchant}-{amount}"),
            canonical_source_event_id: format!("tx-{days_ago}-{merchant}-{amount}"),
            source: "plaid".into(),
            occurred_at: at,
            amount: Money::from_f64(amount),
            direction,
            signed_amount: match direction {
                Direction::Inflow => Money::from_f64(amount),
                Direction::Outflow => Money::from_f64(-amount),
            },
            description: merchant.to_string(),
            counterparty: Some(merchant.to_string()),
            merchant_key: Some(merchant.to_string()),
            category_hint: None,
        }
    }

    #[test]
    fn expense_creep_fires_at_s3_scenario_thresholds() {
        let business_id = BusinessId::new();
        let now = Utc::now();
        let mut txns = Vec::new();
        // 14-day current window: $800 to Acme. `days_ago` 1..=4 so none lands
        // on the exclusive `now` boundary `in_window` filters against.
        for i in 1..=4 {
            txns.push(txn(business_id, i, 200.0, Direction::Outflow, "acme", now));
        }
        // prior 14-day window: $400 to Acme.
        txns.push(txn(business_id, 16, 400.0, Direction::Outflow, "acme", now));

        let categorized = HashSet::new();
        let flapping = HashSet::new();
        let ctx = DetectorContext {
            business_id_key: business_id.to_string(),
            txns: &txns,
            now,
            current_cash: Money::from_f64(10_000.0),
            categorized_ids: &categorized,
            flapping_signal_types: &flapping,
        };

        let signals = expense_creep_by_vendor(&ctx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::Medium);
        assert_eq!(signals[0].payload["current_total"], json!(800.0));
        assert_eq!(signals[0].payload["prior_total"], json!(400.0));
    }

    #[test]
    fn low_cash_runway_severity_bands() {
        let business_id = BusinessId::new();
        let now = Utc::now();
        let mut txns = Vec::new();
        for i in 0..30 {
            txns.push(txn(business_id, i, 100.0, Direction::Outflow, "rent", now));
        }
        let categorized = HashSet::new();
        let flapping = HashSet::new();
        let ctx = DetectorContext {
            business_id_key: business_id.to_string(),
            txns: &txns,
            now,
            current_cash: Money::from_f64(1_500.0),
            categorized_ids: &categorized,
            flapping_signal_types: &flapping,
        };
        let signals = low_cash_runway(&ctx);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].severity, Severity::High);
    }

    #[test]
    fn domain_of_maps_dotted_and_bare_names() {
        assert_eq!(domain_of("revenue.decline_vs_baseline"), Domain::Revenue);
        assert_eq!(domain_of("expense_creep_by_vendor"), Domain::Expense);
        assert_eq!(domain_of("low_cash_runway"), Domain::Liquidity);
        assert_eq!(domain_of("hygiene.uncategorized_high"), Domain::Hygiene);
    }
}
