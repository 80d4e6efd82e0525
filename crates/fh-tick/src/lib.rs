#![deny(missing_docs)]

//! Per-bucket tick orchestration (`spec.md` §4.12) and the Pulse monitoring
//! coordinator (`spec.md` §4.13).
//!
//! [`run_tick`] handles bucket-uniqueness races against `tick_run`, runs a
//! severity-ordered case loop, and captures per-case errors without
//! aborting the whole tick. [`pulse`] composes `fh-raw-events`,
//! `fh-projection`, `fh-detectors` and `fh-signals` the way `spec.md` §4.13
//! describes, gated by `fh_signals::should_skip_reconcile`.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use fh_types::{BusinessId, CaseId, FhError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgConnection, Row};
use tracing::{info, warn};

/// `bucket` is `YYYY-MM-DD` by default, `YYYY-MM-DDTHH` when `hourly`.
#[must_use]
pub fn tick_bucket(now: DateTime<Utc>, hourly: bool) -> String {
    if hourly {
        now.format("%Y-%m-%dT%H").to_string()
    } else {
        now.format("%Y-%m-%d").to_string()
    }
}

/// One case that raised an error during [`run_tick`]; capture-and-continue,
/// never abort the whole tick over one bad case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickError {
    /// `None` only if the case id itself could not be recovered.
    pub case_id: Option<String>,
    /// `Display` of the `FhError` that was raised.
    pub message: String,
}

/// Aggregate counters for one `RunTick` invocation, persisted verbatim as
/// `tick_run.result_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickResult {
    /// Tenant.
    pub business_id: BusinessId,
    /// The bucket this result is cached under.
    pub bucket: String,
    /// How many active cases were considered.
    pub cases_processed: usize,
    /// How many had a non-empty recompute diff.
    pub cases_recompute_changed: usize,
    /// How many diffs were actually applied (`apply_recompute` was set).
    pub cases_recompute_applied: usize,
    /// New work items materialized.
    pub work_items_created: usize,
    /// Existing open/snoozed work items whose priority or due date moved.
    pub work_items_refreshed: usize,
    /// Existing open/snoozed work items auto-resolved because their
    /// condition no longer holds.
    pub work_items_auto_resolved: usize,
    /// Per-case errors; an empty `cases_processed` run or a run with errors
    /// is still considered finished.
    pub errors: Vec<TickError>,
    /// When this tick started.
    pub started_at: DateTime<Utc>,
    /// When this tick finished.
    pub finished_at: DateTime<Utc>,
}

struct TickRunRow {
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    result_json: Option<Value>,
}

async fn fetch_tick_run(conn: &mut PgConnection, business_id: BusinessId, bucket: &str) -> Result<Option<TickRunRow>, FhError> {
    let row = sqlx::query("SELECT started_at, finished_at, result_json FROM tick_run WHERE business_id = $1 AND bucket = $2")
        .bind(business_id.0)
        .bind(bucket)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(TickRunRow {
        started_at: row.try_get("started_at").map_err(|e| FhError::Storage(e.to_string()))?,
        finished_at: row.try_get("finished_at").map_err(|e| FhError::Storage(e.to_string()))?,
        result_json: row.try_get("result_json").map_err(|e| FhError::Storage(e.to_string()))?,
    }))
}

fn result_from_row(row: &TickRunRow) -> Result<TickResult, FhError> {
    let value = row
        .result_json
        .clone()
        .ok_or_else(|| FhError::Invariant("finished tick_run row is missing result_json".to_string()))?;
    serde_json::from_value(value).map_err(|e| FhError::Storage(e.to_string()))
}

/// `RunTick(business_id, bucket, apply_recompute, materialize_work,
/// limit_cases)` (`spec.md` §4.12): exactly-once recompute+materialize pass
/// over a business's active cases for one time bucket.
///
/// `bucket` defaults to today's UTC date (`tick_bucket(now, false)`) when
/// `None`. If a finished `tick_run` row already exists for
/// `(business_id, bucket)`, its cached `result_json` is returned without
/// doing any work — this makes repeated calls for the same bucket free.
pub async fn run_tick(
    conn: &mut PgConnection,
    business_id: BusinessId,
    bucket: Option<String>,
    apply_recompute: bool,
    materialize_work: bool,
    limit_cases: Option<usize>,
    now: DateTime<Utc>,
) -> Result<TickResult, FhError> {
    let bucket = bucket.unwrap_or_else(|| tick_bucket(now, false));

    if let Some(existing) = fetch_tick_run(conn, business_id, &bucket).await? {
        if existing.finished_at.is_some() {
            return result_from_row(&existing);
        }
    } else {
        let inserted = sqlx::query("INSERT INTO tick_run (business_id, bucket, started_at) VALUES ($1, $2, $3) ON CONFLICT (business_id, bucket) DO NOTHING")
            .bind(business_id.0)
            .bind(&bucket)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        if inserted.rows_affected() == 0 {
            // Lost the race: someone else inserted this bucket's row first.
            if let Some(repeat) = fetch_tick_run(conn, business_id, &bucket).await? {
                if repeat.finished_at.is_some() {
                    return result_from_row(&repeat);
                }
            }
        }
    }

    let mut candidates = fh_cases::CaseRepo::list_active_for_business(conn, business_id).await?;
    if let Some(limit) = limit_cases {
        candidates.truncate(limit);
    }

    let mut errors = Vec::new();
    let mut cases_recompute_changed = 0usize;
    let mut cases_recompute_applied = 0usize;
    let mut work_items_created = 0usize;
    let mut work_items_refreshed = 0usize;
    let mut work_items_auto_resolved = 0usize;

    for case in &candidates {
        match run_tick_for_case(conn, case.id, apply_recompute, materialize_work, now).await {
            Ok((recompute, materialize)) => {
                if recompute.changed {
                    cases_recompute_changed += 1;
                }
                if recompute.applied {
                    cases_recompute_applied += 1;
                }
                if let Some(materialize) = materialize {
                    work_items_created += materialize.created;
                    work_items_refreshed += materialize.refreshed;
                    work_items_auto_resolved += materialize.auto_resolved;
                }
            }
            Err(e) => {
                warn!(case_id = %case.id, error = %e, "tick: case failed, continuing");
                errors.push(TickError {
                    case_id: Some(case.id.to_string()),
                    message: e.to_string(),
                });
            }
        }
    }

    let finished_at = Utc::now().max(now);
    let result = TickResult {
        business_id,
        bucket: bucket.clone(),
        cases_processed: candidates.len(),
        cases_recompute_changed,
        cases_recompute_applied,
        work_items_created,
        work_items_refreshed,
        work_items_auto_resolved,
        errors,
        started_at: now,
        finished_at,
    };

    sqlx::query("UPDATE tick_run SET finished_at = $1, result_json = $2 WHERE business_id = $3 AND bucket = $4")
        .bind(finished_at)
        .bind(serde_json::to_value(&result).map_err(|e| FhError::Storage(e.to_string()))?)
        .bind(business_id.0)
        .bind(&bucket)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

    info!(business_id = %business_id, bucket = %bucket, cases = result.cases_processed, errors = result.errors.len(), "tick finished");
    Ok(result)
}

async fn run_tick_for_case(
    conn: &mut PgConnection,
    case_id: CaseId,
    apply_recompute: bool,
    materialize_work: bool,
    now: DateTime<Utc>,
) -> Result<(fh_cases::RecomputeOutcome, Option<fh_work::MaterializeOutcome>), FhError> {
    let recompute = fh_cases::recompute_case(conn, case_id, apply_recompute, now).await?;
    if !materialize_work {
        return Ok((recompute, None));
    }

    let case = fh_cases::CaseRepo::fetch_case(conn, case_id).await?;
    let active_plan_created_at = fh_cases::CaseRepo::oldest_active_plan_created_at(conn, case_id).await?;
    let inputs = fh_work::WorkItemInputs {
        case_id,
        status: case.status,
        severity: recompute.derived.severity,
        opened_at: case.opened_at,
        next_review_at: case.next_review_at,
        assigned_to: case.assigned_to.clone(),
        computed_sla_breached: recompute.derived.computed_sla_breached,
        computed_plan_overdue: recompute.derived.computed_plan_overdue,
        open_signal_count_30d: recompute.derived.computed_open_signal_count_30d,
        active_plan_created_at,
        has_active_plan: active_plan_created_at.is_some(),
        now,
    };
    let materialize = fh_work::materialize(conn, case.business_id, &inputs, now).await?;
    Ok((recompute, Some(materialize)))
}

/// Snapshot of a business's `monitor_runtime` row, for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    /// Newest raw-event cursor the last pulse observed, if any.
    pub last_cursor_time: Option<DateTime<Utc>>,
    /// Source event id paired with `last_cursor_time`.
    pub last_cursor_event: Option<String>,
    /// When `pulse` last ran (regardless of whether it actually reconciled).
    pub last_pulse_at: Option<DateTime<Utc>>,
}

/// Reads a business's `monitor_runtime` row, `None` before its first pulse.
pub async fn monitor_status(conn: &mut PgConnection, business_id: BusinessId) -> Result<Option<MonitorStatus>, FhError> {
    Ok(fetch_monitor_runtime(conn, business_id).await?.map(|r| MonitorStatus {
        last_cursor_time: r.last_cursor_time,
        last_cursor_event: r.last_cursor_event,
        last_pulse_at: r.last_pulse_at,
    }))
}

/// Outcome of one [`pulse`] call. Not persisted — the caller (`fh-api`'s
/// scheduler endpoint, or a cron-driven binary) logs or reports it directly.
#[derive(Debug, Clone)]
pub struct PulseOutcome {
    /// `true` if detection actually ran this call.
    pub ran: bool,
    /// Why it was skipped, when `ran` is `false`.
    pub skipped_reason: Option<String>,
    /// Signals reconciled, when `ran` is `true`.
    pub signals_reconciled: usize,
    /// Diagnostics from every detector that ran, when `ran` is `true`.
    pub diagnostics: Vec<fh_detectors::DetectorDiagnostic>,
}

struct MonitorRuntimeRow {
    last_cursor_time: Option<DateTime<Utc>>,
    last_cursor_event: Option<String>,
    last_pulse_at: Option<DateTime<Utc>>,
}

async fn fetch_monitor_runtime(conn: &mut PgConnection, business_id: BusinessId) -> Result<Option<MonitorRuntimeRow>, FhError> {
    let row = sqlx::query("SELECT last_cursor_time, last_cursor_event, last_pulse_at FROM monitor_runtime WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    let Some(row) = row else { return Ok(None) };
    Ok(Some(MonitorRuntimeRow {
        last_cursor_time: row.try_get("last_cursor_time").map_err(|e| FhError::Storage(e.to_string()))?,
        last_cursor_event: row.try_get("last_cursor_event").map_err(|e| FhError::Storage(e.to_string()))?,
        last_pulse_at: row.try_get("last_pulse_at").map_err(|e| FhError::Storage(e.to_string()))?,
    }))
}

async fn upsert_monitor_runtime(
    conn: &mut PgConnection,
    business_id: BusinessId,
    cursor: Option<(DateTime<Utc>, &str)>,
    pulse_at: DateTime<Utc>,
) -> Result<(), FhError> {
    sqlx::query(
        "INSERT INTO monitor_runtime (business_id, last_cursor_time, last_cursor_event, last_pulse_at) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (business_id) DO UPDATE SET \
            last_cursor_time = EXCLUDED.last_cursor_time, \
            last_cursor_event = EXCLUDED.last_cursor_event, \
            last_pulse_at = EXCLUDED.last_pulse_at",
    )
    .bind(business_id.0)
    .bind(cursor.map(|c| c.0))
    .bind(cursor.map(|c| c.1))
    .bind(pulse_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| FhError::Storage(e.to_string()))?;
    Ok(())
}

/// Signal types with at least 3 `signal_status_changed`/`signal_updated`
/// audit transitions in the last 14 days, for `hygiene.signal_flapping`.
async fn flapping_signal_types(conn: &mut PgConnection, business_id: BusinessId, now: DateTime<Utc>) -> Result<HashSet<String>, FhError> {
    let entries = fh_audit::list_audit_events(conn, business_id, now - Duration::days(14), now, None).await?;
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for entry in &entries {
        if !matches!(entry.kind.as_str(), "signal_status_changed" | "signal_updated") {
            continue;
        }
        let Some(signal_type) = entry
            .after_state
            .as_ref()
            .and_then(|v| v.get("signal_type"))
            .and_then(|v| v.as_str())
        else {
            continue;
        };
        *counts.entry(signal_type.to_string()).or_insert(0) += 1;
    }
    Ok(counts.into_iter().filter(|(_, count)| *count >= 3).map(|(k, _)| k).collect())
}

async fn categorized_source_event_ids(conn: &mut PgConnection, business_id: BusinessId) -> Result<HashSet<String>, FhError> {
    let rows = sqlx::query("SELECT source_event_id FROM txn_categorization WHERE business_id = $1")
        .bind(business_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
    rows.into_iter()
        .map(|row| row.try_get::<String, _>("source_event_id").map_err(|e| FhError::Storage(e.to_string())))
        .collect()
}

/// Running cash balance as of the newest posted transaction, opening
/// balance zero, matching the runway detector's own convention.
/// There is no persisted opening-balance column in this schema; ledger
/// endpoints that need a real one take `starting_cash` from the caller
/// (`spec.md` §4.3), but detection always starts from zero.
fn current_cash_balance(txns: &[fh_projection::PostedTxn]) -> fh_types::Money {
    txns.iter().fold(fh_types::Money::zero(), |acc, txn| acc + txn.signed_amount)
}

/// `Pulse(business_id, now, force_run)` (`spec.md` §4.13): the monitoring
/// coordinator a scheduler calls on a short interval. Compares the newest
/// raw-event cursor against the business's persisted `monitor_runtime` row
/// via [`fh_signals::should_skip_reconcile`]; when the cursor has moved (or
/// `force_run` is set, or the cooldown has lapsed), projects the ledger,
/// runs every detector, reconciles signals, and advances the cursor.
pub async fn pulse(conn: &mut PgConnection, business_id: BusinessId, now: DateTime<Utc>, force_run: bool) -> Result<PulseOutcome, FhError> {
    let raw_events = fh_raw_events::RawEventRepo::fetch_all(conn, business_id, None).await?;
    let latest = fh_raw_events::latest_per_canonical(&raw_events, true);
    let newest_cursor = latest
        .iter()
        .max_by_key(|row| (row.occurred_at, row.source_event_id.clone()))
        .map(|row| (row.occurred_at, row.source_event_id.as_str()));

    let runtime = fetch_monitor_runtime(conn, business_id).await?;
    let last_cursor = runtime
        .as_ref()
        .and_then(|r| r.last_cursor_time.map(|t| (t, r.last_cursor_event.as_deref().unwrap_or(""))));
    let last_pulse_at = runtime.as_ref().and_then(|r| r.last_pulse_at);

    if fh_signals::should_skip_reconcile(newest_cursor, last_cursor, now, last_pulse_at, force_run) {
        upsert_monitor_runtime(conn, business_id, last_cursor, now).await?;
        return Ok(PulseOutcome {
            ran: false,
            skipped_reason: Some("cursor_unchanged_and_recently_pulsed".to_string()),
            signals_reconciled: 0,
            diagnostics: Vec::new(),
        });
    }

    let (txns, projection_errors) = fh_projection::project(&raw_events);
    for err in &projection_errors {
        warn!(business_id = %business_id, error = ?err, "pulse: raw event failed to project, skipping");
    }

    let categorized_ids = categorized_source_event_ids(conn, business_id).await?;
    let flapping = flapping_signal_types(conn, business_id, now).await?;
    let current_cash = current_cash_balance(&txns);

    let ctx = fh_detectors::DetectorContext {
        business_id_key: business_id.to_string(),
        txns: &txns,
        now,
        current_cash,
        categorized_ids: &categorized_ids,
        flapping_signal_types: &flapping,
    };
    let (detected, diagnostics) = fh_detectors::run_all(&ctx);

    let outcome = fh_signals::reconcile_and_persist(conn, business_id, &detected, now).await?;
    upsert_monitor_runtime(conn, business_id, newest_cursor, now).await?;

    info!(business_id = %business_id, detected = detected.len(), reconciled = outcome.rows.len(), "pulse ran");
    Ok(PulseOutcome {
        ran: true,
        skipped_reason: None,
        signals_reconciled: outcome.rows.len(),
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn tick_bucket_daily_and_hourly() {
        let now = Utc.with_ymd_and_hms(2026, 7, 29, 14, 32, 0).unwrap();
        assert_eq!(tick_bucket(now, false), "2026-07-29");
        assert_eq!(tick_bucket(now, true), "2026-07-29T14");
    }
}
