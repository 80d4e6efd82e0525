//! Multi-condition observational plans (`spec.md` §4.10, component K).
//!
//! The evaluation-window, baseline-window, signal-success and metric-verdict
//! helpers follow `spec.md` §4.10 directly; the CRUD/lifecycle functions are
//! built around this schema's `plan`/`plan_condition`/`plan_observation`/
//! `plan_state_event` tables (no separate `created_by_user_id`/
//! `source_action_id`/`primary_signal_id` columns here — those stay at the
//! call site, in `fh-api`).

#![deny(missing_docs)]

use chrono::{DateTime, Duration, NaiveDate, Utc};
use fh_types::{BusinessId, CaseId, FhError, MetricDirection, PlanId, PlanStatus, PlanVerdict, SignalId, SignalStatus};
use serde_json::{json, Value};
use sqlx::PgConnection;
use uuid::Uuid;

fn status_str(status: PlanStatus) -> &'static str {
    match status {
        PlanStatus::Draft => "draft",
        PlanStatus::Active => "active",
        PlanStatus::Succeeded => "succeeded",
        PlanStatus::Failed => "failed",
        PlanStatus::Canceled => "canceled",
    }
}

fn status_from_str(s: &str) -> Result<PlanStatus, FhError> {
    Ok(match s {
        "draft" => PlanStatus::Draft,
        "active" => PlanStatus::Active,
        "succeeded" => PlanStatus::Succeeded,
        "failed" => PlanStatus::Failed,
        "canceled" => PlanStatus::Canceled,
        other => return Err(FhError::Validation(format!("unknown plan status {other}"))),
    })
}

fn verdict_str(v: PlanVerdict) -> &'static str {
    match v {
        PlanVerdict::NoChange => "no_change",
        PlanVerdict::Improving => "improving",
        PlanVerdict::Worsening => "worsening",
        PlanVerdict::Success => "success",
        PlanVerdict::Failure => "failure",
    }
}

fn verdict_from_str(s: &str) -> Result<PlanVerdict, FhError> {
    Ok(match s {
        "no_change" => PlanVerdict::NoChange,
        "improving" => PlanVerdict::Improving,
        "worsening" => PlanVerdict::Worsening,
        "success" => PlanVerdict::Success,
        "failure" => PlanVerdict::Failure,
        other => return Err(FhError::Validation(format!("unknown plan verdict {other}"))),
    })
}

fn direction_str(d: MetricDirection) -> &'static str {
    match d {
        MetricDirection::Improve => "improve",
        MetricDirection::Worsen => "worsen",
        MetricDirection::Resolve => "resolve",
    }
}

fn direction_from_str(s: &str) -> Result<MetricDirection, FhError> {
    Ok(match s {
        "improve" => MetricDirection::Improve,
        "worsen" => MetricDirection::Worsen,
        "resolve" => MetricDirection::Resolve,
        other => return Err(FhError::Validation(format!("unknown plan condition direction {other}"))),
    })
}

fn condition_type_str(t: PlanConditionType) -> &'static str {
    match t {
        PlanConditionType::SignalResolved => "signal_resolved",
        PlanConditionType::MetricDelta => "metric_delta",
    }
}

fn condition_type_from_str(s: &str) -> Result<PlanConditionType, FhError> {
    Ok(match s {
        "signal_resolved" => PlanConditionType::SignalResolved,
        "metric_delta" => PlanConditionType::MetricDelta,
        other => return Err(FhError::Validation(format!("unknown plan condition type {other}"))),
    })
}

/// Which shape a [`PlanCondition`] checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanConditionType {
    /// Satisfied once the referenced signal has stayed resolved for the
    /// evaluation window.
    SignalResolved,
    /// Satisfied once a daily-brief metric moves past `threshold` in
    /// `direction` between the baseline and evaluation windows.
    MetricDelta,
}

/// A persisted `plan` row.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Surrogate id.
    pub id: PlanId,
    /// Owning case.
    pub case_id: CaseId,
    /// Tenant.
    pub business_id: BusinessId,
    /// Short human title.
    pub title: String,
    /// Lifecycle status.
    pub status: PlanStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Set by `Activate`.
    pub activated_at: Option<DateTime<Utc>>,
    /// Set by `Close`.
    pub closed_at: Option<DateTime<Utc>>,
    /// Free-text assignee.
    pub assigned_to: Option<String>,
    /// Verdict from the most recent `Refresh`.
    pub last_verdict: Option<PlanVerdict>,
    /// When `Refresh` last ran.
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Optional caller-supplied dedupe key, unique per business when set.
    pub idempotency_key: Option<String>,
}

/// A persisted `plan_condition` row.
#[derive(Debug, Clone)]
pub struct PlanCondition {
    /// Surrogate id.
    pub id: Uuid,
    /// Owning plan.
    pub plan_id: PlanId,
    /// Which condition shape this row checks.
    pub condition_type: PlanConditionType,
    /// Required for `signal_resolved`.
    pub source_signal_id: Option<SignalId>,
    /// Required for `metric_delta`.
    pub metric_key: Option<String>,
    /// Length of the baseline window, in days.
    pub baseline_window_days: Option<i32>,
    /// Length of the evaluation window, in days.
    pub evaluation_window_days: i32,
    /// Required for `metric_delta`.
    pub threshold: Option<f64>,
    /// Required for `metric_delta`.
    pub direction: Option<MetricDirection>,
}

/// Inputs to [`CreatePlan`](create_plan) for one condition, before it has an
/// id or a plan to belong to.
#[derive(Debug, Clone)]
pub struct NewCondition {
    /// see [`PlanCondition::condition_type`]
    pub condition_type: PlanConditionType,
    /// see [`PlanCondition::source_signal_id`]
    pub source_signal_id: Option<SignalId>,
    /// see [`PlanCondition::metric_key`]
    pub metric_key: Option<String>,
    /// see [`PlanCondition::baseline_window_days`]
    pub baseline_window_days: Option<i32>,
    /// see [`PlanCondition::evaluation_window_days`]
    pub evaluation_window_days: i32,
    /// see [`PlanCondition::threshold`]
    pub threshold: Option<f64>,
    /// see [`PlanCondition::direction`]
    pub direction: Option<MetricDirection>,
}

/// A persisted `plan_observation` row (one per `Refresh` call).
#[derive(Debug, Clone)]
pub struct PlanObservation {
    /// Surrogate id.
    pub id: Uuid,
    /// Owning plan.
    pub plan_id: PlanId,
    /// When `Refresh` ran.
    pub observed_at: DateTime<Utc>,
    /// The aggregate verdict across every condition.
    pub verdict: PlanVerdict,
    /// Per-condition evidence, `{"conditions": [...]}`.
    pub evidence_json: Value,
}

/// A persisted `plan_state_event` row.
#[derive(Debug, Clone)]
pub struct PlanStateEvent {
    /// Surrogate id.
    pub id: Uuid,
    /// Owning plan.
    pub plan_id: PlanId,
    /// `"created"`, `"activated"`, `"assigned"`, `"note_added"`,
    /// `"succeeded"`, `"failed"`, `"canceled"`.
    pub kind: String,
    /// Free-form event detail.
    pub payload_json: Value,
    /// When the transition happened.
    pub occurred_at: DateTime<Utc>,
}

/// Reads from `daily_brief_message`, the persisted half of §1's daily-brief
/// data: `PlanEngine`'s `metric_delta` condition is the only consumer of it
/// in this workspace.
pub struct DailyBriefRepo;

impl DailyBriefRepo {
    /// Average `metrics_json[metric_key]` over every row in
    /// `[start_date, end_date]`, plus the `message_date`s that contributed.
    /// Mirrors `_daily_brief_values` + `_average`.
    pub async fn metric_average_in_window(
        conn: &mut PgConnection,
        business_id: BusinessId,
        start_date: NaiveDate,
        end_date: NaiveDate,
        metric_key: &str,
    ) -> Result<(Option<f64>, Vec<NaiveDate>, Vec<Uuid>), FhError> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT id, message_date, metrics_json FROM daily_brief_message \
             WHERE business_id = $1 AND message_date >= $2 AND message_date <= $3 \
             ORDER BY message_date ASC, id ASC",
        )
        .bind(business_id.0)
        .bind(start_date)
        .bind(end_date)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        let mut values = Vec::new();
        let mut dates = Vec::new();
        let mut message_ids = Vec::new();
        for row in rows {
            let id: Uuid = row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?;
            let message_date: NaiveDate = row.try_get("message_date").map_err(|e| FhError::Storage(e.to_string()))?;
            let metrics: Value = row.try_get("metrics_json").map_err(|e| FhError::Storage(e.to_string()))?;
            if let Some(value) = metrics.get(metric_key).and_then(Value::as_f64) {
                values.push(value);
                dates.push(message_date);
                message_ids.push(id);
            }
        }

        Ok((average(&values), dates, message_ids))
    }
}

/// `_average`: `None` for an empty slice, never a division by zero.
fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// `_evaluation_window`: `[activated_at_date, min(today, activated_at_date +
/// eval_days - 1)]`. Requires the plan to carry `activated_at` (i.e. to be
/// past `Activate`).
pub fn evaluation_window(activated_at: DateTime<Utc>, evaluation_window_days: i32, now: DateTime<Utc>) -> (NaiveDate, NaiveDate) {
    let start = activated_at.date_naive();
    let days = evaluation_window_days.max(1) as i64;
    let mut end = start + Duration::days(days - 1);
    let today = now.date_naive();
    if today < end {
        end = today;
    }
    (start, end)
}

/// `_baseline_window`: `baseline_days` ending the day before
/// `evaluation_start`.
pub fn baseline_window(baseline_window_days: i32, evaluation_start: NaiveDate) -> (NaiveDate, NaiveDate) {
    let days = baseline_window_days.max(1) as i64;
    let end = evaluation_start - Duration::days(1);
    let start = end - Duration::days(days - 1);
    (start, end)
}

/// A `signal_resolved` condition is satisfied when the source signal is
/// resolved (or ignored, treated as functionally closed) on or before
/// `evaluation_end`, and has stayed that way for at least
/// `evaluation_window_days`.
pub fn signal_success(
    status: Option<SignalStatus>,
    resolved_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    evaluation_window_days: i32,
    evaluation_end: NaiveDate,
) -> bool {
    let Some(status) = status else { return false };
    if !matches!(status, SignalStatus::Resolved | SignalStatus::Ignored) {
        return false;
    }
    let resolved_at = match resolved_at {
        Some(t) => t,
        None => updated_at,
    };
    let resolved_date = resolved_at.date_naive();
    if resolved_date > evaluation_end {
        return false;
    }
    let stable_days = (evaluation_end - resolved_date).num_days() + 1;
    let required_days = evaluation_window_days.max(1) as i64;
    stable_days >= required_days || resolved_date == evaluation_end
}

/// `_metric_verdict`: threshold comparison for a `metric_delta` condition.
/// Returns the per-condition verdict and whether it counts as a success.
pub fn metric_verdict(delta: Option<f64>, threshold: Option<f64>, direction: MetricDirection) -> (PlanVerdict, bool) {
    let Some(delta) = delta else { return (PlanVerdict::NoChange, false) };
    let threshold = threshold.unwrap_or(0.0);
    match direction {
        MetricDirection::Improve => {
            if delta >= threshold {
                (PlanVerdict::Success, true)
            } else if delta > 0.0 {
                (PlanVerdict::Improving, false)
            } else if delta < 0.0 {
                (PlanVerdict::Worsening, false)
            } else {
                (PlanVerdict::NoChange, false)
            }
        }
        MetricDirection::Worsen => {
            if delta <= -threshold {
                (PlanVerdict::Success, true)
            } else if delta < 0.0 {
                (PlanVerdict::Improving, false)
            } else if delta > 0.0 {
                (PlanVerdict::Worsening, false)
            } else {
                (PlanVerdict::NoChange, false)
            }
        }
        MetricDirection::Resolve => (PlanVerdict::NoChange, false),
    }
}

/// Per-condition result folded into a [`PlanObservation`]'s `evidence_json`.
#[derive(Debug, Clone)]
struct ConditionResult {
    condition_id: Uuid,
    evidence: Value,
    verdict: PlanVerdict,
    success: bool,
}

/// Persistence for `plan`/`plan_condition`/`plan_observation`/`plan_state_event`.
pub struct PlanRepo;

impl PlanRepo {
    /// Fetch a plan, scoped to its business.
    pub async fn fetch(conn: &mut PgConnection, business_id: BusinessId, plan_id: PlanId) -> Result<Option<Plan>, FhError> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT id, case_id, business_id, title, status, created_at, activated_at, closed_at, \
                    assigned_to, last_verdict, last_refreshed_at, idempotency_key \
             FROM plan WHERE id = $1 AND business_id = $2",
        )
        .bind(plan_id.0)
        .bind(business_id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let status_str: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
        let last_verdict_str: Option<String> = row.try_get("last_verdict").map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(Some(Plan {
            id: PlanId(row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?),
            case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
            business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
            title: row.try_get("title").map_err(|e| FhError::Storage(e.to_string()))?,
            status: status_from_str(&status_str)?,
            created_at: row.try_get("created_at").map_err(|e| FhError::Storage(e.to_string()))?,
            activated_at: row.try_get("activated_at").map_err(|e| FhError::Storage(e.to_string()))?,
            closed_at: row.try_get("closed_at").map_err(|e| FhError::Storage(e.to_string()))?,
            assigned_to: row.try_get("assigned_to").map_err(|e| FhError::Storage(e.to_string()))?,
            last_verdict: last_verdict_str.map(|s| verdict_from_str(&s)).transpose()?,
            last_refreshed_at: row.try_get("last_refreshed_at").map_err(|e| FhError::Storage(e.to_string()))?,
            idempotency_key: row.try_get("idempotency_key").map_err(|e| FhError::Storage(e.to_string()))?,
        }))
    }

    /// List every plan for a case, most recently created first.
    pub async fn list_for_case(conn: &mut PgConnection, case_id: CaseId) -> Result<Vec<Plan>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT id, case_id, business_id, title, status, created_at, activated_at, closed_at, \
                    assigned_to, last_verdict, last_refreshed_at, idempotency_key \
             FROM plan WHERE case_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(case_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
                let last_verdict_str: Option<String> = row.try_get("last_verdict").map_err(|e| FhError::Storage(e.to_string()))?;
                Ok(Plan {
                    id: PlanId(row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?),
                    case_id: row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?,
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    title: row.try_get("title").map_err(|e| FhError::Storage(e.to_string()))?,
                    status: status_from_str(&status_str)?,
                    created_at: row.try_get("created_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    activated_at: row.try_get("activated_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    closed_at: row.try_get("closed_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    assigned_to: row.try_get("assigned_to").map_err(|e| FhError::Storage(e.to_string()))?,
                    last_verdict: last_verdict_str.map(|s| verdict_from_str(&s)).transpose()?,
                    last_refreshed_at: row.try_get("last_refreshed_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    idempotency_key: row.try_get("idempotency_key").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    /// Fetch every condition on a plan, in creation (insertion) order.
    pub async fn fetch_conditions(conn: &mut PgConnection, plan_id: PlanId) -> Result<Vec<PlanCondition>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT id, plan_id, condition_type, source_signal_id, metric_key, baseline_window_days, \
                    evaluation_window_days, threshold, direction \
             FROM plan_condition WHERE plan_id = $1 ORDER BY id ASC",
        )
        .bind(plan_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let condition_type_str: String = row.try_get("condition_type").map_err(|e| FhError::Storage(e.to_string()))?;
                let source_signal_id: Option<String> = row.try_get("source_signal_id").map_err(|e| FhError::Storage(e.to_string()))?;
                let direction_str: Option<String> = row.try_get("direction").map_err(|e| FhError::Storage(e.to_string()))?;
                Ok(PlanCondition {
                    id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                    plan_id: PlanId(row.try_get("plan_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    condition_type: condition_type_from_str(&condition_type_str)?,
                    source_signal_id: source_signal_id.map(SignalId),
                    metric_key: row.try_get("metric_key").map_err(|e| FhError::Storage(e.to_string()))?,
                    baseline_window_days: row.try_get("baseline_window_days").map_err(|e| FhError::Storage(e.to_string()))?,
                    evaluation_window_days: row.try_get("evaluation_window_days").map_err(|e| FhError::Storage(e.to_string()))?,
                    threshold: row.try_get("threshold").map_err(|e| FhError::Storage(e.to_string()))?,
                    direction: direction_str.map(|s| direction_from_str(&s)).transpose()?,
                })
            })
            .collect()
    }

    /// Latest observation for a plan, if any.
    pub async fn latest_observation(conn: &mut PgConnection, plan_id: PlanId) -> Result<Option<PlanObservation>, FhError> {
        use sqlx::Row;
        let row = sqlx::query(
            "SELECT id, plan_id, observed_at, verdict, evidence_json FROM plan_observation \
             WHERE plan_id = $1 ORDER BY observed_at DESC, id DESC LIMIT 1",
        )
        .bind(plan_id.0)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };
        let verdict_str: String = row.try_get("verdict").map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(Some(PlanObservation {
            id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
            plan_id: PlanId(row.try_get("plan_id").map_err(|e| FhError::Storage(e.to_string()))?),
            observed_at: row.try_get("observed_at").map_err(|e| FhError::Storage(e.to_string()))?,
            verdict: verdict_from_str(&verdict_str)?,
            evidence_json: row.try_get("evidence_json").map_err(|e| FhError::Storage(e.to_string()))?,
        }))
    }

    /// Every state event on a plan, newest first.
    pub async fn list_state_events(conn: &mut PgConnection, plan_id: PlanId) -> Result<Vec<PlanStateEvent>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT id, plan_id, kind, payload_json, occurred_at FROM plan_state_event \
             WHERE plan_id = $1 ORDER BY occurred_at DESC, id DESC",
        )
        .bind(plan_id.0)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                Ok(PlanStateEvent {
                    id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                    plan_id: PlanId(row.try_get("plan_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    kind: row.try_get("kind").map_err(|e| FhError::Storage(e.to_string()))?,
                    payload_json: row.try_get("payload_json").map_err(|e| FhError::Storage(e.to_string()))?,
                    occurred_at: row.try_get("occurred_at").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn insert_plan(conn: &mut PgConnection, plan: &Plan) -> Result<(), FhError> {
        sqlx::query(
            "INSERT INTO plan (id, case_id, business_id, title, status, created_at, activated_at, \
                                closed_at, assigned_to, last_verdict, last_refreshed_at, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(plan.id.0)
        .bind(plan.case_id.0)
        .bind(plan.business_id.0)
        .bind(&plan.title)
        .bind(status_str(plan.status))
        .bind(plan.created_at)
        .bind(plan.activated_at)
        .bind(plan.closed_at)
        .bind(&plan.assigned_to)
        .bind(plan.last_verdict.map(verdict_str))
        .bind(plan.last_refreshed_at)
        .bind(&plan.idempotency_key)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return FhError::Conflict("plan idempotency_key already exists for this business".into());
                }
            }
            FhError::Storage(e.to_string())
        })?;
        Ok(())
    }

    async fn insert_condition(conn: &mut PgConnection, plan_id: PlanId, condition: &NewCondition) -> Result<Uuid, FhError> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO plan_condition (id, plan_id, condition_type, source_signal_id, metric_key, \
                                          baseline_window_days, evaluation_window_days, threshold, direction) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(id)
        .bind(plan_id.0)
        .bind(condition_type_str(condition.condition_type))
        .bind(condition.source_signal_id.as_ref().map(|s| s.0.clone()))
        .bind(&condition.metric_key)
        .bind(condition.baseline_window_days)
        .bind(condition.evaluation_window_days)
        .bind(condition.threshold)
        .bind(condition.direction.map(direction_str))
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(id)
    }

    async fn update_status(
        conn: &mut PgConnection,
        plan_id: PlanId,
        status: PlanStatus,
        activated_at: Option<DateTime<Utc>>,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<(), FhError> {
        sqlx::query("UPDATE plan SET status = $2, activated_at = COALESCE($3, activated_at), closed_at = COALESCE($4, closed_at) WHERE id = $1")
            .bind(plan_id.0)
            .bind(status_str(status))
            .bind(activated_at)
            .bind(closed_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update_assignee(conn: &mut PgConnection, plan_id: PlanId, assigned_to: Option<&str>) -> Result<(), FhError> {
        sqlx::query("UPDATE plan SET assigned_to = $2 WHERE id = $1")
            .bind(plan_id.0)
            .bind(assigned_to)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update_refresh(conn: &mut PgConnection, plan_id: PlanId, verdict: PlanVerdict, refreshed_at: DateTime<Utc>) -> Result<(), FhError> {
        sqlx::query("UPDATE plan SET last_verdict = $2, last_refreshed_at = $3 WHERE id = $1")
            .bind(plan_id.0)
            .bind(verdict_str(verdict))
            .bind(refreshed_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn insert_observation(conn: &mut PgConnection, observation: &PlanObservation) -> Result<(), FhError> {
        sqlx::query("INSERT INTO plan_observation (id, plan_id, observed_at, verdict, evidence_json) VALUES ($1, $2, $3, $4, $5)")
            .bind(observation.id)
            .bind(observation.plan_id.0)
            .bind(observation.observed_at)
            .bind(verdict_str(observation.verdict))
            .bind(&observation.evidence_json)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn insert_state_event(conn: &mut PgConnection, plan_id: PlanId, kind: &str, payload: Value, occurred_at: DateTime<Utc>) -> Result<(), FhError> {
        sqlx::query("INSERT INTO plan_state_event (id, plan_id, kind, payload_json, occurred_at) VALUES ($1, $2, $3, $4, $5)")
            .bind(Uuid::new_v4())
            .bind(plan_id.0)
            .bind(kind)
            .bind(payload)
            .bind(occurred_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// `CreatePlan`: inserts the plan in `draft` status plus its conditions,
/// and emits the `"created"` state event. At least one condition is
/// required.
pub async fn create_plan(
    conn: &mut PgConnection,
    business_id: BusinessId,
    case_id: CaseId,
    title: &str,
    assigned_to: Option<&str>,
    idempotency_key: Option<&str>,
    conditions: &[NewCondition],
    now: DateTime<Utc>,
) -> Result<Plan, FhError> {
    if conditions.is_empty() {
        return Err(FhError::Validation("a plan requires at least one condition".into()));
    }

    let plan = Plan {
        id: PlanId::new(),
        case_id,
        business_id,
        title: title.to_string(),
        status: PlanStatus::Draft,
        created_at: now,
        activated_at: None,
        closed_at: None,
        assigned_to: assigned_to.map(str::to_string),
        last_verdict: None,
        last_refreshed_at: None,
        idempotency_key: idempotency_key.map(str::to_string),
    };

    PlanRepo::insert_plan(conn, &plan).await?;
    for condition in conditions {
        PlanRepo::insert_condition(conn, plan.id, condition).await?;
    }
    PlanRepo::insert_state_event(conn, plan.id, "created", json!({"to_status": "draft"}), now).await?;
    fh_audit::log_audit_event(conn, business_id, "PLAN_CREATED", None, Some(json!({"plan_id": plan.id.to_string(), "title": title})), now).await?;

    Ok(plan)
}

/// `Activate`: `draft -> active`, stamps `activated_at`.
pub async fn activate(conn: &mut PgConnection, business_id: BusinessId, plan_id: PlanId, now: DateTime<Utc>) -> Result<Plan, FhError> {
    let plan = PlanRepo::fetch(conn, business_id, plan_id).await?.ok_or_else(|| FhError::NotFound("plan not found".into()))?;
    if plan.status != PlanStatus::Draft {
        return Err(FhError::Invariant("plan is not in draft status".into()));
    }
    PlanRepo::update_status(conn, plan_id, PlanStatus::Active, Some(now), None).await?;
    PlanRepo::insert_state_event(conn, plan_id, "activated", json!({"from_status": "draft", "to_status": "active"}), now).await?;
    fh_audit::log_audit_event(
        conn,
        business_id,
        "PLAN_ACTIVATED",
        Some(json!({"status": "draft"})),
        Some(json!({"status": "active", "activated_at": now.to_rfc3339()})),
        now,
    )
    .await?;

    Ok(Plan { status: PlanStatus::Active, activated_at: Some(now), ..plan })
}

/// `Assign`: sets or clears the free-text assignee, any status.
pub async fn assign(conn: &mut PgConnection, business_id: BusinessId, plan_id: PlanId, assigned_to: Option<&str>, now: DateTime<Utc>) -> Result<Plan, FhError> {
    let plan = PlanRepo::fetch(conn, business_id, plan_id).await?.ok_or_else(|| FhError::NotFound("plan not found".into()))?;
    PlanRepo::update_assignee(conn, plan_id, assigned_to).await?;
    PlanRepo::insert_state_event(
        conn,
        plan_id,
        "assigned",
        json!({"assigned_to": assigned_to.unwrap_or("unassigned")}),
        now,
    )
    .await?;

    Ok(Plan { assigned_to: assigned_to.map(str::to_string), ..plan })
}

/// `AddNote`: a free-text note attached to the plan's event timeline; does
/// not change `status`.
pub async fn add_note(conn: &mut PgConnection, business_id: BusinessId, plan_id: PlanId, note: &str, now: DateTime<Utc>) -> Result<(), FhError> {
    let plan = PlanRepo::fetch(conn, business_id, plan_id).await?.ok_or_else(|| FhError::NotFound("plan not found".into()))?;
    let _ = plan;
    PlanRepo::insert_state_event(conn, plan_id, "note_added", json!({"note": note}), now).await?;
    Ok(())
}

/// `Close(outcome)`: terminal transition, any status other than an
/// already-closed one.
pub async fn close(
    conn: &mut PgConnection,
    business_id: BusinessId,
    plan_id: PlanId,
    outcome: PlanStatus,
    note: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Plan, FhError> {
    if !matches!(outcome, PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Canceled) {
        return Err(FhError::Validation("close outcome must be succeeded, failed or canceled".into()));
    }
    let plan = PlanRepo::fetch(conn, business_id, plan_id).await?.ok_or_else(|| FhError::NotFound("plan not found".into()))?;
    if matches!(plan.status, PlanStatus::Succeeded | PlanStatus::Failed | PlanStatus::Canceled) {
        return Err(FhError::Invariant("plan is already closed".into()));
    }

    PlanRepo::update_status(conn, plan_id, outcome, None, Some(now)).await?;
    PlanRepo::insert_state_event(
        conn,
        plan_id,
        status_str(outcome),
        json!({"from_status": status_str(plan.status), "to_status": status_str(outcome), "note": note}),
        now,
    )
    .await?;
    fh_audit::log_audit_event(
        conn,
        business_id,
        "PLAN_CLOSED",
        Some(json!({"status": status_str(plan.status)})),
        Some(json!({"status": status_str(outcome), "note": note})),
        now,
    )
    .await?;

    Ok(Plan { status: outcome, closed_at: Some(now), ..plan })
}

/// One caller-supplied input a `signal_resolved` condition needs, fetched
/// up front so `refresh`'s condition loop stays pure/testable apart from
/// `daily_brief_message` reads.
#[derive(Debug, Clone)]
pub struct SignalSnapshot {
    /// Current lifecycle status.
    pub status: SignalStatus,
    /// Set once the signal transitions to `resolved`.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Last time any field on the signal changed.
    pub updated_at: DateTime<Utc>,
}

/// `Refresh`: evaluates every condition on an active plan, computes the
/// aggregate verdict, and persists a `PlanObservation`.
///
/// `lookup_signal` resolves a `signal_resolved` condition's source signal
/// (the caller is expected to have already loaded `fh_signals::SignalRepo`
/// rows for the business); `daily_brief` reads `metric_delta` windows.
pub async fn refresh(
    conn: &mut PgConnection,
    business_id: BusinessId,
    plan_id: PlanId,
    lookup_signal: impl Fn(&SignalId) -> Option<SignalSnapshot>,
    now: DateTime<Utc>,
) -> Result<(PlanObservation, bool), FhError> {
    let plan = PlanRepo::fetch(conn, business_id, plan_id).await?.ok_or_else(|| FhError::NotFound("plan not found".into()))?;
    if plan.status != PlanStatus::Active {
        return Err(FhError::Invariant("plan is not active".into()));
    }
    let activated_at = plan.activated_at.ok_or_else(|| FhError::Invariant("plan has no activated_at".into()))?;

    let conditions = PlanRepo::fetch_conditions(conn, plan_id).await?;
    let mut results = Vec::with_capacity(conditions.len());
    let mut last_window = evaluation_window(activated_at, 1, now);
    let mut success_candidate = false;

    for condition in &conditions {
        let (evaluation_start, evaluation_end) = evaluation_window(activated_at, condition.evaluation_window_days, now);
        last_window = (evaluation_start, evaluation_end);

        let result = match condition.condition_type {
            PlanConditionType::SignalResolved => {
                let snapshot = condition.source_signal_id.as_ref().and_then(&lookup_signal);
                let is_success = snapshot.as_ref().is_some_and(|s| signal_success(Some(s.status), s.resolved_at, s.updated_at, condition.evaluation_window_days, evaluation_end));
                let verdict = if is_success { PlanVerdict::Success } else { PlanVerdict::NoChange };
                ConditionResult {
                    condition_id: condition.id,
                    evidence: json!({
                        "condition_id": condition.id,
                        "type": "signal_resolved",
                        "signal_id": condition.source_signal_id.as_ref().map(|s| s.0.clone()),
                        "signal_state": snapshot.as_ref().map(|s| format!("{:?}", s.status).to_lowercase()),
                        "evaluation_start": evaluation_start.to_string(),
                        "evaluation_end": evaluation_end.to_string(),
                        "verdict": verdict_str(verdict),
                    }),
                    verdict,
                    success: is_success,
                }
            }
            PlanConditionType::MetricDelta => {
                let metric_key = condition.metric_key.as_deref().unwrap_or_default();
                let (baseline_start, baseline_end) = baseline_window(condition.baseline_window_days.unwrap_or(1), evaluation_start);
                let (baseline_avg, baseline_dates, baseline_ids) = DailyBriefRepo::metric_average_in_window(conn, business_id, baseline_start, baseline_end, metric_key).await?;
                let (evaluation_avg, evaluation_dates, evaluation_ids) = DailyBriefRepo::metric_average_in_window(conn, business_id, evaluation_start, evaluation_end, metric_key).await?;
                let delta = match (baseline_avg, evaluation_avg) {
                    (Some(b), Some(e)) => Some(e - b),
                    _ => None,
                };
                let direction = condition.direction.unwrap_or(MetricDirection::Resolve);
                let (verdict, success) = metric_verdict(delta, condition.threshold, direction);
                ConditionResult {
                    condition_id: condition.id,
                    evidence: json!({
                        "condition_id": condition.id,
                        "type": "metric_delta",
                        "metric_key": metric_key,
                        "metric_baseline": baseline_avg,
                        "metric_value": evaluation_avg,
                        "metric_delta": delta,
                        "direction": direction_str(direction),
                        "threshold": condition.threshold,
                        "baseline_window": {"start": baseline_start.to_string(), "end": baseline_end.to_string()},
                        "evaluation_window": {"start": evaluation_start.to_string(), "end": evaluation_end.to_string()},
                        "baseline_dates": baseline_dates.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "evaluation_dates": evaluation_dates.iter().map(ToString::to_string).collect::<Vec<_>>(),
                        "baseline_message_ids": baseline_ids,
                        "evaluation_message_ids": evaluation_ids,
                        "verdict": verdict_str(verdict),
                    }),
                    verdict,
                    success,
                }
            }
        };

        if result.success {
            success_candidate = true;
        }
        results.push(result);
    }

    let aggregate = if success_candidate {
        PlanVerdict::Success
    } else if results.iter().any(|r| r.verdict == PlanVerdict::Worsening) {
        PlanVerdict::Worsening
    } else if results.iter().any(|r| r.verdict == PlanVerdict::Improving) {
        PlanVerdict::Improving
    } else {
        PlanVerdict::NoChange
    };

    let evidence = json!({"conditions": results.iter().map(|r| r.evidence.clone()).collect::<Vec<_>>()});
    let observation = PlanObservation {
        id: Uuid::new_v4(),
        plan_id,
        observed_at: now,
        verdict: aggregate,
        evidence_json: evidence,
    };

    PlanRepo::insert_observation(conn, &observation).await?;
    PlanRepo::update_refresh(conn, plan_id, aggregate, now).await?;
    let _ = last_window;

    Ok((observation, success_candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn evaluation_window_clamps_to_today() {
        let activated = day(2026, 1, 1);
        let now = day(2026, 1, 5);
        let (start, end) = evaluation_window(activated, 30, now);
        assert_eq!(start, activated.date_naive());
        assert_eq!(end, now.date_naive());
    }

    #[test]
    fn evaluation_window_stops_at_eval_days_once_elapsed() {
        let activated = day(2026, 1, 1);
        let now = day(2026, 3, 1);
        let (start, end) = evaluation_window(activated, 30, now);
        assert_eq!(start, activated.date_naive());
        assert_eq!(end, activated.date_naive() + Duration::days(29));
    }

    #[test]
    fn baseline_window_immediately_precedes_evaluation() {
        let eval_start = day(2026, 2, 1).date_naive();
        let (start, end) = baseline_window(14, eval_start);
        assert_eq!(end, eval_start - Duration::days(1));
        assert_eq!(start, end - Duration::days(13));
    }

    #[test]
    fn signal_success_requires_stability_through_window() {
        let eval_end = day(2026, 1, 30).date_naive();
        let resolved_at = day(2026, 1, 10);
        assert!(signal_success(Some(SignalStatus::Resolved), Some(resolved_at), resolved_at, 14, eval_end));

        let resolved_late = day(2026, 1, 29);
        assert!(!signal_success(Some(SignalStatus::Resolved), Some(resolved_late), resolved_late, 14, eval_end));
        assert!(signal_success(Some(SignalStatus::Resolved), Some(day(2026, 1, 30)), day(2026, 1, 30), 14, eval_end));
    }

    #[test]
    fn signal_success_false_when_open() {
        let eval_end = day(2026, 1, 30).date_naive();
        assert!(!signal_success(Some(SignalStatus::Open), None, day(2026, 1, 1), 14, eval_end));
        assert!(!signal_success(None, None, day(2026, 1, 1), 14, eval_end));
    }

    #[test]
    fn metric_verdict_improve_direction() {
        assert_eq!(metric_verdict(Some(10.0), Some(5.0), MetricDirection::Improve), (PlanVerdict::Success, true));
        assert_eq!(metric_verdict(Some(2.0), Some(5.0), MetricDirection::Improve), (PlanVerdict::Improving, false));
        assert_eq!(metric_verdict(Some(-2.0), Some(5.0), MetricDirection::Improve), (PlanVerdict::Worsening, false));
        assert_eq!(metric_verdict(Some(0.0), Some(5.0), MetricDirection::Improve), (PlanVerdict::NoChange, false));
    }

    #[test]
    fn metric_verdict_worsen_direction() {
        assert_eq!(metric_verdict(Some(-10.0), Some(5.0), MetricDirection::Worsen), (PlanVerdict::Success, true));
        assert_eq!(metric_verdict(Some(-2.0), Some(5.0), MetricDirection::Worsen), (PlanVerdict::Improving, false));
        assert_eq!(metric_verdict(Some(2.0), Some(5.0), MetricDirection::Worsen), (PlanVerdict::Worsening, false));
    }

    #[test]
    fn metric_verdict_none_delta_is_no_change() {
        assert_eq!(metric_verdict(None, Some(5.0), MetricDirection::Improve), (PlanVerdict::NoChange, false));
    }

    #[test]
    fn average_of_empty_is_none() {
        assert_eq!(average(&[]), None);
        assert_eq!(average(&[1.0, 2.0, 3.0]), Some(2.0));
    }
}
