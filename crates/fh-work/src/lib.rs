//! Deterministic per-case work-item materialization (`spec.md` §4.8,
//! component H): the condition table, sort tuple and upsert/auto-resolve
//! loop all follow `spec.md` §4.8 directly.
//!
//! `work_item` has no `resolved_at` column in this schema (unlike
//! `action_item`); auto-resolution is still recorded, as a
//! `WORK_ITEM_AUTO_RESOLVED` case-timeline event carrying the resolution
//! timestamp, rather than a stored column.

#![deny(missing_docs)]

use chrono::{DateTime, Duration, Utc};
use fh_types::{BusinessId, CaseId, CaseStatus, FhError, Severity, WorkItemStatus, WorkItemType};
use serde_json::json;
use sqlx::PgConnection;
use uuid::Uuid;

fn item_type_str(item_type: WorkItemType) -> &'static str {
    match item_type {
        WorkItemType::SlaBreach => "sla_breach",
        WorkItemType::PlanOverdue => "plan_overdue",
        WorkItemType::NoPlan => "no_plan",
        WorkItemType::HighSeverityTriage => "high_severity_triage",
        WorkItemType::ReviewDue => "review_due",
        WorkItemType::UnassignedCase => "unassigned_case",
    }
}

fn item_type_from_str(s: &str) -> Result<WorkItemType, FhError> {
    Ok(match s {
        "sla_breach" => WorkItemType::SlaBreach,
        "plan_overdue" => WorkItemType::PlanOverdue,
        "no_plan" => WorkItemType::NoPlan,
        "high_severity_triage" => WorkItemType::HighSeverityTriage,
        "review_due" => WorkItemType::ReviewDue,
        "unassigned_case" => WorkItemType::UnassignedCase,
        other => return Err(FhError::Validation(format!("unknown work item type {other}"))),
    })
}

fn status_str(status: WorkItemStatus) -> &'static str {
    match status {
        WorkItemStatus::Open => "open",
        WorkItemStatus::Snoozed => "snoozed",
        WorkItemStatus::Completed => "completed",
    }
}

fn status_from_str(s: &str) -> Result<WorkItemStatus, FhError> {
    Ok(match s {
        "open" => WorkItemStatus::Open,
        "snoozed" => WorkItemStatus::Snoozed,
        "completed" => WorkItemStatus::Completed,
        other => return Err(FhError::Validation(format!("unknown work item status {other}"))),
    })
}

/// Inputs `GenerateWorkItems` reads off a case's current + derived state.
/// Assembled by the caller from `fh-cases`' `Case` row plus
/// `recompute_case(apply=false)`'s derived output plus a plan lookup.
#[derive(Debug, Clone)]
pub struct WorkItemInputs {
    pub case_id: CaseId,
    pub status: CaseStatus,
    pub severity: Severity,
    pub opened_at: DateTime<Utc>,
    pub next_review_at: Option<DateTime<Utc>>,
    pub assigned_to: Option<String>,
    pub computed_sla_breached: bool,
    pub computed_plan_overdue: bool,
    pub open_signal_count_30d: i64,
    /// `created_at` of the oldest currently-active plan on this case, if any.
    pub active_plan_created_at: Option<DateTime<Utc>>,
    pub has_active_plan: bool,
    pub now: DateTime<Utc>,
}

/// One computed work-item candidate, pre-sort.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemCandidate {
    pub item_type: WorkItemType,
    pub priority: i32,
    pub due_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
}

/// `GenerateWorkItems(case_id, now)`: the condition table from `spec.md`
/// §4.8, sorted by `(-priority, due_at or +inf, type, idempotency_key)`.
#[must_use]
pub fn generate_work_items(inputs: &WorkItemInputs) -> Vec<WorkItemCandidate> {
    let mut out = Vec::new();
    let key_prefix = inputs.case_id.to_string();

    if inputs.computed_sla_breached && inputs.status != CaseStatus::Resolved {
        out.push(WorkItemCandidate {
            item_type: WorkItemType::SlaBreach,
            priority: 100,
            due_at: Some(inputs.now),
            idempotency_key: format!("{key_prefix}:SLA_BREACH"),
        });
    }

    if inputs.computed_plan_overdue {
        let due_at = inputs.active_plan_created_at.map(|t| t + Duration::days(14)).unwrap_or(inputs.now);
        out.push(WorkItemCandidate {
            item_type: WorkItemType::PlanOverdue,
            priority: 90,
            due_at: Some(due_at),
            idempotency_key: format!("{key_prefix}:PLAN_OVERDUE"),
        });
    }

    if inputs.open_signal_count_30d >= 1 && !inputs.has_active_plan {
        out.push(WorkItemCandidate {
            item_type: WorkItemType::NoPlan,
            priority: 70,
            due_at: Some(inputs.opened_at + Duration::days(3)),
            idempotency_key: format!("{key_prefix}:NO_PLAN"),
        });
    }

    if matches!(inputs.severity, Severity::High | Severity::Critical) && inputs.status == CaseStatus::Open {
        out.push(WorkItemCandidate {
            item_type: WorkItemType::HighSeverityTriage,
            priority: 80,
            due_at: Some(inputs.opened_at + Duration::days(1)),
            idempotency_key: format!("{key_prefix}:HIGH_SEVERITY_TRIAGE"),
        });
    }

    if let Some(next_review_at) = inputs.next_review_at {
        if next_review_at <= inputs.now {
            out.push(WorkItemCandidate {
                item_type: WorkItemType::ReviewDue,
                priority: 60,
                due_at: Some(next_review_at),
                idempotency_key: format!("{key_prefix}:REVIEW_DUE:{}", next_review_at.format("%Y-%m-%d")),
            });
        }
    }

    if inputs.assigned_to.is_none() && inputs.status != CaseStatus::Resolved {
        out.push(WorkItemCandidate {
            item_type: WorkItemType::UnassignedCase,
            priority: 50,
            due_at: None,
            idempotency_key: format!("{key_prefix}:UNASSIGNED"),
        });
    }

    out.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.due_at.unwrap_or(DateTime::<Utc>::MAX_UTC).cmp(&b.due_at.unwrap_or(DateTime::<Utc>::MAX_UTC)))
            .then_with(|| item_type_str(a.item_type).cmp(item_type_str(b.item_type)))
            .then_with(|| a.idempotency_key.cmp(&b.idempotency_key))
    });
    out
}

/// A persisted `work_item` row.
#[derive(Debug, Clone)]
pub struct WorkItemRow {
    pub id: Uuid,
    pub case_id: CaseId,
    pub business_id: BusinessId,
    pub idempotency_key: String,
    pub item_type: WorkItemType,
    pub priority: i32,
    pub status: WorkItemStatus,
    pub due_at: Option<DateTime<Utc>>,
    pub snoozed_until: Option<DateTime<Utc>>,
}

/// Repository wrapping `work_item`.
pub struct WorkItemRepo;

impl WorkItemRepo {
    /// Every work item on a case.
    pub async fn list_for_case(conn: &mut PgConnection, case_id: CaseId) -> Result<Vec<WorkItemRow>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT * FROM work_item WHERE case_id = $1")
            .bind(case_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let item_type: String = row.try_get("item_type").map_err(|e| FhError::Storage(e.to_string()))?;
                let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
                Ok(WorkItemRow {
                    id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                    case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    idempotency_key: row.try_get("idempotency_key").map_err(|e| FhError::Storage(e.to_string()))?,
                    item_type: item_type_from_str(&item_type)?,
                    priority: row.try_get("priority").map_err(|e| FhError::Storage(e.to_string()))?,
                    status: status_from_str(&status)?,
                    due_at: row.try_get("due_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    snoozed_until: row.try_get("snoozed_until").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    /// Every work item across a business, newest-case-activity first.
    pub async fn list_for_business(conn: &mut PgConnection, business_id: BusinessId) -> Result<Vec<WorkItemRow>, FhError> {
        use sqlx::Row;
        let rows = sqlx::query("SELECT * FROM work_item WHERE business_id = $1 ORDER BY priority DESC, due_at ASC NULLS LAST")
            .bind(business_id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let item_type: String = row.try_get("item_type").map_err(|e| FhError::Storage(e.to_string()))?;
                let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
                Ok(WorkItemRow {
                    id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
                    case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
                    idempotency_key: row.try_get("idempotency_key").map_err(|e| FhError::Storage(e.to_string()))?,
                    item_type: item_type_from_str(&item_type)?,
                    priority: row.try_get("priority").map_err(|e| FhError::Storage(e.to_string()))?,
                    status: status_from_str(&status)?,
                    due_at: row.try_get("due_at").map_err(|e| FhError::Storage(e.to_string()))?,
                    snoozed_until: row.try_get("snoozed_until").map_err(|e| FhError::Storage(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn insert(conn: &mut PgConnection, row: &WorkItemRow) -> Result<(), FhError> {
        sqlx::query(
            "INSERT INTO work_item (id, case_id, business_id, idempotency_key, item_type, priority, status, due_at, snoozed_until) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(row.id)
        .bind(row.case_id.0)
        .bind(row.business_id.0)
        .bind(&row.idempotency_key)
        .bind(item_type_str(row.item_type))
        .bind(row.priority)
        .bind(status_str(row.status))
        .bind(row.due_at)
        .bind(row.snoozed_until)
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn refresh_priority_due(conn: &mut PgConnection, id: Uuid, priority: i32, due_at: Option<DateTime<Utc>>) -> Result<(), FhError> {
        sqlx::query("UPDATE work_item SET priority = $2, due_at = $3 WHERE id = $1")
            .bind(id)
            .bind(priority)
            .bind(due_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn complete(conn: &mut PgConnection, id: Uuid) -> Result<(), FhError> {
        sqlx::query("UPDATE work_item SET status = 'completed' WHERE id = $1")
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Fetch one row by id.
    pub async fn fetch(conn: &mut PgConnection, id: Uuid) -> Result<WorkItemRow, FhError> {
        use sqlx::Row;
        let row = sqlx::query("SELECT * FROM work_item WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?
            .ok_or_else(|| FhError::NotFound(format!("work item {id}")))?;
        let item_type: String = row.try_get("item_type").map_err(|e| FhError::Storage(e.to_string()))?;
        let status: String = row.try_get("status").map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(WorkItemRow {
            id: row.try_get("id").map_err(|e| FhError::Storage(e.to_string()))?,
            case_id: CaseId(row.try_get("case_id").map_err(|e| FhError::Storage(e.to_string()))?),
            business_id: BusinessId(row.try_get("business_id").map_err(|e| FhError::Storage(e.to_string()))?),
            idempotency_key: row.try_get("idempotency_key").map_err(|e| FhError::Storage(e.to_string()))?,
            item_type: item_type_from_str(&item_type)?,
            priority: row.try_get("priority").map_err(|e| FhError::Storage(e.to_string()))?,
            status: status_from_str(&status)?,
            due_at: row.try_get("due_at").map_err(|e| FhError::Storage(e.to_string()))?,
            snoozed_until: row.try_get("snoozed_until").map_err(|e| FhError::Storage(e.to_string()))?,
        })
    }

    /// `Complete(work_item_id)`: a user marks the item done by hand, ahead
    /// of the detector/derived-state transition that would otherwise
    /// auto-resolve it on the next `Materialize`.
    pub async fn complete_by_user(conn: &mut PgConnection, id: Uuid) -> Result<(), FhError> {
        Self::complete(conn, id).await
    }

    /// `Snooze(work_item_id, until)`.
    pub async fn snooze(conn: &mut PgConnection, id: Uuid, until: DateTime<Utc>) -> Result<(), FhError> {
        sqlx::query("UPDATE work_item SET status = 'snoozed', snoozed_until = $2 WHERE id = $1")
            .bind(id)
            .bind(until)
            .execute(&mut *conn)
            .await
            .map_err(|e| FhError::Storage(e.to_string()))?;
        Ok(())
    }
}

/// Outcome of [`materialize`].
#[derive(Debug, Clone, Default)]
pub struct MaterializeOutcome {
    pub created: usize,
    pub refreshed: usize,
    pub auto_resolved: usize,
}

/// `Materialize(case_id, now)`: diffs `generate_work_items`'s output
/// against the persisted rows and upserts/auto-resolves accordingly.
pub async fn materialize(
    conn: &mut PgConnection,
    business_id: BusinessId,
    inputs: &WorkItemInputs,
    now: DateTime<Utc>,
) -> Result<MaterializeOutcome, FhError> {
    let computed = generate_work_items(inputs);
    let existing = WorkItemRepo::list_for_case(conn, inputs.case_id).await?;
    let mut outcome = MaterializeOutcome::default();

    let computed_keys: std::collections::HashSet<&str> = computed.iter().map(|c| c.idempotency_key.as_str()).collect();

    for candidate in &computed {
        match existing.iter().find(|row| row.idempotency_key == candidate.idempotency_key) {
            None => {
                let row = WorkItemRow {
                    id: Uuid::new_v4(),
                    case_id: inputs.case_id,
                    business_id,
                    idempotency_key: candidate.idempotency_key.clone(),
                    item_type: candidate.item_type,
                    priority: candidate.priority,
                    status: WorkItemStatus::Open,
                    due_at: candidate.due_at,
                    snoozed_until: None,
                };
                WorkItemRepo::insert(conn, &row).await?;
                fh_cases::CaseRepo::insert_case_event(
                    conn,
                    inputs.case_id,
                    business_id,
                    "WORK_ITEM_CREATED",
                    json!({"idempotency_key": candidate.idempotency_key, "item_type": item_type_str(candidate.item_type), "priority": candidate.priority}),
                    now,
                )
                .await?;
                outcome.created += 1;
            }
            Some(row) if matches!(row.status, WorkItemStatus::Open | WorkItemStatus::Snoozed) => {
                if row.priority != candidate.priority || row.due_at != candidate.due_at {
                    WorkItemRepo::refresh_priority_due(conn, row.id, candidate.priority, candidate.due_at).await?;
                    outcome.refreshed += 1;
                }
            }
            Some(_) => {}
        }
    }

    for row in existing.iter().filter(|r| matches!(r.status, WorkItemStatus::Open | WorkItemStatus::Snoozed)) {
        if !computed_keys.contains(row.idempotency_key.as_str()) {
            WorkItemRepo::complete(conn, row.id).await?;
            fh_cases::CaseRepo::insert_case_event(
                conn,
                inputs.case_id,
                business_id,
                "WORK_ITEM_AUTO_RESOLVED",
                json!({"idempotency_key": row.idempotency_key, "resolved_at": now.to_rfc3339()}),
                now,
            )
            .await?;
            outcome.auto_resolved += 1;
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_inputs(case_id: CaseId, now: DateTime<Utc>) -> WorkItemInputs {
        WorkItemInputs {
            case_id,
            status: CaseStatus::Open,
            severity: Severity::Medium,
            opened_at: now - Duration::days(5),
            next_review_at: None,
            assigned_to: Some("alice".into()),
            computed_sla_breached: false,
            computed_plan_overdue: false,
            open_signal_count_30d: 0,
            active_plan_created_at: None,
            has_active_plan: true,
            now,
        }
    }

    #[test]
    fn sla_breach_outranks_everything() {
        let now = Utc::now();
        let case_id = CaseId::new();
        let mut inputs = base_inputs(case_id, now);
        inputs.computed_sla_breached = true;
        inputs.severity = Severity::Critical;
        inputs.status = CaseStatus::Open;

        let items = generate_work_items(&inputs);
        assert_eq!(items[0].item_type, WorkItemType::SlaBreach);
        assert_eq!(items[0].priority, 100);
    }

    #[test]
    fn no_plan_requires_open_signals_and_no_active_plan() {
        let now = Utc::now();
        let case_id = CaseId::new();
        let mut inputs = base_inputs(case_id, now);
        inputs.open_signal_count_30d = 2;
        inputs.has_active_plan = false;
        let items = generate_work_items(&inputs);
        assert!(items.iter().any(|i| i.item_type == WorkItemType::NoPlan));

        inputs.has_active_plan = true;
        let items = generate_work_items(&inputs);
        assert!(!items.iter().any(|i| i.item_type == WorkItemType::NoPlan));
    }

    #[test]
    fn unassigned_case_suppressed_once_resolved() {
        let now = Utc::now();
        let case_id = CaseId::new();
        let mut inputs = base_inputs(case_id, now);
        inputs.assigned_to = None;
        let items = generate_work_items(&inputs);
        assert!(items.iter().any(|i| i.item_type == WorkItemType::UnassignedCase));

        inputs.status = CaseStatus::Resolved;
        let items = generate_work_items(&inputs);
        assert!(!items.iter().any(|i| i.item_type == WorkItemType::UnassignedCase));
    }

    #[test]
    fn sort_order_is_priority_then_due_then_type_then_key() {
        let now = Utc::now();
        let case_id = CaseId::new();
        let mut inputs = base_inputs(case_id, now);
        inputs.computed_plan_overdue = true;
        inputs.severity = Severity::High;
        inputs.assigned_to = None;
        let items = generate_work_items(&inputs);
        let priorities: Vec<i32> = items.iter().map(|i| i.priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }
}
