#![deny(missing_docs)]

//! **fh-types** – Shared identifiers, enums and error taxonomy for the
//! financial-health monitoring platform.
//!
//! This crate sits at the bottom of the dependency graph: every engine crate
//! (`fh-ledger`, `fh-detectors`, `fh-cases`, ...) depends on it, and it
//! depends on nothing internal. It makes no assumptions about storage or
//! transport.

pub mod error;
pub mod ids;
pub mod money;
pub mod time;

pub use error::FhError;
pub use ids::{ActionId, BusinessId, CaseId, PlanId, SignalId, WorkItemId};
pub use money::Money;
pub use time::utc_now;

use serde::{Deserialize, Serialize};

/// Direction a posted transaction moves cash for its owning business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Cash entering the business.
    Inflow,
    /// Cash leaving the business.
    Outflow,
}

/// Raw event revision kind, mirroring the provider's change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A brand-new transaction.
    Added,
    /// A revision of a previously seen transaction.
    Modified,
    /// A tombstone: the transaction no longer exists.
    Removed,
}

/// Severity scale shared by signals, cases and the health-score penalty
/// formula. Declaration order is the rank order used by every `Ord`
/// comparison and by `max(a, b)` escalation in `fh-cases` — do not reorder
/// these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational, no action implied.
    Info,
    /// Low priority.
    Low,
    /// Medium priority.
    Medium,
    /// Elevated, non-critical concern.
    Warning,
    /// High priority, should be triaged soon.
    High,
    /// Critical, immediate attention warranted.
    Critical,
}

impl Severity {
    /// Collapse onto the 4-value scale cases use (`spec.md` §4.7): a case's
    /// `severity` field only ever holds `Low`/`Medium`/`High`/`Critical` —
    /// `Info` maps to `Low` and `Warning` maps to `Medium` before taking the
    /// monotonic max with the case's current severity.
    #[must_use]
    pub fn to_case_scale(self) -> Severity {
        match self {
            Severity::Info => Severity::Low,
            Severity::Warning => Severity::Medium,
            other => other,
        }
    }
}

/// Lifecycle status of a persisted `HealthSignalState` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    /// Newly or still detected, awaiting triage.
    Open,
    /// A user has started working the signal.
    InProgress,
    /// No longer detected, or user marked it resolved.
    Resolved,
    /// User has explicitly suppressed the signal.
    Ignored,
}

/// Detector domain. Doubles as the `HealthScoreEngine` domain-weight key and
/// the `Case` grouping key (`spec.md` §4.7, §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    /// Cash runway, burn rate, liquidity risk.
    Liquidity,
    /// Revenue trend and concentration.
    Revenue,
    /// Expense trend and vendor concentration.
    Expense,
    /// Inflow/outflow timing mismatches.
    Timing,
    /// Customer/vendor concentration risk.
    Concentration,
    /// Bookkeeping hygiene (categorization, flapping).
    Hygiene,
    /// Fallback for a signal type with no registered domain.
    Unknown,
}

/// Case lifecycle status (`spec.md` §4.7 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Newly opened, not yet triaged.
    Open,
    /// Actively being watched.
    Monitoring,
    /// Escalated by a rule in `EvaluateEscalation`.
    Escalated,
    /// Closed as resolved.
    Resolved,
    /// Closed as not actionable.
    Dismissed,
    /// A previously closed case brought back for another look.
    Reopened,
}

impl CaseStatus {
    /// Cases whose signals may still be attached / aggregated (`spec.md`
    /// §4.7 step 1: "the open (`open|monitoring|escalated`) case").
    #[must_use]
    pub fn is_open_for_aggregation(self) -> bool {
        matches!(
            self,
            CaseStatus::Open | CaseStatus::Monitoring | CaseStatus::Escalated
        )
    }

    /// Valid forward transitions from this status (`spec.md` §4.7).
    #[must_use]
    pub fn allowed_transitions(self) -> &'static [CaseStatus] {
        use CaseStatus::{Dismissed, Escalated, Monitoring, Open, Reopened, Resolved};
        match self {
            CaseStatus::Open => &[Monitoring, Escalated, Resolved, Dismissed],
            CaseStatus::Monitoring => &[Open, Escalated, Resolved, Dismissed],
            CaseStatus::Escalated => &[Monitoring, Resolved, Dismissed],
            CaseStatus::Resolved | CaseStatus::Dismissed => &[Reopened],
            CaseStatus::Reopened => &[Monitoring, Escalated, Resolved, Dismissed],
        }
    }
}

/// Deterministic work item type materialized from case state (`spec.md`
/// §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemType {
    /// `computed_sla_breached` and status is not resolved.
    SlaBreach,
    /// `computed_plan_overdue`.
    PlanOverdue,
    /// Open signals exist in the last 30 days and no active plan.
    NoPlan,
    /// Severity is high/critical and the case is still open.
    HighSeverityTriage,
    /// `next_review_at` has passed.
    ReviewDue,
    /// No one is assigned and the case is not resolved.
    UnassignedCase,
}

/// Work item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Outstanding.
    Open,
    /// Deferred until `snoozed_until`.
    Snoozed,
    /// Done; never reopened automatically (`spec.md` §4.8).
    Completed,
}

/// Action item kind (`spec.md` §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Uncategorized transaction backlog needs mapping.
    FixMapping,
    /// An open signal with ledger anchors needs investigation.
    InvestigateAnomaly,
    /// A provider integration is unhealthy or stale.
    SyncIntegration,
    /// Vendor spend variance warrants review.
    ReviewVendor,
}

/// Action item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Outstanding.
    Open,
    /// Resolved by a user as completed.
    Done,
    /// Resolved by a user as not actionable.
    Ignored,
    /// Deferred until `snoozed_until`.
    Snoozed,
}

/// Plan lifecycle status (`spec.md` §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Created but not yet activated.
    Draft,
    /// Activated; evaluation windows are running.
    Active,
    /// Closed: the plan achieved its condition(s).
    Succeeded,
    /// Closed: the plan did not achieve its condition(s).
    Failed,
    /// Closed by the user without a verdict.
    Canceled,
}

/// Verdict computed by `PlanEngine::Refresh` for one condition, or the
/// aggregate across all of a plan's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanVerdict {
    /// No measurable movement yet.
    NoChange,
    /// Trending toward success but not there yet.
    Improving,
    /// Trending away from success.
    Worsening,
    /// The condition's threshold was met.
    Success,
    /// Closed without meeting the condition (terminal, set by `Close`).
    Failure,
}

/// Direction a `metric_delta` plan condition watches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    /// Success when the metric rises by at least `threshold`.
    Improve,
    /// Success when the metric falls by at least `threshold`.
    Worsen,
    /// Reserved for future use; currently treated the same as "no threshold
    /// configured" and always yields `NoChange`.
    Resolve,
}
