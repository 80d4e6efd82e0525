//! Shared error taxonomy (`spec.md` §7).
//!
//! Every engine crate returns `Result<T, FhError>`. `fh-api` is the only
//! place that maps a variant to an HTTP status code; the engines themselves
//! never know about HTTP.

use thiserror::Error;

/// Error kinds shared across every engine in the workspace.
#[derive(Debug, Error)]
pub enum FhError {
    /// The referenced business/case/signal/action/plan/work item does not
    /// exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller lacks the role required for this operation.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A bad status transition, invalid enum value, missing required field,
    /// or invalid window.
    #[error("validation error: {0}")]
    Validation(String),

    /// A unique key collision that is not the idempotent-insert case (e.g. a
    /// race on an idempotency key that resolved to a different row).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A hard invariant violation — never silently recovered. The canonical
    /// instance is `CaseSignalInvariantError`: a signal already owned by a
    /// different case.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// An external financial-data provider refused or failed the request.
    #[error("provider error ({provider}): {message}")]
    Provider {
        /// Provider identifier, e.g. `"plaid"`.
        provider: String,
        /// Human-readable detail.
        message: String,
    },

    /// Per-event normalization failure. Callers of `fh-processing` should
    /// not surface this to the user — it is recorded on
    /// `ProcessingEventState` and the pipeline continues with sibling
    /// events.
    #[error("processing error ({code}): {detail}")]
    Processing {
        /// Stable machine-readable error code.
        code: String,
        /// Human-readable detail.
        detail: String,
    },

    /// Wraps a lower-level database error without leaking driver internals
    /// to callers that don't need to match on it.
    #[error("storage error: {0}")]
    Storage(String),
}

impl FhError {
    /// Shorthand for the `Invariant` variant carrying the spec's stable
    /// message for a signal already attached to a different case.
    #[must_use]
    pub fn case_signal_invariant(signal_id: &str, existing_case: &str, attempted_case: &str) -> Self {
        FhError::Invariant(format!(
            "signal {signal_id} is already attached to case {existing_case}, cannot attach to {attempted_case}"
        ))
    }
}
