//! Timestamp helpers. `spec.md` §9 mandates UTC-aware timestamps
//! throughout and forbids relying on server local time; everything in this
//! workspace uses `chrono::DateTime<Utc>`, never `NaiveDateTime`.

use chrono::{DateTime, NaiveDateTime, Utc};

/// The current instant. The single place in the workspace allowed to call
/// `Utc::now()` directly — every engine takes `now` as a parameter so tests
/// can control time deterministically.
#[must_use]
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Promote a naive (legacy, no-offset) timestamp read from storage to UTC,
/// per `spec.md` §9: "Any legacy naive timestamps read from storage are
/// promoted to UTC before comparison."
#[must_use]
pub fn promote_naive_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

/// Render the per-bucket tick identifier for daily buckets (`spec.md`
/// §4.12: `YYYY-MM-DD` UTC by default).
#[must_use]
pub fn daily_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// Render the per-bucket tick identifier for hourly buckets (`spec.md`
/// §4.12: `YYYY-MM-DDTHH`).
#[must_use]
pub fn hourly_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}
