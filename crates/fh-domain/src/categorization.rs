//! `TxnCategorization`: the resolved category for one posted transaction.

use chrono::{DateTime, Utc};
use fh_types::BusinessId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a `TxnCategorization` row was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategorizationSource {
    /// A user assigned the category by hand.
    Manual,
    /// A `CategoryRule` matched.
    Rule,
    /// Resolved via `BusinessCategoryMap` from a vendor's canonical key.
    VendorMap,
    /// Synthetic data generated for demos/tests.
    Sim,
}

/// `(business_id, source_event_id) -> category_id`. Unique on the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnCategorization {
    /// Owning business.
    pub business_id: BusinessId,
    /// The raw event's `source_event_id` this categorization applies to.
    pub source_event_id: String,
    /// Resolved category.
    pub category_id: Uuid,
    /// How it was resolved.
    pub source: CategorizationSource,
    /// `0.0..=1.0`; `Manual` is always `1.0`.
    pub confidence: f64,
    /// Free-text annotation, e.g. the rule text that matched.
    pub note: Option<String>,
    /// When this categorization was recorded.
    pub created_at: DateTime<Utc>,
}
