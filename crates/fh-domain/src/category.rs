//! Category mapping: a business-scoped system key (`"rent"`, `"payroll"`)
//! maps to exactly one `Category`, which anchors to exactly one `Account`.

use fh_types::BusinessId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A category a transaction can be filed under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Primary key.
    pub id: Uuid,
    /// Owning business.
    pub business_id: BusinessId,
    /// Display name.
    pub name: String,
    /// The single account this category anchors to.
    pub anchor_account_id: Uuid,
}

/// A rule matching transaction text (vendor, description) to a `Category`,
/// used by `fh-processing`'s categorization stage before falling back to
/// the vendor map or manual assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Primary key.
    pub id: Uuid,
    /// Owning business.
    pub business_id: BusinessId,
    /// Lowercase substring matched against the normalized vendor/description.
    pub match_text: String,
    /// Category this rule assigns.
    pub category_id: Uuid,
    /// Higher priority rules are tried first.
    pub priority: i32,
}

/// Maps a business-scoped system key (stable across businesses, e.g.
/// `"rent"`) to that business's concrete `Category`. At most one row per
/// `(business_id, system_key)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessCategoryMap {
    /// Owning business.
    pub business_id: BusinessId,
    /// Canonical system key, e.g. `"rent"`, `"payroll"`.
    pub system_key: String,
    /// The category it resolves to for this business.
    pub category_id: Uuid,
}
