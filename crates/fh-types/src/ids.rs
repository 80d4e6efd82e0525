//! Newtype identifiers. Every entity in `spec.md` §3 is scoped by a
//! `BusinessId`; the newtypes below keep call sites from accidentally
//! passing a case id where a signal id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(BusinessId, "Tenant identifier. Every row in the system is scoped by one.");
uuid_id!(CaseId, "Identifies a `Case` row.");
uuid_id!(WorkItemId, "Identifies a `WorkItem` row.");
uuid_id!(ActionId, "Identifies an `ActionItem` row.");
uuid_id!(PlanId, "Identifies a `Plan` row.");

/// A signal's identity is not a UUID: `spec.md` §3 mandates
/// `signal_id = "{signal_type}:{fingerprint}"`, stable across runs so a
/// detector that fires again on the same dimension reconciles onto the same
/// row instead of creating a duplicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalId(pub String);

impl SignalId {
    /// Build the canonical id from its two parts.
    #[must_use]
    pub fn new(signal_type: &str, fingerprint: &str) -> Self {
        Self(format!("{signal_type}:{fingerprint}"))
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
