//! Chart-of-accounts entities.

use fh_types::BusinessId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The accounting type of an `Account` — drives `LedgerService::IncomeStatement`
/// grouping in `fh-ledger`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    /// Money coming in.
    Revenue,
    /// Money going out, not cost of goods sold.
    Expense,
    /// Cost of goods sold — grouped with `Expense` for income statement
    /// purposes but tracked separately for margin reporting.
    Cogs,
    /// On-hand cash and cash equivalents.
    Asset,
    /// Amounts owed.
    Liability,
}

/// A row in a business's chart of accounts. Every `Category` anchors to
/// exactly one `Account`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Primary key.
    pub id: Uuid,
    /// Owning business.
    pub business_id: BusinessId,
    /// Display name, e.g. `"Payroll"`.
    pub name: String,
    /// Accounting type.
    pub account_type: AccountType,
}

impl Account {
    /// Construct a new account row (unpersisted).
    #[must_use]
    pub fn new(business_id: BusinessId, name: impl Into<String>, account_type: AccountType) -> Self {
        Self {
            id: Uuid::new_v4(),
            business_id,
            name: name.into(),
            account_type,
        }
    }
}
