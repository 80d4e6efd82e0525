//! Queries, running balances, P&L, cashflow and cash-series over the posted
//! projection (`spec.md` §4.3, component C).
//!
//! `signed_amount`, a default ledger window, `ledger_query`,
//! `income_statement`, `cash_flow`, `cash_series` and `balance_sheet_v1`
//! per `spec.md` §4.3.

#![deny(missing_docs)]

use chrono::{DateTime, Utc};
use fh_domain::AccountType;
use fh_projection::PostedTxn;
use fh_types::{Direction, Money};
use std::collections::HashMap;

/// Default lookback when a caller doesn't specify a window: 90 days.
pub const DEFAULT_WINDOW_DAYS: i64 = 90;

/// Optional row filters for [`ledger_query`].
#[derive(Debug, Clone, Default)]
pub struct LedgerFilters {
    /// Restrict to one direction.
    pub direction: Option<Direction>,
    /// Restrict to these normalized merchant keys.
    pub merchant_keys: Option<Vec<String>>,
    /// Restrict to exactly these source event ids.
    pub source_event_ids: Option<Vec<String>>,
}

impl LedgerFilters {
    fn matches(&self, txn: &PostedTxn) -> bool {
        if let Some(direction) = self.direction {
            if txn.direction != direction {
                return false;
            }
        }
        if let Some(keys) = &self.merchant_keys {
            match &txn.merchant_key {
                Some(key) if keys.iter().any(|k| k == key) => {}
                _ => return false,
            }
        }
        if let Some(ids) = &self.source_event_ids {
            if !ids.iter().any(|id| id == &txn.source_event_id) {
                return false;
            }
        }
        true
    }
}

/// Aggregate figures returned alongside [`ledger_query`]'s rows.
#[derive(Debug, Clone, Copy)]
pub struct LedgerSummary {
    /// Running balance immediately before `start_date`.
    pub start_balance: Money,
    /// `start_balance + Σ rows.signed_amount`.
    pub end_balance: Money,
    /// Sum of inflow amounts within the window.
    pub total_in: Money,
    /// Sum of outflow amounts within the window.
    pub total_out: Money,
    /// Number of rows returned (post-filter, pre-pagination).
    pub row_count: usize,
}

/// The resolved `[start_date, end_date]` window.
#[derive(Debug, Clone, Copy)]
pub struct LedgerWindow {
    /// Inclusive start.
    pub start_date: DateTime<Utc>,
    /// Inclusive end.
    pub end_date: DateTime<Utc>,
}

/// Full result of a ledger query.
#[derive(Debug, Clone)]
pub struct LedgerQueryResult<'a> {
    /// Matching rows after filtering, date window and pagination.
    pub rows: Vec<&'a PostedTxn>,
    /// Aggregate figures.
    pub summary: LedgerSummary,
    /// The window actually applied.
    pub window: LedgerWindow,
}

/// `spec.md` §4.3's `LedgerQuery`. `txns` must already be scoped to one
/// business and sorted by `(occurred_at, source_event_id)` (the contract
/// `fh_projection::project` guarantees).
#[must_use]
pub fn ledger_query<'a>(
    txns: &'a [PostedTxn],
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    filters: &LedgerFilters,
    limit: Option<usize>,
    offset: usize,
) -> LedgerQueryResult<'a> {
    let start_balance: Money = txns
        .iter()
        .filter(|t| t.occurred_at < start_date)
        .map(|t| t.signed_amount)
        .sum();

    let windowed: Vec<&PostedTxn> = txns
        .iter()
        .filter(|t| t.occurred_at >= start_date && t.occurred_at <= end_date)
        .filter(|t| filters.matches(t))
        .collect();

    let total_in: Money = windowed
        .iter()
        .filter(|t| t.direction == Direction::Inflow)
        .map(|t| t.amount)
        .sum();
    let total_out: Money = windowed
        .iter()
        .filter(|t| t.direction == Direction::Outflow)
        .map(|t| t.amount)
        .sum();
    let window_delta: Money = windowed.iter().map(|t| t.signed_amount).sum();
    let end_balance = start_balance + window_delta;
    let row_count = windowed.len();

    let rows = windowed
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();

    LedgerQueryResult {
        rows,
        summary: LedgerSummary {
            start_balance,
            end_balance,
            total_in,
            total_out,
            row_count,
        },
        window: LedgerWindow { start_date, end_date },
    }
}

/// `spec.md` §4.3's default window: the 90 days ending at `now`.
#[must_use]
pub fn default_ledger_window(now: DateTime<Utc>) -> LedgerWindow {
    LedgerWindow {
        start_date: now - chrono::Duration::days(DEFAULT_WINDOW_DAYS),
        end_date: now,
    }
}

/// Result of [`income_statement`].
#[derive(Debug, Clone, Copy)]
pub struct IncomeStatement {
    /// Sum of signed amounts for revenue-typed accounts.
    pub revenue_total: Money,
    /// Sum of `-signed` for expense/cogs-typed accounts.
    pub expense_total: Money,
    /// `revenue_total - expense_total`.
    pub net_income: Money,
}

/// `spec.md` §4.3's `IncomeStatement`. `account_type_of` resolves a
/// transaction's categorized account type (via `TxnCategorization` ->
/// `Category` -> `Account`, joined by the caller); rows with no resolved
/// account type are excluded from both totals.
#[must_use]
pub fn income_statement(
    txns: &[PostedTxn],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    account_type_of: &HashMap<String, AccountType>,
) -> IncomeStatement {
    let windowed = txns.iter().filter(|t| t.occurred_at >= start && t.occurred_at <= end);

    let mut revenue_total = Money::zero();
    let mut expense_total = Money::zero();
    for txn in windowed {
        match account_type_of.get(&txn.source_event_id) {
            Some(AccountType::Revenue) => revenue_total = revenue_total + txn.signed_amount,
            Some(AccountType::Expense) | Some(AccountType::Cogs) => {
                expense_total = expense_total + (-txn.signed_amount)
            }
            _ => {}
        }
    }

    IncomeStatement {
        revenue_total,
        expense_total,
        net_income: revenue_total - expense_total,
    }
}

/// `spec.md` §4.3's `CashFlow`: `Σ|inflow| - Σ|outflow|` over the window.
#[must_use]
pub fn cash_flow(txns: &[PostedTxn], start: DateTime<Utc>, end: DateTime<Utc>) -> Money {
    txns.iter()
        .filter(|t| t.occurred_at >= start && t.occurred_at <= end)
        .map(|t| match t.direction {
            Direction::Inflow => t.amount,
            Direction::Outflow => -t.amount,
        })
        .sum()
}

/// One point of [`cash_series`].
#[derive(Debug, Clone, Copy)]
pub struct CashSeriesPoint {
    /// When this row posted.
    pub occurred_at: DateTime<Utc>,
    /// This row's signed amount.
    pub signed_amount: Money,
    /// Running balance including this row.
    pub running_balance: Money,
}

/// `spec.md` §4.3's `CashSeries`: a running-balance point per posted row in
/// `[start, end]` (both ends optional — `None` means unbounded), seeded by
/// `starting_cash`.
#[must_use]
pub fn cash_series(
    txns: &[PostedTxn],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    starting_cash: Money,
) -> Vec<CashSeriesPoint> {
    let mut running = starting_cash;
    txns.iter()
        .filter(|t| start.map_or(true, |s| t.occurred_at >= s))
        .filter(|t| end.map_or(true, |e| t.occurred_at <= e))
        .map(|t| {
            running = running + t.signed_amount;
            CashSeriesPoint {
                occurred_at: t.occurred_at,
                signed_amount: t.signed_amount,
                running_balance: running,
            }
        })
        .collect()
}

/// A deliberately minimal, cash-only balance sheet (`spec.md` §4.3's
/// `BalanceSheetV1`): no accrual accounting, liabilities always zero.
#[derive(Debug, Clone, Copy)]
pub struct BalanceSheetV1 {
    /// `starting_cash + Σ signed_amount` for every row `<= as_of`.
    pub assets: Money,
    /// Always zero in this v1 model.
    pub liabilities: Money,
    /// Equal to `assets` since `liabilities` is always zero.
    pub equity: Money,
}

/// `spec.md` §4.3's `BalanceSheetV1`.
#[must_use]
pub fn balance_sheet_v1(txns: &[PostedTxn], as_of: DateTime<Utc>, starting_cash: Money) -> BalanceSheetV1 {
    let cumulative: Money = txns
        .iter()
        .filter(|t| t.occurred_at <= as_of)
        .map(|t| t.signed_amount)
        .sum();
    let assets = starting_cash + cumulative;
    BalanceSheetV1 {
        assets,
        liabilities: Money::zero(),
        equity: assets,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fh_types::BusinessId;

    fn txn(day: u32, amount: f64, direction: Direction) -> PostedTxn {
        let at = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        let amount = Money::from_f64(amount);
        PostedTxn {
            business_id: BusinessId::new(),
            source_event_id: format!("tx{day}"),
            canonical_source_event_id: format!("tx{day}"),
            source: "plaid".into(),
            occurred_at: at,
            amount,
            direction,
            signed_amount: match direction {
                Direction::Inflow => amount,
                Direction::Outflow => -amount,
            },
            description: String::new(),
            counterparty: None,
            merchant_key: None,
            category_hint: None,
        }
    }

    #[test]
    fn start_plus_window_equals_end() {
        let txns = vec![
            txn(1, 100.0, Direction::Inflow),
            txn(5, 40.0, Direction::Outflow),
            txn(10, 20.0, Direction::Inflow),
        ];
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 9, 0, 0, 0).unwrap();
        let result = ledger_query(&txns, start, end, &LedgerFilters::default(), None, 0);
        assert_eq!(
            result.summary.start_balance + result.rows.iter().map(|t| t.signed_amount).sum::<Money>(),
            result.summary.end_balance
        );
        assert_eq!(result.summary.start_balance, Money::from_f64(100.0));
        assert_eq!(result.summary.end_balance, Money::from_f64(60.0));
    }

    #[test]
    fn cash_series_running_balance_is_cumulative() {
        let txns = vec![txn(1, 10.0, Direction::Inflow), txn(2, 4.0, Direction::Outflow)];
        let points = cash_series(&txns, None, None, Money::zero());
        assert_eq!(points[0].running_balance, Money::from_f64(10.0));
        assert_eq!(points[1].running_balance, Money::from_f64(6.0));
    }
}
