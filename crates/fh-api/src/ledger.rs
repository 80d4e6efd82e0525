//! Ledger query/report routes (`spec.md` §4.3, §6): `GET
//! /ledger/business/{id}/lines|transactions|income_statement|cash_flow|
//! cash_series|balance_sheet_v1`.
//!
//! `PostedTxn` and its query results carry no `Serialize` impl — engine
//! crates stay transport-agnostic — so every handler here builds its own
//! response DTO.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{DateTime, Utc};
use fh_domain::AccountType;
use fh_types::{BusinessId, Direction, FhError, Money};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Deserialize, Default)]
pub struct WindowParams {
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    direction: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn load_posted_txns(state: &AppState, business_id: BusinessId) -> ApiResult<Vec<fh_projection::PostedTxn>> {
    let mut conn = state.db.pool().acquire().await.map_err(|e| FhError::Storage(e.to_string()))?;
    let raw = fh_raw_events::RawEventRepo::fetch_all(&mut conn, business_id, None).await?;
    let (txns, _errors) = fh_projection::project(&raw);
    Ok(txns)
}

fn parse_direction(raw: Option<&str>) -> ApiResult<Option<Direction>> {
    match raw {
        None => Ok(None),
        Some("inflow") => Ok(Some(Direction::Inflow)),
        Some("outflow") => Ok(Some(Direction::Outflow)),
        Some(other) => Err(FhError::Validation(format!("unknown direction {other}")).into()),
    }
}

#[derive(Serialize)]
pub struct LedgerLineDto {
    source_event_id: String,
    canonical_source_event_id: String,
    occurred_at: DateTime<Utc>,
    amount: f64,
    direction: Direction,
    signed_amount: f64,
    description: String,
    counterparty: Option<String>,
    merchant_key: Option<String>,
    category_hint: Option<String>,
}

impl From<&fh_projection::PostedTxn> for LedgerLineDto {
    fn from(t: &fh_projection::PostedTxn) -> Self {
        LedgerLineDto {
            source_event_id: t.source_event_id.clone(),
            canonical_source_event_id: t.canonical_source_event_id.clone(),
            occurred_at: t.occurred_at,
            amount: t.amount.to_f64(),
            direction: t.direction,
            signed_amount: t.signed_amount.to_f64(),
            description: t.description.clone(),
            counterparty: t.counterparty.clone(),
            merchant_key: t.merchant_key.clone(),
            category_hint: t.category_hint.clone(),
        }
    }
}

#[derive(Serialize)]
pub struct LedgerSummaryDto {
    start_balance: f64,
    end_balance: f64,
    total_in: f64,
    total_out: f64,
    row_count: usize,
}

#[derive(Serialize)]
pub struct LedgerQueryResponse {
    rows: Vec<LedgerLineDto>,
    summary: LedgerSummaryDto,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

async fn query_response(
    state: &AppState,
    business_id: Uuid,
    params: &WindowParams,
) -> ApiResult<LedgerQueryResponse> {
    let business_id = BusinessId(business_id);
    let txns = load_posted_txns(state, business_id).await?;
    let now = Utc::now();
    let window = fh_ledger::default_ledger_window(now);
    let start_date = params.start_date.unwrap_or(window.start_date);
    let end_date = params.end_date.unwrap_or(window.end_date);
    let filters = fh_ledger::LedgerFilters {
        direction: parse_direction(params.direction.as_deref())?,
        merchant_keys: None,
        source_event_ids: None,
    };
    let result = fh_ledger::ledger_query(&txns, start_date, end_date, &filters, params.limit, params.offset.unwrap_or(0));
    Ok(LedgerQueryResponse {
        rows: result.rows.iter().map(|t| LedgerLineDto::from(*t)).collect(),
        summary: LedgerSummaryDto {
            start_balance: result.summary.start_balance.to_f64(),
            end_balance: result.summary.end_balance.to_f64(),
            total_in: result.summary.total_in.to_f64(),
            total_out: result.summary.total_out.to_f64(),
            row_count: result.summary.row_count,
        },
        start_date: result.window.start_date,
        end_date: result.window.end_date,
    })
}

/// `GET /ledger/business/{id}/lines`: posted rows plus running-balance
/// summary over a window.
pub async fn lines(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<LedgerQueryResponse>> {
    Ok(Json(query_response(&state, business_id, &params).await?))
}

/// `GET /ledger/business/{id}/transactions`: same query, named the way a UI
/// transaction list expects.
pub async fn transactions(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<LedgerQueryResponse>> {
    Ok(Json(query_response(&state, business_id, &params).await?))
}

async fn account_type_of(state: &AppState, business_id: BusinessId) -> ApiResult<HashMap<String, AccountType>> {
    let rows = sqlx::query(
        "SELECT tc.source_event_id AS source_event_id, a.account_type AS account_type \
         FROM txn_categorization tc \
         JOIN category c ON c.id = tc.category_id \
         JOIN account a ON a.id = c.anchor_account_id \
         WHERE tc.business_id = $1",
    )
    .bind(business_id.0)
    .fetch_all(state.db.pool())
    .await
    .map_err(|e| FhError::Storage(e.to_string()))?;

    let mut map = HashMap::with_capacity(rows.len());
    for row in rows {
        let source_event_id: String = row.try_get("source_event_id").map_err(|e| FhError::Storage(e.to_string()))?;
        let account_type_str: String = row.try_get("account_type").map_err(|e| FhError::Storage(e.to_string()))?;
        let account_type = match account_type_str.as_str() {
            "revenue" => AccountType::Revenue,
            "expense" => AccountType::Expense,
            "cogs" => AccountType::Cogs,
            "asset" => AccountType::Asset,
            "liability" => AccountType::Liability,
            other => return Err(FhError::Storage(format!("unknown account_type {other}")).into()),
        };
        map.insert(source_event_id, account_type);
    }
    Ok(map)
}

#[derive(Serialize)]
pub struct IncomeStatementResponse {
    revenue_total: f64,
    expense_total: f64,
    net_income: f64,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

/// `GET /ledger/business/{id}/income_statement`.
pub async fn income_statement(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<IncomeStatementResponse>> {
    let business_id = BusinessId(business_id);
    let txns = load_posted_txns(&state, business_id).await?;
    let now = Utc::now();
    let window = fh_ledger::default_ledger_window(now);
    let start_date = params.start_date.unwrap_or(window.start_date);
    let end_date = params.end_date.unwrap_or(window.end_date);
    let account_types = account_type_of(&state, business_id).await?;
    let stmt = fh_ledger::income_statement(&txns, start_date, end_date, &account_types);
    Ok(Json(IncomeStatementResponse {
        revenue_total: stmt.revenue_total.to_f64(),
        expense_total: stmt.expense_total.to_f64(),
        net_income: stmt.net_income.to_f64(),
        start_date,
        end_date,
    }))
}

#[derive(Serialize)]
pub struct CashFlowResponse {
    cash_flow: f64,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

/// `GET /ledger/business/{id}/cash_flow`.
pub async fn cash_flow(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<CashFlowResponse>> {
    let business_id = BusinessId(business_id);
    let txns = load_posted_txns(&state, business_id).await?;
    let now = Utc::now();
    let window = fh_ledger::default_ledger_window(now);
    let start_date = params.start_date.unwrap_or(window.start_date);
    let end_date = params.end_date.unwrap_or(window.end_date);
    let flow = fh_ledger::cash_flow(&txns, start_date, end_date);
    Ok(Json(CashFlowResponse {
        cash_flow: flow.to_f64(),
        start_date,
        end_date,
    }))
}

#[derive(Serialize)]
pub struct CashSeriesPointDto {
    occurred_at: DateTime<Utc>,
    signed_amount: f64,
    running_balance: f64,
}

/// `GET /ledger/business/{id}/cash_series`. The running balance is seeded
/// at zero, matching `fh_ledger::cash_series`'s documented contract — a
/// caller wanting a true account balance passes a `start_date` that covers
/// every row and reads `running_balance` at the last point.
pub async fn cash_series(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<WindowParams>,
) -> ApiResult<Json<Vec<CashSeriesPointDto>>> {
    let business_id = BusinessId(business_id);
    let txns = load_posted_txns(&state, business_id).await?;
    let points = fh_ledger::cash_series(&txns, params.start_date, params.end_date, Money::zero());
    Ok(Json(
        points
            .into_iter()
            .map(|p| CashSeriesPointDto {
                occurred_at: p.occurred_at,
                signed_amount: p.signed_amount.to_f64(),
                running_balance: p.running_balance.to_f64(),
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct BalanceSheetResponse {
    assets: f64,
    liabilities: f64,
    equity: f64,
    as_of: DateTime<Utc>,
}

#[derive(Deserialize, Default)]
pub struct AsOfParams {
    as_of: Option<DateTime<Utc>>,
}

/// `GET /ledger/business/{id}/balance_sheet_v1`.
pub async fn balance_sheet_v1(
    State(state): State<AppState>,
    Path(business_id): Path<Uuid>,
    Query(params): Query<AsOfParams>,
) -> ApiResult<Json<BalanceSheetResponse>> {
    let business_id = BusinessId(business_id);
    let txns = load_posted_txns(&state, business_id).await?;
    let as_of = params.as_of.unwrap_or_else(Utc::now);
    let sheet = fh_ledger::balance_sheet_v1(&txns, as_of, Money::zero());
    Ok(Json(BalanceSheetResponse {
        assets: sheet.assets.to_f64(),
        liabilities: sheet.liabilities.to_f64(),
        equity: sheet.equity.to_f64(),
        as_of,
    }))
}
