//! HTTP surface: route handlers, request/response DTOs and error mapping
//! (`spec.md` §6 EXTERNAL INTERFACES). `apps/server` owns the process
//! (config load, migrations, listener); this crate only builds the
//! [`Router`].

pub mod actions;
pub mod cases;
pub mod diagnostics;
pub mod error;
pub mod health;
pub mod ingest;
pub mod ledger;
pub mod monitor;
pub mod plans;
pub mod signals;
pub mod state;
pub mod system;
pub mod work;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Builds the full application router: every path in `spec.md` §6, wired to
/// its handler, `CorsLayer` sourced from [`fh_config::AppConfig`] and a
/// `TraceLayer` wrapping the whole service.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_allow_origins);

    Router::new()
        // Ingest / integration
        .route("/integrations/:provider/link_token/:business_id", post(ingest::create_link_token))
        .route("/integrations/:provider/exchange/:business_id", post(ingest::exchange_public_token))
        .route("/integrations/:provider/sync/:business_id", post(ingest::sync))
        // matchit requires the same dynamic-segment name as the three
        // routes above at this depth; the bound value is still whichever
        // URL segment the caller put there, read positionally in `replay`.
        .route("/integrations/:provider/:business_id/replay", post(ingest::replay))
        .route("/api/webhooks/:provider", post(ingest::webhook))
        .route("/api/processing/:business_id/run", post(ingest::run_processing))
        // Ledger
        .route("/ledger/business/:id/lines", get(ledger::lines))
        .route("/ledger/business/:id/transactions", get(ledger::transactions))
        .route("/ledger/business/:id/income_statement", get(ledger::income_statement))
        .route("/ledger/business/:id/cash_flow", get(ledger::cash_flow))
        .route("/ledger/business/:id/cash_series", get(ledger::cash_series))
        .route("/ledger/business/:id/balance_sheet_v1", get(ledger::balance_sheet_v1))
        // Signals
        .route("/api/signals/:business_id", get(signals::list))
        .route("/api/signals/:business_id/:signal_id/explain", get(signals::explain))
        .route("/api/signals/:business_id/:signal_id/status", post(signals::update_status))
        // Cases
        .route("/api/cases/:business_id", get(cases::list))
        .route("/api/cases/:business_id/:case_id", get(cases::detail))
        .route("/api/cases/:business_id/:case_id/timeline", get(cases::timeline))
        .route("/api/cases/:business_id/:case_id/status", post(cases::update_status))
        .route("/api/cases/:business_id/:case_id/note", post(cases::add_note))
        .route("/api/cases/:business_id/:case_id/attach-ledger-anchor", post(cases::attach_ledger_anchor))
        .route("/api/cases/:business_id/:case_id/detach-ledger-anchor", post(cases::detach_ledger_anchor))
        // Work items (materialized from cases, surfaced alongside actions/plans)
        .route("/api/work/:business_id", get(work::list))
        .route("/api/work/:business_id/materialize", post(work::materialize))
        .route("/api/work/:business_id/:id/complete", post(work::complete))
        .route("/api/work/:business_id/:id/snooze", post(work::snooze))
        // Actions
        .route("/api/actions/:business_id", get(actions::list))
        .route("/api/actions/:business_id/refresh", post(actions::refresh))
        .route("/api/actions/:business_id/:id/resolve", post(actions::resolve))
        .route("/api/actions/:business_id/:id/snooze", post(actions::snooze))
        .route("/api/actions/:business_id/:id/assign", post(actions::assign))
        // Plans
        .route("/api/plans", post(plans::create))
        .route("/api/plans/case/:case_id", get(plans::list_for_case))
        .route("/api/plans/:business_id/:id/activate", post(plans::activate))
        .route("/api/plans/:business_id/:id/assign", post(plans::assign))
        .route("/api/plans/:business_id/:id/note", post(plans::add_note))
        .route("/api/plans/:business_id/:id/refresh", post(plans::refresh))
        .route("/api/plans/:business_id/:id/close", post(plans::close))
        .route("/api/plans/:business_id/from_action", post(plans::from_action))
        // Health / observability
        .route("/api/health_score/:business_id", get(health::score))
        .route("/api/health_score/:business_id/explain_change", get(health::explain_change))
        .route("/monitor/status/:id", get(monitor::status))
        .route("/monitor/pulse/:id", post(monitor::pulse))
        .route("/api/diagnostics/status/:id", get(diagnostics::status))
        .route("/api/diagnostics/ingestion/:id", get(diagnostics::ingestion))
        .route("/api/system/tick/:business_id", post(system::run_tick))
        .route("/api/system/last-tick/:business_id", get(system::last_tick))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// An empty `CORS_ALLOW_ORIGINS` allows no cross-origin requests at all
/// (`AllowOrigin::exact` over an empty list), matching `fh-config`'s
/// documented default of a locked-down pilot deployment; a non-empty list
/// is echoed back exactly, never wildcarded.
fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = allowed.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
