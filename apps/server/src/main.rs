//! Process entry point: loads configuration, connects to Postgres, runs
//! migrations, and serves `fh_api`'s router alongside a background ticker
//! (`spec.md` §"Scheduling model": "multi-worker request/response and
//! periodic tasks").
//!
//! `Cli`/`init_logging`/`create_app`/`shutdown_signal`, with a periodic
//! per-business tick+pulse sweep running alongside the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fh_config::AppConfig;
use fh_providers::{ProviderClient, StubProviderClient};
use fh_store::DbPool;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use fh_api::state::AppState;

#[derive(Parser)]
#[command(name = "fh-server")]
#[command(about = "Financial-health monitoring platform: HTTP API and tick scheduler")]
#[command(version)]
struct Cli {
    /// HTTP server port.
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Max Postgres pool connections.
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value = "10")]
    db_max_connections: u32,

    /// Seconds between background tick/pulse sweeps. Zero disables the
    /// background scheduler entirely — every tick still runs on demand via
    /// `POST /api/system/tick/{business_id}`.
    #[arg(long, env = "TICK_INTERVAL_SECONDS", default_value = "300")]
    tick_interval_seconds: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    info!("starting fh-server v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(AppConfig::from_env().context("failed to load configuration")?);

    let db = DbPool::connect(&config.database_url, cli.db_max_connections)
        .await
        .context("failed to connect to postgres")?;
    db.run_migrations().await.context("failed to run migrations")?;
    info!("database connected and migrations applied");

    let provider: Arc<dyn ProviderClient> = Arc::new(StubProviderClient);
    if !config.plaid.use_stub {
        warn!("PLAID_USE_STUB is false but this build only ships the stub provider client; falling back to it");
    }

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        provider,
    };

    let app = fh_api::build_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", cli.port))
        .await
        .with_context(|| format!("failed to bind to port {}", cli.port))?;
    info!("HTTP server listening on port {}", cli.port);

    let server = axum::serve(listener, app);

    let scheduler = run_scheduler(db, cli.tick_interval_seconds);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("HTTP server error: {e}");
            }
        }
        _ = scheduler => {
            error!("background scheduler exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("fh-server stopped");
    Ok(())
}

fn init_logging(log_level: &str) {
    let filter = format!("fh_server={log_level},fh_api={log_level},fh_tick={log_level}");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Sweeps every business once per interval, running a recompute+materialize
/// tick and a pulse reconcile for each. A business whose tick or pulse fails
/// is logged and skipped — one business's bad state never blocks another's
/// (`spec.md` §5: single-writer per `business_id`, not across businesses).
async fn run_scheduler(db: DbPool, interval_seconds: u64) {
    if interval_seconds == 0 {
        info!("TICK_INTERVAL_SECONDS=0, background scheduler disabled");
        std::future::pending::<()>().await;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
    loop {
        ticker.tick().await;
        let business_ids = match fetch_business_ids(&db).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("scheduler failed to list businesses: {e}");
                continue;
            }
        };
        for business_id in business_ids {
            if let Err(e) = sweep_business(&db, business_id).await {
                error!(%business_id, "scheduled tick/pulse failed: {e}");
            }
        }
    }
}

async fn fetch_business_ids(db: &DbPool) -> Result<Vec<uuid::Uuid>, fh_types::FhError> {
    use sqlx::Row;
    let rows = sqlx::query("SELECT id FROM business")
        .fetch_all(db.pool())
        .await
        .map_err(|e| fh_types::FhError::Storage(e.to_string()))?;
    rows.into_iter()
        .map(|row| row.try_get::<uuid::Uuid, _>("id").map_err(|e| fh_types::FhError::Storage(e.to_string())))
        .collect()
}

async fn sweep_business(db: &DbPool, business_id: uuid::Uuid) -> Result<(), fh_types::FhError> {
    let business_id = fh_types::BusinessId(business_id);
    let now = chrono::Utc::now();

    let mut tx = db.begin().await?;
    fh_tick::pulse(&mut tx, business_id, now, false).await?;
    fh_tick::run_tick(&mut tx, business_id, None, true, true, None, now).await?;
    tx.commit().await.map_err(|e| fh_types::FhError::Storage(e.to_string()))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
