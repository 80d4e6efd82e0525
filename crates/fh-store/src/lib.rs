//! Postgres plumbing shared by every persistence crate.
//!
//! `spec.md` §4.1 requires that a duplicate `RawEvent` insert "never abort
//! the outer transaction" — generalized here into [`insert_idempotent`], a
//! `SAVEPOINT`/`ROLLBACK TO SAVEPOINT` helper any repository can wrap a
//! unique-constrained insert in. Durability and atomicity come from the
//! database itself, so the abstraction shrinks to "run this insert, treat a
//! unique violation as `false` instead of an error".

#![deny(missing_docs)]

use fh_types::FhError;
use sqlx::postgres::{PgPoolOptions, PgQueryResult};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;

/// A connected Postgres pool, shared by every crate that persists state.
#[derive(Clone)]
pub struct DbPool(PgPool);

impl DbPool {
    /// Connect using a `postgres://` URL, sizing the pool the way a
    /// small-business-scale API server needs (a handful of connections,
    /// not hundreds — `spec.md` §5 expects tens of businesses ticking
    /// concurrently, not thousands).
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, FhError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| FhError::Storage(format!("failed to connect to postgres: {e}")))?;
        Ok(Self(pool))
    }

    /// The underlying `sqlx` pool, for repositories that run their own
    /// queries.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.0
    }

    /// Start a transaction.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, FhError> {
        self.0
            .begin()
            .await
            .map_err(|e| FhError::Storage(e.to_string()))
    }

    /// Apply every migration under `migrations/` that hasn't run yet.
    /// Idempotent — safe to call on every process start.
    pub async fn run_migrations(&self) -> Result<(), FhError> {
        sqlx::migrate!("../../migrations")
            .run(&self.0)
            .await
            .map_err(|e| FhError::Storage(format!("migration failed: {e}")))
    }
}

/// Run `insert` inside a named savepoint; a unique-constraint violation
/// rolls back to the savepoint and returns `Ok(false)` instead of poisoning
/// the enclosing transaction. Any other database error is propagated.
///
/// `savepoint` must be a valid, already-unique-in-this-transaction SQL
/// identifier — callers typically derive it from the dedupe key.
pub async fn insert_idempotent<'c, F, Fut>(
    conn: &mut PgConnection,
    savepoint: &str,
    insert: F,
) -> Result<bool, FhError>
where
    F: FnOnce(&mut PgConnection) -> Fut,
    Fut: Future<Output = Result<PgQueryResult, sqlx::Error>>,
{
    sqlx::query(&format!("SAVEPOINT {savepoint}"))
        .execute(&mut *conn)
        .await
        .map_err(|e| FhError::Storage(e.to_string()))?;

    match insert(conn).await {
        Ok(_) => {
            sqlx::query(&format!("RELEASE SAVEPOINT {savepoint}"))
                .execute(&mut *conn)
                .await
                .map_err(|e| FhError::Storage(e.to_string()))?;
            Ok(true)
        }
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            sqlx::query(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
                .execute(&mut *conn)
                .await
                .map_err(|e| FhError::Storage(e.to_string()))?;
            Ok(false)
        }
        Err(e) => Err(FhError::Storage(e.to_string())),
    }
}
