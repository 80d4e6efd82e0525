//! Shared process state (`spec.md` §6) and the caller-identity extractor.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use fh_config::AppConfig;
use fh_providers::ProviderClient;
use fh_store::DbPool;

/// Everything a handler needs, cloned cheaply into every request
/// (`DbPool` wraps a `PgPool`, itself an `Arc` internally).
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: DbPool,
    /// Process configuration, loaded once at startup.
    pub config: Arc<AppConfig>,
    /// The financial-provider client this process talks to — a
    /// [`fh_providers::StubProviderClient`] unless a real one is wired in.
    pub provider: Arc<dyn ProviderClient>,
}

/// Who is making this request. The pilot has no session/JWT layer yet
/// (`spec.md` §6 Non-goals) — identity is whatever the caller's reverse
/// proxy or internal tooling puts in `X-User-Email`/`X-User-Id`. Handlers
/// that write an audit entry or assign a work item use this for the
/// `assigned_to`/actor field; nothing here is a trust boundary.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    /// `X-User-Email`, if present.
    pub email: Option<String>,
    /// `X-User-Id`, if present.
    pub user_id: Option<String>,
}

impl CallerIdentity {
    /// A stable label for audit/assignment fields: the email if present,
    /// else the id, else `"unknown"`.
    #[must_use]
    pub fn label(&self) -> String {
        self.email
            .clone()
            .or_else(|| self.user_id.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let email = parts
            .headers
            .get("X-User-Email")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let user_id = parts
            .headers
            .get("X-User-Id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if email.is_none() && user_id.is_none() {
            return Err((StatusCode::UNAUTHORIZED, "missing X-User-Email or X-User-Id"));
        }
        Ok(CallerIdentity { email, user_id })
    }
}
