//! Maps [`FhError`] onto HTTP responses (`spec.md` §7). This is the only
//! place in the workspace that knows `FhError` has anything to do with
//! HTTP — every engine crate stays transport-agnostic.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use fh_types::FhError;
use serde::Serialize;

/// Wraps [`FhError`] so it can be returned directly from an axum handler.
#[derive(Debug)]
pub struct ApiError(pub FhError);

impl From<FhError> for ApiError {
    fn from(err: FhError) -> Self {
        ApiError(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            FhError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            FhError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            FhError::Validation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg.clone()),
            FhError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            FhError::Invariant(msg) => (StatusCode::CONFLICT, msg.clone()),
            FhError::Provider { provider, message } => {
                (StatusCode::BAD_GATEWAY, format!("{provider}: {message}"))
            }
            FhError::Processing { code, detail } => {
                tracing::error!(code, detail, "processing error surfaced to an API caller, this should have been absorbed by the pipeline");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            FhError::Storage(msg) => {
                tracing::error!(error = %msg, "storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

/// Shorthand used throughout the route modules.
pub type ApiResult<T> = Result<T, ApiError>;
