//! HTTP error mapping
//!
//! Handlers return typed errors up the middleware chain; this adapter
//! renders them as `{code, message, details?}` with the status from the
//! error taxonomy. Cause chains stay in the logs.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use depot_common::Error;
use tracing::{error, warn};

/// Newtype so the taxonomy error can implement `IntoResponse`
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(code = err.kind().code(), error = %err, "request failed");
        } else {
            warn!(code = err.kind().code(), error = %err, "request rejected");
        }

        (status, Json(err.to_body())).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
