//! HTTP control API: JSON over HTTP under `/v1`, SSE for session streams.

pub mod agents;
pub mod artifacts;
pub mod board;
pub mod bulletins;
pub mod channels;
pub mod config;
pub mod projects;
pub mod providers;
pub mod server;
pub mod sessions;
pub mod state;
pub mod workers;

pub use server::start_http_server;
pub use state::ApiState;

use axum::http::StatusCode;
use axum::Json;

/// Wire form of an error: short machine-grepable kind plus a message that
/// never contains secrets.
#[derive(Debug, serde::Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorBody>);
pub(crate) type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Map a runtime error onto the documented status table.
pub(crate) fn error_response(error: crate::error::Error) -> ApiError {
    let kind = error.kind();
    let status =
        StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!(%error, kind = kind.as_str(), "request failed");
    }
    (
        status,
        Json(ErrorBody {
            error: kind.as_str().to_string(),
            message: error.to_string(),
        }),
    )
}

pub(crate) fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: "malformed_request".to_string(),
            message: message.into(),
        }),
    )
}

pub(crate) fn not_found(message: impl Into<String>) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            error: "not_found".to_string(),
            message: message.into(),
        }),
    )
}
