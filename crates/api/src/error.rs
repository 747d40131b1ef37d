//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use relaypass_core::CoreError;

/// Wrapper that turns core errors into JSON error responses.
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::Verification(_) => StatusCode::BAD_REQUEST,
            CoreError::Config(_) => StatusCode::BAD_REQUEST,
            CoreError::InvariantViolation(_) => StatusCode::CONFLICT,
            CoreError::AllProvidersFailed(_) => StatusCode::BAD_GATEWAY,
            CoreError::Provider(_) => StatusCode::BAD_GATEWAY,
            CoreError::Database(_) | CoreError::Encryption(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }

        // Internal detail stays in the logs, not in the response body.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal error".to_string()
        } else {
            self.0.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
