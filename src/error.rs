use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::models::ConversionError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Policy rejections (blocked IP, exhausted quota) are not errors: the gates
/// answer them directly with their own response shapes. `AppError` covers the
/// admin API, upstream forwarding and fail-closed gate outcomes.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Gate backing store unavailable: {0}")]
    GateUnavailable(String),

    #[error("Upstream request failed: {0}")]
    UpstreamFailed(String),

    #[error("Upstream request timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Failure of a block-list or quota backing store.
///
/// Gates translate these into the configured fail-open / fail-closed outcome;
/// they never reach the client as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store did not answer within {0}ms")]
    Timeout(u64),
}

/// Error response body for API endpoints.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Full details stay in the logs, clients get sanitized messages
        tracing::error!(error = %self, "Request failed");

        let (status, error_type, message) = match &self {
            AppError::GateUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "Request could not be verified right now. Please try again later.",
            ),
            AppError::UpstreamFailed(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_failed",
                "The backend service is temporarily unavailable. Please try again later.",
            ),
            AppError::UpstreamTimeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                "The backend service did not respond in time. Please try again.",
            ),
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                "Service configuration error. Please contact support.",
            ),
            AppError::Conversion(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "conversion_error",
                "Stored data could not be read. Please contact support.",
            ),

            AppError::InvalidBody(rejection) => {
                let message = match rejection {
                    JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
                        sanitize_json_error(&rejection.body_text())
                    }
                    _ => rejection.body_text(),
                };
                return (
                    rejection.status(),
                    axum::Json(ErrorResponse {
                        error: "invalid_body".to_string(),
                        message,
                        details: None,
                    }),
                )
                    .into_response();
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: message.to_string(),
            details: None,
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Sanitize JSON error messages to avoid leaking internal type information.
fn sanitize_json_error(msg: &str) -> String {
    if msg.contains("missing field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Missing required field: {field}");
    }

    if msg.contains("unknown field")
        && let Some(start) = msg.find('`')
        && let Some(end) = msg[start + 1..].find('`')
    {
        let field = &msg[start + 1..start + 1 + end];
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::GateUnavailable(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_unavailable_maps_to_503() {
        let response = AppError::GateUnavailable("redis down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_upstream_errors_map_to_gateway_statuses() {
        let failed = AppError::UpstreamFailed("refused".to_string()).into_response();
        assert_eq!(failed.status(), StatusCode::BAD_GATEWAY);

        let timeout = AppError::UpstreamTimeout("30s".to_string()).into_response();
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_sanitize_truncated_json() {
        let err = serde_json::from_str::<serde_json::Value>("{")
            .err()
            .unwrap();
        assert_eq!(
            sanitize_json_error(&err.to_string()),
            "Malformed JSON in request body"
        );
    }

    #[test]
    fn test_sanitize_missing_field_names_only_the_field() {
        let msg = "Failed to deserialize the JSON body into the target type: \
                   missing field `target` at line 1 column 2";
        assert_eq!(sanitize_json_error(msg), "Missing required field: target");
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(
            StoreError::Timeout(250).to_string(),
            "store did not answer within 250ms"
        );
    }
}
