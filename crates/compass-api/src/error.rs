//! API error types and JSON error response formatting.
//!
//! Errors raised before a stream opens are returned as a JSON body
//! `{error, message}` with a matching status code. Failures after the
//! stream opens travel in-band as `error` frames instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;

use compass_chat::ChatError;

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Machine-readable error code (e.g., "bad_request", "not_found").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type that maps to HTTP status codes and JSON responses.
#[derive(Debug)]
pub enum ApiError {
    /// 400 Bad Request - empty, oversized or malformed input.
    BadRequest(String),
    /// 401 Unauthorized - missing or unknown bearer credential.
    Unauthorized(String),
    /// 404 Not Found - resource does not exist or belongs to another user.
    NotFound(String),
    /// 429 Too Many Requests.
    TooManyRequests(String),
    /// 500 Internal Server Error. The message is shown to the user as-is.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "too_many_requests", msg)
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
            }
        };

        let body = ErrorBody {
            error: error_code.to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

const INTERNAL_MESSAGE: &str =
    "I'm sorry, something went wrong on my side. Please try again in a moment.";

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match &err {
            ChatError::EmptyMessage | ChatError::MessageTooLong(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ChatError::ConversationNotFound(_) => ApiError::NotFound(err.to_string()),
            _ => {
                error!(error = %err, "Chat request failed");
                ApiError::Internal(INTERNAL_MESSAGE.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_chat_errors_map_to_status() {
        let cases = [
            (ChatError::EmptyMessage, StatusCode::BAD_REQUEST),
            (ChatError::MessageTooLong(4000), StatusCode::BAD_REQUEST),
            (
                ChatError::ConversationNotFound(Uuid::new_v4()),
                StatusCode::NOT_FOUND,
            ),
            (ChatError::Storage("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), status);
        }
    }

    #[test]
    fn test_internal_errors_hide_cause() {
        match ApiError::from(ChatError::Storage("SQLITE_BUSY".into())) {
            ApiError::Internal(msg) => {
                assert!(!msg.contains("SQLITE"));
                assert!(msg.starts_with("I'm sorry"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
