use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::delivery::DeliveryError;

pub const MAX_QUEUE_ID_CHARS: usize = 128;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("queue ID must be 128 characters or less")]
    QueueIdTooLong,
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

/// Error body, e.g. `{"code":400,"error":"queue ID must be 128 characters or less"}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::QueueIdTooLong => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Delivery(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_owned(),
            ),
        };

        warn!(status = status.as_u16(), error = %self, "request failed");

        let body = ErrorResponse {
            code: status.as_u16(),
            error: message,
        };
        (status, Json(body)).into_response()
    }
}

/// Reject consumer keys over [`MAX_QUEUE_ID_CHARS`]. Runs before any storage access.
pub fn validate_queue_id(queue_id: &str) -> Result<(), ApiError> {
    if queue_id.chars().count() > MAX_QUEUE_ID_CHARS {
        return Err(ApiError::QueueIdTooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_id_length_is_bounded() {
        assert!(validate_queue_id("").is_ok());
        assert!(validate_queue_id(&"q".repeat(128)).is_ok());
        assert!(matches!(
            validate_queue_id(&"q".repeat(129)),
            Err(ApiError::QueueIdTooLong)
        ));
        // Characters, not bytes.
        assert!(validate_queue_id(&"é".repeat(128)).is_ok());
    }

    #[test]
    fn errors_render_status_and_message() {
        let response = ApiError::QueueIdTooLong.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ApiError::Delivery(DeliveryError::Log(
            killfeed_common::log::LogError::Timeout,
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
