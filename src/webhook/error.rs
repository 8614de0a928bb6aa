//! Webhook Error Types
//!
//! Every failure on the request path ends up here and is rendered as a JSON
//! body carrying `success: false` and a human-readable `error`. Internal
//! detail is limited to the broker's message; backtraces stay in the logs.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Error types for webhook ingestion
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WebhookError {
    /// Missing or wrong `token`
    #[error("Unauthorized: invalid or missing token")]
    Authentication,

    /// Missing or malformed input
    #[error("{0}")]
    Validation(String),

    /// Body over the accepted size
    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// No usable broker channel
    #[error("RabbitMQ connection not available")]
    BrokerUnavailable { attempt: u32, max: u32 },

    /// Exchange could not be asserted
    #[error("Failed to assert exchange")]
    ExchangeAssertion(String),

    /// Envelope could not be encoded
    #[error("Failed to serialize webhook envelope")]
    Serialization(String),

    /// Publish failed
    #[error("Failed to publish message")]
    Publish(String),
}

impl WebhookError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Authentication => StatusCode::UNAUTHORIZED,
            WebhookError::Validation(_) => StatusCode::BAD_REQUEST,
            WebhookError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            WebhookError::BrokerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::ExchangeAssertion(_)
            | WebhookError::Serialization(_)
            | WebhookError::Publish(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Metrics label for this outcome
    pub fn outcome(&self) -> &'static str {
        match self {
            WebhookError::Authentication => "unauthorized",
            WebhookError::Validation(_) | WebhookError::PayloadTooLarge { .. } => "invalid",
            WebhookError::BrokerUnavailable { .. } => "unavailable",
            WebhookError::ExchangeAssertion(_) => "exchange_error",
            WebhookError::Serialization(_) | WebhookError::Publish(_) => "publish_error",
        }
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error = self.to_string();

        let body = match &self {
            WebhookError::BrokerUnavailable { attempt, max } => json!({
                "success": false,
                "error": error,
                "reconnectAttempt": attempt,
                "maxAttempts": max,
            }),
            WebhookError::ExchangeAssertion(details)
            | WebhookError::Serialization(details)
            | WebhookError::Publish(details) => json!({
                "success": false,
                "error": error,
                "details": details,
            }),
            _ => json!({
                "success": false,
                "error": error,
            }),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(WebhookError::Authentication.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            WebhookError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::BrokerUnavailable { attempt: 1, max: 10 }.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            WebhookError::Publish("closed".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_into_response_status() {
        let response = WebhookError::Authentication.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = WebhookError::PayloadTooLarge { limit: 10 }.into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
