//! Webhook Ingestion Pipeline
//!
//! Turns one HTTP request into one persistent message on a fanout exchange.
//!
//! Steps, in order:
//!
//! 1. authenticate the `token` query parameter (before anything else, so
//!    unauthenticated callers learn nothing about broker connectivity)
//! 2. require a non-empty `exchange` query parameter and a decodable body
//! 3. require a usable broker channel, kicking off a reconnect if there is none
//! 4. assert the exchange
//! 5. build and encode the [`WebhookEnvelope`]
//! 6. publish with routing key `""`
//!
//! A broker failure in 4 to 6 that reports a closed channel or connection is
//! fed back to the manager so recovery starts without waiting for the
//! transport's own error callback.

use crate::broker::error::LinkError;
use crate::broker::manager::ConnectionManager;
use crate::broker::transport::PublishProperties;
use crate::metrics;
use crate::webhook::envelope::{self, WebhookEnvelope};
use crate::webhook::error::WebhookError;
use crate::webhook::request::{self, WebhookRequest};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Fanout exchanges ignore the routing key
const ROUTING_KEY: &str = "";

/// AMQP app id stamped on every message
const APP_ID: &str = "hookbridge";

/// Successful ingestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub exchange: String,
    pub timestamp: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

impl IntoResponse for Accepted {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": true,
            "message": "Webhook received and published to RabbitMQ",
            "exchange": self.exchange,
            "timestamp": self.timestamp,
            "messageId": self.message_id,
        });
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Request-path entry point
#[derive(Clone)]
pub struct WebhookPipeline {
    manager: ConnectionManager,
    token: Option<String>,
}

impl WebhookPipeline {
    /// `token` of `None` rejects every request
    pub fn new(manager: ConnectionManager, token: Option<String>) -> Self {
        Self { manager, token }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Run the pipeline and record the outcome
    pub async fn handle(&self, request: WebhookRequest) -> Result<Accepted, WebhookError> {
        let result = self.process(request).await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(err) => err.outcome(),
        };
        metrics::WEBHOOK_REQUESTS_TOTAL
            .with_label_values(&[outcome])
            .inc();
        result
    }

    async fn process(&self, request: WebhookRequest) -> Result<Accepted, WebhookError> {
        // 1. Authentication
        if !self.authenticate(request.query_param("token")) {
            warn!(
                client = ?request.client_address,
                path = %request.path,
                "Webhook rejected: invalid or missing token"
            );
            return Err(WebhookError::Authentication);
        }

        // 2. Validation
        let exchange = match request.query_param("exchange") {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => {
                return Err(WebhookError::Validation(
                    "Missing required query parameter: exchange".to_string(),
                ))
            }
        };
        if request.body.len() > request::MAX_BODY_BYTES {
            return Err(WebhookError::PayloadTooLarge {
                limit: request::MAX_BODY_BYTES,
            });
        }
        let body = request::decode_body(&request.headers, &request.body)
            .map_err(|e| WebhookError::Validation(e.to_string()))?;

        // 3. Availability
        if !self.manager.is_connected() {
            let outcome = self.manager.schedule_reconnect();
            let status = self.manager.status();
            warn!(
                exchange = %exchange,
                ?outcome,
                attempt = status.reconnect_attempts,
                "Webhook rejected: broker unavailable"
            );
            return Err(WebhookError::BrokerUnavailable {
                attempt: status.reconnect_attempts,
                max: status.max_attempts,
            });
        }

        // 4. Exchange
        if let Err(err) = self.manager.ensure_exchange(&exchange).await {
            self.note_broker_failure(&err);
            return Err(WebhookError::ExchangeAssertion(err.to_string()));
        }

        // 5. Envelope
        let received_at = Utc::now();
        let envelope = WebhookEnvelope {
            timestamp: envelope::format_timestamp(received_at),
            method: request.method.to_string(),
            params: envelope::forwarded_params(&request.query),
            body,
            headers: request::headers_to_json(&request.headers),
            client_address: request.client_address.map(|addr| addr.ip().to_string()),
            path: request.path.clone(),
            original_url: request.original_url.clone(),
        };
        let payload = envelope
            .to_bytes()
            .map_err(|e| WebhookError::Serialization(e.to_string()))?;

        // 6. Publish
        let message_id = uuid::Uuid::new_v4().to_string();
        let properties = PublishProperties::persistent_json(received_at.timestamp().max(0) as u64)
            .with_message_id(message_id.clone())
            .with_app_id(APP_ID);

        if let Err(err) = self
            .manager
            .publish(&exchange, ROUTING_KEY, &payload, &properties)
            .await
        {
            self.note_broker_failure(&err);
            return Err(WebhookError::Publish(err.to_string()));
        }

        info!(
            exchange = %exchange,
            message_id = %message_id,
            bytes = payload.len(),
            method = %request.method,
            "Webhook published"
        );

        Ok(Accepted {
            exchange,
            timestamp: envelope.timestamp,
            message_id,
        })
    }

    fn authenticate(&self, presented: Option<&str>) -> bool {
        match (self.token.as_deref(), presented) {
            (Some(expected), Some(presented)) => {
                constant_time_eq(expected.as_bytes(), presented.as_bytes())
            }
            _ => false,
        }
    }

    fn note_broker_failure(&self, err: &LinkError) {
        if !err.is_link_closed() {
            debug!("Broker operation failed: {}", err);
            return;
        }

        match err.epoch {
            Some(epoch) => {
                warn!(epoch, "Broker link closed mid-request, starting recovery: {}", err);
                self.manager.report_link_failure(epoch, &err.to_string());
            }
            None => {
                // Link already down; recovery only needs to be armed
                self.manager.schedule_reconnect();
            }
        }
    }
}

/// Constant-time byte comparison for the shared secret
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
