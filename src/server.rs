// HTTP surface
//
// Routes:
// - ANY /webhook  ingestion pipeline
// - GET /health   liveness plus broker link summary
// - GET /debug    configuration presence and link counters (no secrets)
// - GET /metrics  Prometheus exposition

use crate::broker::address;
use crate::broker::manager::ConnectionManager;
use crate::config::EnvPresence;
use crate::metrics;
use crate::webhook::envelope;
use crate::webhook::error::WebhookError;
use crate::webhook::pipeline::WebhookPipeline;
use crate::webhook::request::{WebhookRequest, MAX_BODY_BYTES};
use anyhow::{Context, Result};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub manager: ConnectionManager,
    pub pipeline: Arc<WebhookPipeline>,
    pub env: EnvPresence,
    /// Broker address with credentials masked
    pub target_redacted: String,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(manager: ConnectionManager, token: Option<String>, env: EnvPresence) -> Self {
        let target_redacted = address::redact(&manager.settings().target_uri);
        let pipeline = Arc::new(WebhookPipeline::new(manager.clone(), token));
        Self {
            manager,
            pipeline,
            env,
            target_redacted,
            started_at: Utc::now(),
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", any(webhook_handler))
        .route("/health", get(health_handler))
        .route("/debug", get(debug_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves, then drain in-flight requests
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!("Webhook server listening on {}", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("HTTP server error")?;

    info!("Webhook server stopped");
    Ok(())
}

async fn webhook_handler(State(state): State<AppState>, request: Request) -> Response {
    let client_address = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            let err = if is_length_limit(e) {
                WebhookError::PayloadTooLarge {
                    limit: MAX_BODY_BYTES,
                }
            } else {
                WebhookError::Validation("Failed to read request body".to_string())
            };
            metrics::WEBHOOK_REQUESTS_TOTAL
                .with_label_values(&[err.outcome()])
                .inc();
            return err.into_response();
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());

    let request = WebhookRequest::new(parts.method, path_and_query)
        .with_headers(parts.headers)
        .with_body(body)
        .with_client_address(client_address);

    match state.pipeline.handle(request).await {
        Ok(accepted) => accepted.into_response(),
        Err(err) => err.into_response(),
    }
}

fn is_length_limit(err: axum::Error) -> bool {
    err.into_inner()
        .downcast_ref::<http_body_util::LengthLimitError>()
        .is_some()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.manager.status();
    Json(json!({
        "status": "ok",
        "rabbitmq": if status.connected { "connected" } else { "disconnected" },
        "reconnectAttempts": status.reconnect_attempts,
        "maxAttempts": status.max_attempts,
        "isReconnecting": status.is_reconnecting,
        "timestamp": envelope::format_timestamp(Utc::now()),
    }))
}

async fn debug_handler(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.manager.status();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);
    Json(json!({
        "env": state.env,
        "target": state.target_redacted,
        "connection": status,
        "uptimeSeconds": uptime,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics_handler() -> Response {
    match metrics::gather_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error gathering metrics: {}", e),
            )
                .into_response()
        }
    }
}
