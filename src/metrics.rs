// Prometheus metrics for the HookBridge gateway
//
// Exposes metrics on /metrics HTTP endpoint:
// - Webhook requests by outcome (counter)
// - Published messages and publish latency (counter, histogram)
// - Exchange declares and cache hits (counter)
// - Broker connect attempts and link events (counter)
// - Broker connectivity (gauge)

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::{Arc, Once};

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Webhook metrics
    pub static ref WEBHOOK_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Webhook requests by outcome"),
        &["outcome"]
    ).expect("Failed to create webhook requests metric");

    pub static ref MESSAGES_PUBLISHED_TOTAL: IntCounter = IntCounter::new(
        "messages_published_total",
        "Messages published to the broker"
    ).expect("Failed to create messages published metric");

    pub static ref PUBLISH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("publish_duration_seconds", "Time spent in the broker publish call"),
    ).expect("Failed to create publish duration metric");

    // Exchange metrics
    pub static ref EXCHANGE_DECLARES_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("exchange_declares_total", "Exchange declare calls sent to the broker"),
        &["result"]
    ).expect("Failed to create exchange declares metric");

    pub static ref EXCHANGE_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "exchange_cache_hits_total",
        "Exchange assertions answered from the cache"
    ).expect("Failed to create exchange cache hits metric");

    // Broker link metrics
    pub static ref BROKER_CONNECT_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("broker_connect_attempts_total", "Broker connect attempts by result"),
        &["result"]
    ).expect("Failed to create connect attempts metric");

    pub static ref BROKER_LINK_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("broker_link_events_total", "Connection and channel failure events"),
        &["kind"]
    ).expect("Failed to create link events metric");

    pub static ref BROKER_CONNECTED: IntGauge = IntGauge::new(
        "broker_connected",
        "1 while a usable broker channel exists"
    ).expect("Failed to create broker connected metric");
}

static INIT: Once = Once::new();

/// Register all metrics with the registry
///
/// Safe to call more than once; only the first call registers.
pub fn init() -> prometheus::Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = register_all();
    });
    result
}

fn register_all() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(WEBHOOK_REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(MESSAGES_PUBLISHED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(PUBLISH_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(EXCHANGE_DECLARES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(EXCHANGE_CACHE_HITS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_CONNECT_ATTEMPTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_LINK_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BROKER_CONNECTED.clone()))?;
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_contains_webhook_counter() {
        init().unwrap();
        WEBHOOK_REQUESTS_TOTAL.with_label_values(&["accepted"]).inc();

        let text = gather_metrics().unwrap();
        assert!(text.contains("webhook_requests_total"));
    }
}
