//! Webhook envelope
//!
//! The JSON document published for every accepted webhook. Field names and
//! order are part of the wire contract consumers rely on:
//!
//! ```json
//! {"timestamp":"...","method":"POST","params":{},"body":{},"headers":{},
//!  "clientAddress":"10.0.0.1","path":"/webhook","originalUrl":"/webhook?..."}
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Query parameters consumed by the bridge itself and never forwarded
pub const CONTROL_PARAMS: [&str; 2] = ["token", "exchange"];

/// Message published for one webhook request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    /// Receive time, RFC 3339 UTC with millisecond precision
    pub timestamp: String,
    pub method: String,
    /// Query parameters minus control params; repeated keys become arrays
    pub params: Map<String, Value>,
    pub body: Value,
    /// Lower-cased header names; repeated headers joined with ", "
    pub headers: Map<String, Value>,
    pub client_address: Option<String>,
    pub path: String,
    pub original_url: String,
}

impl WebhookEnvelope {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Render a timestamp the way the envelope carries it
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Group query pairs into an object, dropping control params
pub fn forwarded_params(pairs: &[(String, String)]) -> Map<String, Value> {
    group_pairs(
        pairs
            .iter()
            .filter(|(key, _)| !CONTROL_PARAMS.contains(&key.as_str()))
            .cloned(),
    )
}

/// Collect key/value pairs into an object
///
/// A key seen once maps to a string; a repeated key maps to an array of its
/// values in arrival order.
pub fn group_pairs<I>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out = Map::new();

    for (key, value) in pairs {
        let value = Value::String(value);
        match out.get_mut(&key) {
            None => {
                out.insert(key, value);
            }
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn empty_envelope() -> WebhookEnvelope {
        WebhookEnvelope {
            timestamp: "2026-01-02T03:04:05.006Z".to_string(),
            method: "GET".to_string(),
            params: Map::new(),
            body: json!({}),
            headers: Map::new(),
            client_address: None,
            path: "/webhook".to_string(),
            original_url: "/webhook?token=t&exchange=e".to_string(),
        }
    }

    #[test]
    fn test_control_params_removed() {
        let params = forwarded_params(&pairs(&[
            ("token", "s3cret"),
            ("exchange", "orders"),
            ("source", "github"),
        ]));
        assert_eq!(params.len(), 1);
        assert_eq!(params["source"], json!("github"));
    }

    #[test]
    fn test_repeated_keys_become_arrays() {
        let params = forwarded_params(&pairs(&[
            ("tag", "a"),
            ("tag", "b"),
            ("tag", "c"),
            ("one", "x"),
        ]));
        assert_eq!(params["tag"], json!(["a", "b", "c"]));
        assert_eq!(params["one"], json!("x"));
    }

    #[test]
    fn test_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2026, 10, 18, 9, 30, 0).unwrap();
        assert_eq!(format_timestamp(at), "2026-10-18T09:30:00.000Z");
    }

    #[test]
    fn test_wire_field_names() {
        let encoded = String::from_utf8(empty_envelope().to_bytes().unwrap()).unwrap();
        assert!(encoded.starts_with(r#"{"timestamp":"2026-01-02T03:04:05.006Z","method":"GET""#));
        assert!(encoded.contains(r#""clientAddress":null"#));
        assert!(encoded.ends_with(r#""path":"/webhook","originalUrl":"/webhook?token=t&exchange=e"}"#));
    }

    #[test]
    fn test_round_trip_empty() {
        let envelope = empty_envelope();
        let decoded = WebhookEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_round_trip_nested_body_and_repeated_params() {
        let mut headers = Map::new();
        headers.insert("content-type".to_string(), json!("application/json"));
        headers.insert("x-forwarded-for".to_string(), json!("1.1.1.1, 2.2.2.2"));

        let envelope = WebhookEnvelope {
            timestamp: "2026-10-18T09:30:00.000Z".to_string(),
            method: "POST".to_string(),
            params: forwarded_params(&pairs(&[("id", "1"), ("id", "2"), ("src", "ci")])),
            body: json!({
                "event": "push",
                "commits": [{"id": "abc", "files": ["a.rs", "b.rs"]}],
                "meta": {"nested": {"deep": true, "n": 3.5}}
            }),
            headers,
            client_address: Some("10.0.0.7".to_string()),
            path: "/webhook".to_string(),
            original_url: "/webhook?token=t&exchange=e&id=1&id=2&src=ci".to_string(),
        };

        let decoded = WebhookEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.params["id"], json!(["1", "2"]));
    }
}
