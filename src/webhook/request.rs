// Incoming webhook request
//
// Framework-independent view of an HTTP request plus the decoding rules for
// query strings, headers and bodies.

use crate::webhook::envelope::group_pairs;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, Method};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use url::form_urlencoded;

/// Largest body accepted on the webhook route
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Request as seen by the ingestion pipeline
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub path: String,
    /// Path plus query string as received
    pub original_url: String,
    /// Decoded query pairs in arrival order
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_address: Option<SocketAddr>,
}

impl WebhookRequest {
    /// Build a request from a URI path-and-query string
    pub fn new(method: Method, path_and_query: &str) -> Self {
        let (path, raw_query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        Self {
            method,
            path: path.to_string(),
            original_url: path_and_query.to_string(),
            query: parse_query(raw_query),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_address: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_client_address(mut self, addr: Option<SocketAddr>) -> Self {
        self.client_address = addr;
        self
    }

    /// First value of a query parameter
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Decode a raw query string into ordered pairs
///
/// Invalid percent-escapes decode lossily instead of failing.
pub fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| decode_pairs(raw.as_bytes())).unwrap_or_default()
}

fn decode_pairs(input: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(input)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

/// Header map as a JSON object with lower-cased names
pub fn headers_to_json(headers: &HeaderMap) -> Map<String, Value> {
    let mut out = Map::new();

    for name in headers.keys() {
        let joined = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        out.insert(name.as_str().to_string(), Value::String(joined));
    }

    out
}

/// Why a body could not be decoded
#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("Invalid JSON body: {0}")]
    Json(String),
    #[error("Request body is not valid UTF-8")]
    NotUtf8,
}

/// Decode a body according to its content type
///
/// JSON bodies are parsed, form bodies become an object (repeated fields turn
/// into arrays), anything else is kept as text. An empty body is `{}`.
pub fn decode_body(headers: &HeaderMap, body: &[u8]) -> Result<Value, BodyError> {
    if body.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
        .unwrap_or_default();

    if content_type.starts_with("application/json") || content_type.contains("+json") {
        return serde_json::from_slice(body).map_err(|e| BodyError::Json(e.to_string()));
    }

    if content_type.starts_with("application/x-www-form-urlencoded") {
        if std::str::from_utf8(body).is_err() {
            return Err(BodyError::NotUtf8);
        }
        return Ok(Value::Object(group_pairs(decode_pairs(body))));
    }

    Ok(Value::String(String::from_utf8_lossy(body).into_owned()))
}
