//! Selection of the fields that go into an [`ObservationRecord`].

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::{body_wrapper::Capture, types::Exchange, ObservationRecord};

/// Which parts of an exchange end up in the record.
///
/// Every toggle is independent. Disabled fields keep their zero value in the record. The
/// selection is deserializable, so it can live in the host application's config file:
///
/// ```rust
/// use peephole::FieldSelection;
///
/// let fields: FieldSelection = serde_json::from_str(
///     r#"{ "request_body": true, "context_keys": ["token"] }"#,
/// ).unwrap();
/// assert!(fields.status);
/// assert!(!fields.response_body);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSelection {
    /// Record the response status code
    pub status: bool,
    /// Record the caller's address
    pub ip: bool,
    /// Record the HTTP method
    pub method: bool,
    /// Record the request path
    pub path: bool,
    /// Include the query string in the recorded path
    pub query: bool,
    /// Capture the request body
    pub request_body: bool,
    /// Capture the response body
    pub response_body: bool,
    /// Record chunked request bodies in their chunk-encoded wire form
    pub chunked_wire_format: bool,
    /// Context values to record
    pub context_keys: Vec<String>,
    /// Request headers to record
    pub request_header_keys: Vec<String>,
    /// Response headers to record
    pub response_header_keys: Vec<String>,
    /// Headers consulted, in order, for the caller's address before the peer address
    pub remote_addr_headers: Vec<String>,
}

impl Default for FieldSelection {
    fn default() -> Self {
        Self {
            status: true,
            ip: true,
            method: true,
            path: true,
            query: false,
            request_body: false,
            response_body: false,
            chunked_wire_format: false,
            context_keys: Vec::new(),
            request_header_keys: Vec::new(),
            response_header_keys: Vec::new(),
            remote_addr_headers: Vec::new(),
        }
    }
}

impl FieldSelection {
    /// Every toggle on, no keyed lookups.
    pub fn all() -> Self {
        Self {
            query: true,
            request_body: true,
            response_body: true,
            ..Self::default()
        }
    }

    /// Every toggle off. Only the latency is recorded.
    pub fn none() -> Self {
        Self {
            status: false,
            ip: false,
            method: false,
            path: false,
            ..Self::default()
        }
    }
}

/// Builds the record for a finished exchange.
///
/// Only the selected fields are populated. Latency is always `finished - started`.
pub fn extract_record(
    exchange: &Exchange,
    request_body: Option<&Capture>,
    response_body: Option<&Capture>,
    started: Instant,
    finished: Instant,
    fields: &FieldSelection,
) -> ObservationRecord {
    let mut record = ObservationRecord {
        latency: finished.saturating_duration_since(started),
        ..Default::default()
    };

    if fields.status {
        record.status_code = exchange.status.as_u16();
    }
    if fields.ip {
        record.source_address = source_address(exchange, &fields.remote_addr_headers);
    }
    if fields.method {
        record.method = exchange.method.to_string();
    }
    if fields.path {
        record.path = match exchange.uri.path_and_query() {
            Some(path_and_query) if fields.query => path_and_query.as_str().to_owned(),
            _ => exchange.uri.path().to_owned(),
        };
    }

    if fields.request_body {
        if let Some(capture) = request_body {
            let bytes = if fields.chunked_wire_format {
                capture.wire_bytes()
            } else {
                capture.bytes()
            };
            record.request_body = String::from_utf8_lossy(&bytes).into_owned();
        }
    }
    if fields.response_body {
        if let Some(capture) = response_body {
            record.response_body = String::from_utf8_lossy(&capture.bytes()).into_owned();
        }
    }

    record.context_values = fields
        .context_keys
        .iter()
        .map(|key| (key.clone(), exchange.context.get_or_missing(key)))
        .collect();
    record.request_headers = fields
        .request_header_keys
        .iter()
        .map(|key| (key.clone(), first_value(&exchange.request_headers, key)))
        .collect();
    record.response_headers = fields
        .response_header_keys
        .iter()
        .map(|key| (key.clone(), joined_values(&exchange.response_headers, key)))
        .collect();

    record
}

fn source_address(exchange: &Exchange, remote_addr_headers: &[String]) -> String {
    // Forwarding headers list the original client first.
    let forwarded = remote_addr_headers.iter().find_map(|name| {
        let value = first_value(&exchange.request_headers, name);
        let client = value.split(',').next().unwrap_or_default().trim();
        (!client.is_empty()).then(|| client.to_owned())
    });

    forwarded
        .or_else(|| exchange.remote_addr.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// First value of header `name`, or an empty string. Lookup is case-insensitive; an invalid
/// header name never matches.
fn first_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default()
}

/// All values of header `name` joined with a space, or an empty string.
fn joined_values(headers: &HeaderMap, name: &str) -> String {
    headers
        .get_all(name)
        .iter()
        .map(|value| String::from_utf8_lossy(value.as_bytes()))
        .collect::<Vec<_>>()
        .join(" ")
}
