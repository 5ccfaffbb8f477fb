//! Data types for observed HTTP exchanges.
//!
//! This module contains the record emitted once per observed exchange, and the snapshot of the
//! exchange that records are extracted from.

use axum::{
    extract::{ConnectInfo, OriginalUri, Request},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::Response,
};
use serde::{Serialize, Serializer};
use std::{collections::HashMap, fmt, net::SocketAddr, time::Duration};

use crate::context::ContextValues;

/// The structured record emitted for one observed exchange.
///
/// Every field is always present. Fields whose capture is switched off hold the zero value of
/// their type (empty string, empty map, `0`), so consumers can rely on a fixed schema.
///
/// # Examples
///
/// ```rust
/// use peephole::ObservationRecord;
///
/// let record = ObservationRecord {
///     method: "POST".to_string(),
///     path: "/post".to_string(),
///     status_code: 200,
///     ..Default::default()
/// };
/// let line = record.to_json().unwrap();
/// assert!(line.contains("\"status_code\":200"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservationRecord {
    /// Origin address of the caller
    pub source_address: String,
    /// Request path, with the query string if configured
    pub path: String,
    /// HTTP method (GET, POST, etc.)
    pub method: String,
    /// Configured subset of the request headers
    pub request_headers: HashMap<String, String>,
    /// Configured subset of the final response headers
    pub response_headers: HashMap<String, String>,
    /// Configured subset of the exchange's context values
    pub context_values: HashMap<String, String>,
    /// Captured request body
    pub request_body: String,
    /// Captured response body
    pub response_body: String,
    /// HTTP status code of the response, `0` if not captured
    pub status_code: u16,
    /// Time from the start of observation until the inner service completed
    #[serde(rename = "latency_ns", serialize_with = "serialize_nanos")]
    pub latency: Duration,
}

impl ObservationRecord {
    /// Renders the record as a single line of JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn serialize_nanos<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX))
}

impl fmt::Display for ObservationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {} {} {}",
            self.status_code, self.latency, self.source_address, self.method, self.path
        )
    }
}

/// Snapshot of an exchange as seen by the middleware.
///
/// The request side is taken before the inner service runs; the response side is filled in
/// once it completes. Lightweight emitters receive this instead of a full record.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Request URI as received, before any router rewrote it
    pub uri: Uri,
    /// HTTP request headers
    pub request_headers: HeaderMap,
    /// Peer address, if the server was set up with connect info
    pub remote_addr: Option<SocketAddr>,
    /// Values set by other middleware and handlers during the exchange
    pub context: ContextValues,
    /// Final response status
    pub status: StatusCode,
    /// Final response headers
    pub response_headers: HeaderMap,
}

impl Exchange {
    pub(crate) fn begin(request: &Request, context: ContextValues) -> Self {
        let uri = request
            .extensions()
            .get::<OriginalUri>()
            .map(|OriginalUri(uri)| uri.clone())
            .unwrap_or_else(|| request.uri().clone());
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Self {
            method: request.method().clone(),
            uri,
            request_headers: request.headers().clone(),
            remote_addr,
            context,
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
        }
    }

    pub(crate) fn finish(&mut self, response: &Response) {
        self.status = response.status();
        self.response_headers = response.headers().clone();
    }

    /// The inner service failed or panicked; no response exists, so record what the
    /// client ends up with.
    pub(crate) fn fault(&mut self) {
        self.status = StatusCode::INTERNAL_SERVER_ERROR;
        self.response_headers.clear();
    }
}
