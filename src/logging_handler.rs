//! Default record handler.
//!
//! This module provides [`LoggingHandler`], which renders each record as one line through the
//! `tracing` crate. It is what the middleware emits to when no emitter is configured, and an
//! example of how to implement [`RecordHandler`].

use tracing::info;

use crate::{ObservationRecord, RecordHandler};

/// Logging implementation of [`RecordHandler`].
///
/// Each record is logged at `INFO` as `"<status> <latency> <ip> <method> <path>"`, with the
/// same values attached as structured fields. Where the line ends up is decided by the
/// subscriber the application installs.
///
/// # Examples
///
/// ```rust
/// use peephole::{Emitter, LoggingHandler, RequestLoggerConfig, RequestLoggerLayer};
///
/// // Equivalent to RequestLoggerConfig::default()
/// let config = RequestLoggerConfig::default().with_emitter(Emitter::handler(LoggingHandler));
/// let layer = RequestLoggerLayer::new(config);
/// ```
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler;

impl RecordHandler for LoggingHandler {
    async fn handle_record(&self, record: ObservationRecord) {
        info!(
            status = record.status_code,
            latency_ms = record.latency.as_secs_f64() * 1000.0,
            source_address = %record.source_address,
            method = %record.method,
            path = %record.path,
            request_headers = ?record.request_headers,
            response_headers = ?record.response_headers,
            context_values = ?record.context_values,
            request_body_size = record.request_body.len(),
            response_body_size = record.response_body.len(),
            "{record}"
        );
    }
}
