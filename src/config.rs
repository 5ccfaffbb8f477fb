//! Middleware configuration.
//!
//! A [`RequestLoggerConfig`] is built once, typically at startup, and shared read-only by every
//! exchange passing through the layer.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    body_wrapper::Capture,
    extract::{extract_record, FieldSelection},
    multi_handler::{DynHandler, HandlerWrapper},
    skip::SkipPolicy,
    types::Exchange,
    LoggingHandler, ObservationRecord, RecordHandler,
};

type RecordFn = dyn Fn(&ObservationRecord) + Send + Sync;
type LatencyFn = dyn Fn(&Exchange, Duration) + Send + Sync;

/// The sink that receives what the middleware observed.
///
/// Exactly one kind of sink is active per configuration. It is chosen when the emitter is
/// built, not per exchange. The default logs every record through [`LoggingHandler`].
///
/// # Examples
///
/// ```rust
/// use peephole::Emitter;
///
/// // Full record, synchronously, as a JSON line
/// let json_lines = Emitter::record(|record| {
///     if let Ok(line) = record.to_json() {
///         println!("{line}");
///     }
/// });
///
/// // Latency only, skipping body capture and field extraction entirely
/// let latency = Emitter::latency(|exchange, latency| {
///     println!("{} {} took {latency:?}", exchange.method, exchange.uri);
/// });
/// ```
#[derive(Clone)]
pub struct Emitter {
    kind: EmitterKind,
}

#[derive(Clone)]
enum EmitterKind {
    Record(Arc<RecordFn>),
    Latency(Arc<LatencyFn>),
    Handler(Arc<dyn DynHandler>),
}

impl Emitter {
    /// Emit the full record to a synchronous callback.
    pub fn record<F>(callback: F) -> Self
    where
        F: Fn(&ObservationRecord) + Send + Sync + 'static,
    {
        Self {
            kind: EmitterKind::Record(Arc::new(callback)),
        }
    }

    /// Emit only the elapsed time, alongside the exchange it was measured for.
    pub fn latency<F>(callback: F) -> Self
    where
        F: Fn(&Exchange, Duration) + Send + Sync + 'static,
    {
        Self {
            kind: EmitterKind::Latency(Arc::new(callback)),
        }
    }

    /// Emit the full record to an async [`RecordHandler`], awaited before the response is
    /// returned.
    pub fn handler<H: RecordHandler>(handler: H) -> Self {
        Self {
            kind: EmitterKind::Handler(Arc::new(HandlerWrapper { inner: handler })),
        }
    }

    /// Whether this emitter consumes a full [`ObservationRecord`].
    pub fn wants_record(&self) -> bool {
        !matches!(self.kind, EmitterKind::Latency(_))
    }

    pub(crate) async fn emit(
        &self,
        exchange: &Exchange,
        request_body: Option<&Capture>,
        response_body: Option<&Capture>,
        started: Instant,
        finished: Instant,
        fields: &FieldSelection,
    ) {
        match &self.kind {
            EmitterKind::Latency(callback) => {
                callback(exchange, finished.saturating_duration_since(started));
            }
            EmitterKind::Record(callback) => {
                let record = extract_record(
                    exchange,
                    request_body,
                    response_body,
                    started,
                    finished,
                    fields,
                );
                callback(&record);
            }
            EmitterKind::Handler(handler) => {
                let record = extract_record(
                    exchange,
                    request_body,
                    response_body,
                    started,
                    finished,
                    fields,
                );
                handler.handle_record_boxed(record).await;
            }
        }
    }
}

impl Default for Emitter {
    fn default() -> Self {
        Self::handler(LoggingHandler)
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EmitterKind::Record(_) => "Record",
            EmitterKind::Latency(_) => "Latency",
            EmitterKind::Handler(_) => "Handler",
        };
        f.debug_tuple("Emitter").field(&kind).finish()
    }
}

/// Configuration for the request logging middleware.
///
/// Controls what is captured, which exchanges are skipped, and where records go.
///
/// # Examples
///
/// ```rust
/// use peephole::{Emitter, FieldSelection, RequestLoggerConfig, SkipPolicy, DEFAULT_SKIP_PARAM};
///
/// // Default configuration: status, ip, method and path, logged through `tracing`
/// let config = RequestLoggerConfig::default();
///
/// // Custom configuration
/// let config = RequestLoggerConfig::new()
///     .with_fields(FieldSelection {
///         request_body: true,
///         response_body: true,
///         context_keys: vec!["token".to_string()],
///         ..FieldSelection::default()
///     })
///     .with_skip(SkipPolicy::query_flag(DEFAULT_SKIP_PARAM))
///     .with_emitter(Emitter::record(|record| println!("{record}")));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestLoggerConfig {
    /// Fields recorded for each exchange
    pub fields: FieldSelection,
    /// Exchanges that are not observed at all
    pub skip: SkipPolicy,
    /// Where records go
    pub emitter: Emitter,
}

impl RequestLoggerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(mut self, fields: FieldSelection) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_skip(mut self, skip: SkipPolicy) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_emitter(mut self, emitter: Emitter) -> Self {
        self.emitter = emitter;
        self
    }
}
