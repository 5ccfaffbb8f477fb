//! # Peephole
//!
//! A non-intrusive Axum middleware that observes HTTP exchanges and emits one structured record
//! per request/response pair, without changing what the handler or the client sees.
//!
//! ## Features
//!
//! - **Transparent**: Captured bodies are replayed frame by frame, with their original framing,
//!   so handlers read exactly the request they would have read without the middleware
//! - **Configurable fields**: Status, caller address, method, path (with or without query),
//!   selected headers, context values and bodies are each toggled independently
//! - **Skip policies**: Opt exchanges out of observation before any capture work happens
//! - **Pluggable emitters**: Synchronous callbacks, latency-only callbacks, or async handlers
//! - **Fault tolerant**: Records are still emitted when the inner service fails or panics, and
//!   capture failures only ever blank the affected field
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{extract::Request, middleware::{self, Next}, response::Response, routing::post, Router};
//! use peephole::{ContextValues, Emitter, FieldSelection, RequestLoggerConfig, RequestLoggerLayer, SkipPolicy};
//! use tower::ServiceBuilder;
//!
//! async fn set_token(request: Request, next: Next) -> Response {
//!     if let Some(values) = request.extensions().get::<ContextValues>() {
//!         values.insert("token", "abc123");
//!     }
//!     next.run(request).await
//! }
//!
//! async fn echo(body: String) -> String {
//!     body
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RequestLoggerConfig::new()
//!         .with_fields(FieldSelection {
//!             request_body: true,
//!             response_body: true,
//!             context_keys: vec!["token".to_string()],
//!             response_header_keys: vec!["Content-Type".to_string()],
//!             ..FieldSelection::default()
//!         })
//!         .with_skip(SkipPolicy::query_flag("logMode"))
//!         .with_emitter(Emitter::record(|record| {
//!             if let Ok(line) = record.to_json() {
//!                 println!("{line}");
//!             }
//!         }));
//!
//!     let app = Router::new()
//!         .route("/post", post(echo))
//!         .layer(middleware::from_fn(set_token))
//!         .layer(ServiceBuilder::new().layer(RequestLoggerLayer::new(config)));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! ## Custom Handlers
//!
//! Implement the [`RecordHandler`] trait to process records asynchronously:
//!
//! ```rust
//! use peephole::{ObservationRecord, RecordHandler};
//!
//! #[derive(Debug)]
//! struct CustomHandler;
//!
//! impl RecordHandler for CustomHandler {
//!     async fn handle_record(&self, record: ObservationRecord) {
//!         println!("{} {} -> {} ({}ms)",
//!                  record.method, record.path, record.status_code, record.latency.as_millis());
//!     }
//! }
//! ```

use axum::{
    body::{Body, HttpBody},
    extract::Request,
    response::Response,
};
use futures::FutureExt;
use std::{
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};
use tower::{Layer, Service};
use tracing::{debug, instrument, warn};

pub mod types;
pub use types::{Exchange, ObservationRecord};

pub mod body_wrapper;
use body_wrapper::{capture_body, Capture, Framing, ObservedBody};

pub mod config;
pub use config::{Emitter, RequestLoggerConfig};

pub mod context;
pub use context::{ContextValues, MISSING_VALUE};

pub mod extract;
pub use extract::{extract_record, FieldSelection};

pub mod skip;
pub use skip::{SkipPolicy, DEFAULT_SKIP_PARAM};

pub mod logging_handler;
pub use logging_handler::LoggingHandler;

pub mod multi_handler;
pub use multi_handler::MultiHandler;

/// Trait for handling finished observation records.
///
/// Implement this trait to process records asynchronously. The handler is awaited inside the
/// exchange it observed, after the inner service completed and before the response is returned
/// (or, when the response body is captured, before the end of that body is delivered), so it
/// should be quick: hand the record off to a channel or a buffered writer rather than
/// performing slow I/O inline.
///
/// # Examples
///
/// ```rust
/// use peephole::{ObservationRecord, RecordHandler};
/// use tracing::info;
///
/// #[derive(Debug)]
/// struct MyHandler;
///
/// impl RecordHandler for MyHandler {
///     async fn handle_record(&self, record: ObservationRecord) {
///         info!("Served {} {} with {} in {}ms",
///               record.method, record.path, record.status_code, record.latency.as_millis());
///     }
/// }
/// ```
pub trait RecordHandler: Send + Sync + 'static {
    /// Handle the record of one observed exchange.
    ///
    /// # Arguments
    ///
    /// * `record` - The observed fields of the exchange, populated per the configuration
    fn handle_record(&self, record: ObservationRecord) -> impl std::future::Future<Output = ()> + Send;
}

/// Tower layer for the request logging middleware.
///
/// This is the main entry point for using the middleware. It implements the Tower [`Layer`]
/// trait and can be used with Axum's layering system. The configuration is shared read-only by
/// every service the layer produces.
///
/// # Examples
///
/// ```rust,no_run
/// use peephole::{RequestLoggerLayer, RequestLoggerConfig};
/// use axum::{routing::get, Router};
/// use tower::ServiceBuilder;
///
/// # async fn hello() -> &'static str { "Hello" }
/// # #[tokio::main]
/// # async fn main() {
/// let layer = RequestLoggerLayer::new(RequestLoggerConfig::default());
///
/// let app = Router::new()
///     .route("/hello", get(hello))
///     .layer(ServiceBuilder::new().layer(layer));
///
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
/// axum::serve(listener, app).await.unwrap();
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RequestLoggerLayer {
    config: Arc<RequestLoggerConfig>,
}

impl RequestLoggerLayer {
    /// Create a new request logger layer with the given configuration.
    pub fn new(config: RequestLoggerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestLoggerService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Tower service implementation for the request logging middleware.
///
/// For every exchange that is not skipped, this service captures the request body (if
/// configured) before calling the inner service exactly once, then builds the record and emits
/// it before handing the response back. When the response body is captured, the response is
/// handed back immediately and the record is emitted once its body has been read to the end.
///
/// Users typically don't interact with this type directly - it's created by
/// [`RequestLoggerLayer`].
#[derive(Clone, Debug)]
pub struct RequestLoggerService<S> {
    inner: S,
    config: Arc<RequestLoggerConfig>,
}

impl<S> Service<Request> for RequestLoggerService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        if self.config.skip.should_skip(&request) {
            debug!(uri = %request.uri(), "Skipping observation");
            return Box::pin(self.inner.call(request));
        }

        // The clone may not be ready; keep it and dispatch on the one that was polled.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(observe(inner, self.config.clone(), request))
    }
}

async fn observe<S>(
    mut inner: S,
    config: Arc<RequestLoggerConfig>,
    mut request: Request,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
{
    let started = Instant::now();
    let wants_record = config.emitter.wants_record();
    let capture_request = wants_record && config.fields.request_body;
    let capture_response = wants_record && config.fields.response_body;

    let context = ContextValues::install(&mut request);
    let exchange = Exchange::begin(&request, context);

    debug!(method = %exchange.method, uri = %exchange.uri, "Observing exchange");

    // The replacement body must be in place before the inner service sees the request.
    let request_capture = if capture_request {
        debug!("Capturing request body");
        Some(replace_body(&mut request).await)
    } else {
        None
    };

    let outcome = AssertUnwindSafe(inner.call(request)).catch_unwind().await;
    let mut pending = PendingRecord {
        config,
        exchange,
        request_capture,
        started,
        finished: Instant::now(),
    };

    match outcome {
        Ok(Ok(response)) => {
            debug!(status = %response.status(), "Inner service response received");
            pending.exchange.finish(&response);

            if capture_response && !response.body().is_end_stream() {
                debug!("Capturing response body as it streams");
                return Ok(observe_response_body(response, pending));
            }

            pending.emit(None).await;
            Ok(response)
        }
        Ok(Err(e)) => {
            warn!(uri = %pending.exchange.uri, "Inner service failed");
            pending.exchange.fault();
            pending.emit(None).await;
            Err(e)
        }
        Err(panic) => {
            warn!(uri = %pending.exchange.uri, "Inner service panicked");
            pending.exchange.fault();
            pending.emit(None).await;
            std::panic::resume_unwind(panic)
        }
    }
}

/// Everything needed to emit the record of one exchange, short of the response body.
struct PendingRecord {
    config: Arc<RequestLoggerConfig>,
    exchange: Exchange,
    request_capture: Option<Capture>,
    started: Instant,
    finished: Instant,
}

impl PendingRecord {
    async fn emit(self, response_capture: Option<Capture>) {
        self.config
            .emitter
            .emit(
                &self.exchange,
                self.request_capture.as_ref(),
                response_capture.as_ref(),
                self.started,
                self.finished,
                &self.config.fields,
            )
            .await;
    }
}

async fn replace_body(request: &mut Request) -> Capture {
    let framing = Framing::detect(request.headers(), request.body());
    let body = std::mem::replace(request.body_mut(), Body::empty());
    let (capture, replacement) = capture_body(body, framing).await;
    *request.body_mut() = replacement;
    capture
}

/// Hands the response back right away. The record is emitted by whoever reads the body, once it
/// ends, fails or is dropped.
fn observe_response_body(response: Response, pending: PendingRecord) -> Response {
    let framing = Framing::detect(response.headers(), response.body());
    response.map(|body| {
        Body::new(ObservedBody::new(body, framing, move |capture| {
            pending.emit(Some(capture))
        }))
    })
}
