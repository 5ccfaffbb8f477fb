use axum::{
    extract::{Query, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use peephole::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Keeps per-path counts and prints every record as a JSON line
#[derive(Debug, Clone, Default)]
struct DemoHandler {
    counts: Arc<Mutex<HashMap<String, u64>>>,
}

impl DemoHandler {
    fn get_counts(&self) -> HashMap<String, u64> {
        self.counts.lock().unwrap().clone()
    }
}

impl RecordHandler for DemoHandler {
    async fn handle_record(&self, record: ObservationRecord) {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(record.path.clone())
            .or_insert(0) += 1;

        match record.to_json() {
            Ok(line) => info!(target: "demo::records", "{line}"),
            Err(e) => info!(error = %e, "Failed to render record"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct Student {
    name: String,
    age: u32,
}

async fn set_token(request: Request, next: Next) -> Response {
    if let Some(values) = request.extensions().get::<ContextValues>() {
        values.insert("token", "abc123");
    }
    next.run(request).await
}

async fn test_handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    info!(name = ?params.get("name"), age = ?params.get("age"), "Handling test request");
    sleep(Duration::from_millis(200)).await; // Simulate some work
    Json(json!({ "status": 0, "msg": "ok", "data": null }))
}

async fn post_handler(Json(student): Json<Student>) -> Json<Value> {
    sleep(Duration::from_millis(100)).await; // Simulate some work
    Json(json!({ "status": 0, "msg": "ok", "data": student }))
}

async fn stats_handler(demo_handler: DemoHandler) -> Json<Value> {
    Json(json!({ "request_counts": demo_handler.get_counts() }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting observation middleware demo server");

    let demo_handler = DemoHandler::default();
    let stats = demo_handler.clone();

    let config = RequestLoggerConfig::new()
        .with_fields(FieldSelection {
            query: true,
            request_body: true,
            response_body: true,
            context_keys: vec!["token".to_string()],
            request_header_keys: vec!["Content-Type".to_string(), "User-Agent".to_string()],
            response_header_keys: vec!["Content-Type".to_string()],
            ..FieldSelection::default()
        })
        .with_skip(SkipPolicy::query_flag(DEFAULT_SKIP_PARAM))
        .with_emitter(Emitter::handler(
            MultiHandler::new().with(demo_handler).with(LoggingHandler),
        ));

    let api = Router::new()
        .route("/test", get(test_handler))
        .route("/post", post(post_handler))
        .layer(middleware::from_fn(set_token));

    let app = Router::new()
        .nest("/api/v1", api)
        .route("/stats", get(move || stats_handler(stats.clone())))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestLoggerLayer::new(config))
                .into_inner(),
        );

    info!("Try these commands:");
    info!("  curl 'http://localhost:8080/api/v1/test?name=a&age=3'");
    info!("  curl 'http://localhost:8080/api/v1/test?logMode=false'");
    info!("  curl -X POST -H 'Content-Type: application/json' -d '{{\"name\":\"a\",\"age\":3}}' http://localhost:8080/api/v1/post");
    info!("  curl http://localhost:8080/stats");

    let listener = TcpListener::bind("0.0.0.0:8080").await?;
    info!("Demo server listening on http://localhost:8080");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
