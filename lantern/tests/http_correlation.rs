//! Request correlation through the HTTP tier: headers, log records,
//! metrics and error bodies.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use lantern::config::PersistenceConfig;
use lantern::logging::emit;
use lantern::todo::{Todo, TodoRepository};
use lantern_testkit::{CapturedLogs, FlakyBroker, TestApp};
use serde_json::{json, Map};
use tracing::Level;

use common::{get, post_empty, post_form, post_json, send, traced_telemetry, INBOUND_TRACEPARENT};

#[tokio::test]
async fn test_request_id_matches_header_and_every_log_record() {
    let app = TestApp::new().unwrap();
    let router = app.router();
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let response = send(&router, get("/healthz")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.json()["status"], "healthy");

    let request_id = response.request_id();
    let records = logs.records();
    assert!(records.len() >= 2, "expected start and completion records");
    for record in &records {
        assert_eq!(record["request_id"], request_id.as_str(), "record: {record}");
    }
    assert_eq!(logs.with_message("Request started").len(), 1);
    let completed = logs.with_message("Request completed: GET /healthz");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["status_code"], 200);
    assert!(completed[0]["duration_ms"].is_number());
}

#[tokio::test]
async fn test_tracing_disabled_emits_no_trace_fields() {
    let app = TestApp::new().unwrap();
    let router = app.router();
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let response = send(&router, get("/")).await;
    assert_eq!(response.status, StatusCode::OK);
    assert!(response.header("traceparent").is_none());

    for record in logs.records() {
        assert!(record.get("trace_id").is_none(), "record: {record}");
        assert!(record.get("span_id").is_none(), "record: {record}");
    }
}

#[tokio::test]
async fn test_unreachable_collector_does_not_fail_requests() {
    let telemetry = traced_telemetry();
    assert!(telemetry.tracing_enabled());
    let app = TestApp::builder().with_telemetry(telemetry).build().unwrap();
    let router = app.router();
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let response = send(&router, get("/healthz")).await;
    assert_eq!(response.status, StatusCode::OK);
    let request_id = response.request_id();

    let traceparent = response.header("traceparent").expect("traceparent header");
    let parts: Vec<&str> = traceparent.split('-').collect();
    assert_eq!(parts.len(), 4);
    assert_eq!(parts[1].len(), 32);

    let completed = logs.with_message("Request completed");
    assert_eq!(completed[0]["request_id"], request_id.as_str());
    assert_eq!(completed[0]["trace_id"], parts[1]);
}

#[tokio::test]
async fn test_inbound_traceparent_continues_the_trace() {
    let app = TestApp::builder()
        .with_telemetry(traced_telemetry())
        .build()
        .unwrap();
    let router = app.router();

    let mut request = get("/healthz");
    request
        .headers_mut()
        .insert("traceparent", INBOUND_TRACEPARENT.parse().unwrap());
    let response = send(&router, request).await;

    let traceparent = response.header("traceparent").expect("traceparent header");
    assert!(traceparent.starts_with("00-4bf92f3577b34da6a3ce929d0e0e4736-"));
    assert!(!traceparent.contains("00f067aa0ba902b7"), "server span needs its own id");
}

#[tokio::test]
async fn test_unknown_task_is_not_found_and_malformed_is_bad_request() {
    let app = TestApp::new().unwrap();
    let router = app.router();

    let missing = send(&router, get(&format!("/tasks/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    let body = missing.json();
    assert!(body["error"].as_str().unwrap().contains("not found"));
    assert_eq!(body["request_id"], missing.request_id().as_str());

    let malformed = send(&router, get("/tasks/not-a-task")).await;
    assert_eq!(malformed.status, StatusCode::BAD_REQUEST);
    assert_eq!(malformed.json()["request_id"], malformed.request_id().as_str());
}

#[tokio::test]
async fn test_concurrent_requests_get_distinct_ids_and_whole_lines() {
    let app = TestApp::new().unwrap();
    let router = app.router();
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let (first, second) = tokio::join!(send(&router, get("/")), send(&router, get("/healthz")));
    let (first_id, second_id) = (first.request_id(), second.request_id());
    assert_ne!(first_id, second_id);

    // records() panics on any line that is not a complete JSON object.
    let first_records = logs.for_request(&first_id);
    let second_records = logs.for_request(&second_id);
    assert_eq!(first_records.len() + second_records.len(), logs.records().len());
    assert!(first_records
        .iter()
        .any(|r| r["message"] == "Request completed: GET /"));
    assert!(second_records
        .iter()
        .any(|r| r["message"] == "Request completed: GET /healthz"));
}

#[tokio::test]
async fn test_connection_string_credentials_never_logged() {
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let persistence = PersistenceConfig::new("postgres://todo:hunter2@db:5432/todos");
    tracing::info!(database_url = %persistence.connection_string, "Connecting to postgres://todo:hunter2@db:5432/todos");
    tracing::info!(config = ?persistence, "Loaded persistence settings");

    let mut attrs = Map::new();
    attrs.insert("password".into(), json!("hunter2"));
    attrs.insert("dsn".into(), json!("postgresql://todo:hunter2@db/todos"));
    emit(Level::WARN, "Retrying connection", attrs);

    let raw = logs.raw();
    assert_eq!(logs.records().len(), 3);
    assert!(!raw.contains("hunter2"), "leaked credentials: {raw}");
    assert!(raw.contains("db:5432"));
}

#[tokio::test]
async fn test_metrics_count_matched_and_unmatched_routes() {
    let app = TestApp::new().unwrap();
    let router = app.router();

    send(&router, get("/healthz")).await;
    let missing = send(&router, get("/no/such/page")).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["request_id"], missing.request_id().as_str());

    let metrics = app.telemetry.metrics();
    assert_eq!(metrics.http_sample_count("GET", "/healthz", 200), 1);
    assert_eq!(metrics.http_sample_count("GET", "unmatched", 404), 1);

    let scrape = send(&router, get("/metrics")).await;
    assert_eq!(scrape.status, StatusCode::OK);
    assert!(scrape
        .header("content-type")
        .unwrap()
        .starts_with("text/plain"));
    let text = scrape.text();
    assert!(text.contains("http_request_duration_seconds_bucket"));
    assert!(text.contains("route=\"/healthz\""));
    assert!(text.contains("app_info"));
}

#[tokio::test]
async fn test_background_health_reports_broker_state() {
    let healthy = TestApp::new().unwrap();
    let ok = send(&healthy.router(), get("/healthz/background")).await;
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.json(), json!({"broker": "ok"}));

    let broken = TestApp::builder()
        .with_broker(Arc::new(FlakyBroker::unreachable()))
        .build()
        .unwrap();
    let down = send(&broken.router(), get("/healthz/background")).await;
    assert_eq!(down.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(down.json()["broker"], "unreachable");
}

#[tokio::test]
async fn test_add_and_delete_todos_redirect_home() {
    let app = TestApp::new().unwrap();
    let router = app.router();
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let added = send(&router, post_form("/add", "task=buy+milk")).await;
    assert_eq!(added.status, StatusCode::SEE_OTHER);
    assert_eq!(added.header("location").as_deref(), Some("/"));

    let blank = send(&router, post_form("/add", "task=+++")).await;
    assert_eq!(blank.status, StatusCode::SEE_OTHER);
    let warnings = logs.with_message("Ignoring empty task submission");
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0]["level"], "WARN");
    assert_eq!(warnings[0]["request_id"], blank.request_id().as_str());

    let listing = send(&router, get("/")).await.json();
    assert_eq!(listing.as_array().unwrap().len(), 1);
    assert_eq!(listing[0]["text"], "buy milk");

    send(&router, post_empty("/delete/7")).await;
    assert_eq!(logs.with_message("missing todo index").len(), 1);

    let deleted = send(&router, post_empty("/delete/0")).await;
    assert_eq!(deleted.status, StatusCode::SEE_OTHER);
    assert_eq!(app.backend.todos.count().await.unwrap(), 0);

    let bad_index = send(&router, post_empty("/delete/first")).await;
    assert_eq!(bad_index.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_extractor_rejections_answer_json_with_request_id() {
    let app = TestApp::new().unwrap();
    let router = app.router();

    let wrong_type = send(&router, post_json("/add", json!({"task": "buy milk"}))).await;
    assert_eq!(wrong_type.status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let body = wrong_type.json();
    assert_eq!(body["request_id"], wrong_type.request_id().as_str());
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert_eq!(app.backend.todos.count().await.unwrap(), 0);

    let bad_path = send(&router, get("/tasks/%FF")).await;
    assert_eq!(bad_path.status, StatusCode::BAD_REQUEST);
    let body = bad_path.json();
    assert_eq!(body["request_id"], bad_path.request_id().as_str());
    assert!(!body["error"].as_str().unwrap().is_empty());
}

struct ExplodingTodos;

#[async_trait]
impl TodoRepository for ExplodingTodos {
    async fn list(&self) -> anyhow::Result<Vec<Todo>> {
        panic!("listing exploded");
    }

    async fn add(&self, _text: &str) -> anyhow::Result<Todo> {
        anyhow::bail!("database is gone")
    }

    async fn delete_at(&self, _index: usize) -> anyhow::Result<Option<Todo>> {
        Ok(None)
    }

    async fn count(&self) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn latest_id(&self) -> anyhow::Result<Option<i64>> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_unexpected_errors_answer_500_with_request_id() {
    let app = TestApp::new().unwrap();
    let mut state = app.state.clone();
    state.todos = Arc::new(ExplodingTodos);
    let router = lantern::http::router(state);
    let logs = CapturedLogs::new();
    let _guard = logs.set_default();

    let panicked = send(&router, get("/")).await;
    assert_eq!(panicked.status, StatusCode::INTERNAL_SERVER_ERROR);
    let body = panicked.json();
    assert_eq!(body["error"], "Internal server error");
    assert_eq!(body["request_id"], panicked.request_id().as_str());
    let panic_logs = logs.with_message("Handler panicked");
    assert_eq!(panic_logs[0]["request_id"], panicked.request_id().as_str());
    assert_eq!(app.telemetry.metrics().http_sample_count("GET", "/", 500), 1);

    let failed = send(&router, post_form("/add", "task=milk")).await;
    assert_eq!(failed.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failed.json()["request_id"], failed.request_id().as_str());
    assert!(!failed.text().contains("database is gone"));
}
