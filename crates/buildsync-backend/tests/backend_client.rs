//! ---
//! bs_section: "15-testing-qa-runbook"
//! bs_subsection: "integration-tests"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Backend client behaviour against an in-process stub backend."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use buildsync_backend::{AuthConfig, BackendClient, BackendError, BuildRef, BuildState};
use buildsync_metrics::prometheus::Registry;
use buildsync_metrics::ClientMetrics;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;

#[derive(Default)]
struct StubBackend {
    flaky_failures: AtomicUsize,
    auth_headers: Mutex<Vec<String>>,
}

async fn last_build(
    State(stub): State<Arc<StubBackend>>,
    Path(job): Path<String>,
    headers: HeaderMap,
) -> axum::response::Response {
    if let Some(value) = headers.get("authorization") {
        stub.auth_headers
            .lock()
            .push(value.to_str().unwrap_or_default().to_owned());
    }
    match job.as_str() {
        "pull-unit" => Json(json!({
            "number": 42,
            "building": false,
            "result": "SUCCESS",
            "url": "http://backend/job/pull-unit/42/",
            "actions": [{"parameters": [{"name": "PULL_PULL_SHA", "value": "deadbeef"}]}]
        }))
        .into_response(),
        "flaky" => {
            if stub.flaky_failures.fetch_add(1, Ordering::SeqCst) < 2 {
                StatusCode::SERVICE_UNAVAILABLE.into_response()
            } else {
                Json(json!({"number": 1, "building": true})).into_response()
            }
        }
        "broken" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn console(Path((job, number)): Path<(String, u64)>) -> axum::response::Response {
    if job == "pull-unit" && number == 42 {
        "line one\nline two\n".into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn spawn_backend() -> (String, Arc<StubBackend>) {
    let stub = Arc::new(StubBackend::default());
    let app = Router::new()
        .route("/job/:job/lastBuild/api/json", get(last_build))
        .route("/job/:job/:number/consoleText", get(console))
        .with_state(stub.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), stub)
}

fn client_metrics() -> ClientMetrics {
    ClientMetrics::new(&Registry::new()).unwrap()
}

fn client(base: &str, metrics: ClientMetrics) -> BackendClient {
    BackendClient::new(
        base,
        AuthConfig::Basic {
            user: "trigger".into(),
            token: "secret".into(),
        },
        None,
        metrics,
    )
    .unwrap()
    .with_retry(3, Duration::from_millis(1))
}

#[tokio::test]
async fn latest_build_is_decoded_and_authenticated() {
    let (base, stub) = spawn_backend().await;
    let backend = client(&base, client_metrics());

    let build = backend.latest_build("pull-unit").await.unwrap().unwrap();
    assert_eq!(build.number, 42);
    assert_eq!(build.state(), BuildState::Success);
    assert_eq!(build.parameter("PULL_PULL_SHA").as_deref(), Some("deadbeef"));

    let headers = stub.auth_headers.lock();
    assert_eq!(headers.len(), 1);
    assert!(headers[0].starts_with("Basic "));
}

#[tokio::test]
async fn unknown_job_has_no_latest_build() {
    let (base, _) = spawn_backend().await;
    let backend = client(&base, client_metrics());
    assert!(backend.latest_build("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn server_errors_are_retried_and_counted() {
    let (base, _) = spawn_backend().await;
    let metrics = client_metrics();
    let backend = client(&base, metrics.clone());

    let build = backend.latest_build("flaky").await.unwrap().unwrap();
    assert_eq!(build.state(), BuildState::Running);
    assert_eq!(metrics.request_count("GET", "lastBuild", "503"), 2);
    assert_eq!(metrics.request_count("GET", "lastBuild", "200"), 1);

    let err = backend.latest_build("broken").await.unwrap_err();
    assert!(matches!(err, BackendError::Status { .. }));
    assert_eq!(metrics.request_count("GET", "lastBuild", "500"), 3);
}

#[tokio::test]
async fn console_log_is_streamed() {
    let (base, _) = spawn_backend().await;
    let backend = client(&base, client_metrics());

    let mut stream = backend
        .get_log(&BuildRef::new("pull-unit", 42))
        .await
        .unwrap();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        body.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(body, b"line one\nline two\n");

    let missing = backend.get_log(&BuildRef::new("pull-unit", 1)).await;
    assert!(matches!(missing, Err(err) if err.is_not_found()));
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let backend = client(&format!("http://{addr}"), client_metrics());
    let err = backend.latest_build("pull-unit").await.unwrap_err();
    assert!(matches!(err, BackendError::Transport { .. }));
}
