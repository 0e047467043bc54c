//! ---
//! bs_section: "15-testing-qa-runbook"
//! bs_subsection: "integration-tests"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Log server routing, error mapping, and compression."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use buildsync_api::{router, LogServer, LogServerState};
use buildsync_backend::{BackendError, BuildRef, LogSource, LogStream};
use buildsync_common::StartupError;
use buildsync_metrics::{new_registry, OperatorMetrics};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_ENCODING};
use reqwest::StatusCode;
use tokio::sync::oneshot;

const LOG_LINE: &str = "+ cargo test --workspace --all-features\n";

struct FakeLogs;

#[async_trait]
impl LogSource for FakeLogs {
    async fn get_log(&self, build: &BuildRef) -> Result<LogStream, BackendError> {
        match (build.job.as_str(), build.number) {
            ("team/pull-unit", 7) => {
                let chunks = (0..50).map(|_| Ok(Bytes::from_static(LOG_LINE.as_bytes())));
                Ok(stream::iter(chunks).boxed())
            }
            ("pull-unit", 8) => Err(BackendError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                url: "http://secret-backend.internal/job/pull-unit/8/consoleText".into(),
            }),
            _ => Err(BackendError::NotFound(build.to_string())),
        }
    }
}

struct Running {
    base: String,
    stop: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start() -> Running {
    let registry = new_registry();
    let metrics = OperatorMetrics::new(&registry).unwrap();
    metrics.inc_start();
    let app = router(LogServerState::new(Arc::new(FakeLogs), registry));
    let server = LogServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), app).unwrap();
    let base = format!("http://{}", server.local_addr());
    let (stop, stopped) = oneshot::channel::<()>();
    let server = server.serve(async move {
        let _ = stopped.await;
    });
    Running { base, stop, server }
}

#[tokio::test]
async fn streams_log_with_cache_header() {
    let running = start().await;
    let response = reqwest::get(format!(
        "{}/job/team/job/pull-unit/7/consoleText",
        running.base
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CACHE_CONTROL], "no-cache");
    assert!(response.headers().get(CONTENT_ENCODING).is_none());
    assert_eq!(response.text().await.unwrap(), LOG_LINE.repeat(50));
}

#[tokio::test]
async fn compresses_when_gzip_accepted() {
    let running = start().await;
    let response = reqwest::Client::new()
        .get(format!("{}/job/team/job/pull-unit/7/consoleText", running.base))
        .header(ACCEPT_ENCODING, "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
    let body = response.bytes().await.unwrap();
    // gzip magic
    assert_eq!(&body[..2], &[0x1f, 0x8b]);
    assert!(body.len() < LOG_LINE.len() * 50);
}

#[tokio::test]
async fn errors_are_generic() {
    let running = start().await;
    let client = reqwest::Client::new();

    let cases = [
        ("/not/a/log", StatusCode::BAD_REQUEST, "invalid log path"),
        ("/job/pull-unit/1/consoleText", StatusCode::NOT_FOUND, "log not found"),
        ("/job/pull-unit/8/consoleText", StatusCode::BAD_GATEWAY, "failed to fetch log"),
    ];
    for (path, status, message) in cases {
        let response = client
            .get(format!("{}{path}", running.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), status, "{path}");
        let body = response.text().await.unwrap();
        assert_eq!(body, message);
        assert!(!body.contains("secret-backend"));
    }

    let response = client
        .post(format!("{}/job/pull-unit/1/consoleText", running.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn metrics_are_exposed() {
    let running = start().await;
    let body = reqwest::get(format!("{}/metrics", running.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("buildsync_starts_total 1"), "{body}");
}

#[tokio::test]
async fn shutdown_stops_the_server_cleanly() {
    let running = start().await;
    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();
    assert!(reqwest::get(format!("{}/metrics", running.base)).await.is_err());
}

#[tokio::test]
async fn bind_conflict_is_a_startup_error() {
    let running = start().await;
    let taken: SocketAddr = running.base.trim_start_matches("http://").parse().unwrap();
    let app = router(LogServerState::new(Arc::new(FakeLogs), new_registry()));
    let err = LogServer::bind(taken, app).unwrap_err();
    assert!(matches!(err, StartupError::Bind { addr, .. } if addr == taken));
}

#[derive(Clone, Default)]
struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

impl std::io::Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[tokio::test]
async fn request_lines_carry_component_field() {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(captured.clone())
        .finish();
    let _default = tracing::subscriber::set_default(subscriber);

    let server = {
        let _entered = tracing::info_span!("operator", component = "buildsyncd").entered();
        let app = router(LogServerState::new(Arc::new(FakeLogs), new_registry()));
        LogServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), app).unwrap()
    };
    let base = format!("http://{}", server.local_addr());
    let (stop, stopped) = oneshot::channel::<()>();
    let server = server.serve(async move {
        let _ = stopped.await;
    });

    let response = reqwest::get(format!("{base}/job/pull-unit/8/consoleText"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    stop.send(()).unwrap();
    server.await.unwrap().unwrap();

    let output = String::from_utf8(captured.0.lock().clone()).unwrap();
    let failure: serde_json::Value = output
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .find(|line| line["level"] == "WARN")
        .expect("backend failure is logged");
    assert_eq!(failure["spans"][0]["component"], "buildsyncd", "{failure}");
    assert_eq!(failure["span"]["name"], "request");
}
