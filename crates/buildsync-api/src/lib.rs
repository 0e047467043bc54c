//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Log serving and metrics scrape HTTP surface."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---

use std::fmt;
use std::future::Future;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use buildsync_backend::{BuildRef, LogSource};
use buildsync_common::StartupError;
use buildsync_metrics::{render_metrics, SharedRegistry};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

/// Shared state handed to the HTTP handlers.
#[derive(Clone)]
pub struct LogServerState {
    logs: Arc<dyn LogSource>,
    registry: SharedRegistry,
}

impl LogServerState {
    pub fn new(logs: Arc<dyn LogSource>, registry: SharedRegistry) -> Self {
        Self { logs, registry }
    }
}

impl fmt::Debug for LogServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogServerState").finish_non_exhaustive()
    }
}

/// `/metrics` serves the registry; every other path is treated as a log request.
///
/// Request spans are children of the span current when the router is built;
/// connection tasks do not inherit it.
pub fn router(state: LogServerState) -> Router {
    let parent = Span::current();
    Router::new()
        .route("/metrics", get(get_metrics))
        .fallback(get_log)
        .with_state(state)
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http().make_span_with(move |request: &Request<Body>| {
                info_span!(
                    parent: &parent,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
}

/// Listener bound at startup and not yet serving.
#[derive(Debug)]
pub struct LogServer {
    addr: SocketAddr,
    listener: TcpListener,
    router: Router,
}

impl LogServer {
    /// Bind the serving socket. Must be called inside a tokio runtime.
    pub fn bind(addr: SocketAddr, router: Router) -> Result<Self, StartupError> {
        let bind_err = |source| StartupError::Bind { addr, source };
        let listener = StdTcpListener::bind(addr).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;
        let addr = listener.local_addr().map_err(bind_err)?;
        let listener = TcpListener::from_std(listener).map_err(bind_err)?;
        Ok(Self {
            addr,
            listener,
            router,
        })
    }

    /// Address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub fn serve<S>(self, shutdown: S) -> JoinHandle<Result<()>>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let Self {
            addr,
            listener,
            router,
        } = self;
        tokio::spawn(async move {
            info!(address = %addr, "log server listening");
            if let Err(err) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(address = %addr, error = %err, "log server exited with error");
                return Err(err).with_context(|| format!("log server on {addr} failed"));
            }
            info!(address = %addr, "log server stopped");
            Ok(())
        }
        .in_current_span())
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, message: &'static str) -> Self {
        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn get_metrics(State(state): State<LogServerState>) -> Response {
    render_metrics(&state.registry)
}

async fn get_log(
    State(state): State<LogServerState>,
    method: Method,
    uri: Uri,
) -> Result<Response, ApiError> {
    if method != Method::GET {
        return Err(ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed",
        ));
    }
    let build = BuildRef::from_log_path(uri.path())
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, "invalid log path"))?;
    match state.logs.get_log(&build).await {
        Ok(stream) => {
            debug!(build = %build, "streaming console log");
            Ok((
                [
                    (
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; charset=utf-8"),
                    ),
                    (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
                ],
                Body::from_stream(stream),
            )
                .into_response())
        }
        Err(err) if err.is_not_found() => {
            debug!(build = %build, "console log not found");
            Err(ApiError::new(StatusCode::NOT_FOUND, "log not found"))
        }
        Err(err) => {
            warn!(build = %build, error = %err, "failed to fetch console log");
            Err(ApiError::new(StatusCode::BAD_GATEWAY, "failed to fetch log"))
        }
    }
}
