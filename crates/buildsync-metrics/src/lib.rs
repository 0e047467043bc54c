//! ---
//! bs_section: "03-persistence-logging"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Metrics collection and export utilities."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use prometheus::{
    GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tracing::error;

pub mod push;

pub use push::PushGateway;

/// Shared registry type used across the operator.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Encode every family in `registry` in the text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .context("failed to encode metrics")
}

/// Prometheus scrape response. Has no side effects beyond gathering.
pub fn render_metrics(registry: &Registry) -> Response {
    match encode_text(registry) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Metrics recorded by the operator process itself.
#[derive(Clone, Debug)]
pub struct OperatorMetrics {
    starts_total: IntCounter,
    resync_period_seconds: Histogram,
    build_info: GaugeVec,
}

impl OperatorMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let starts_total = IntCounter::with_opts(Opts::new(
            "buildsync_starts_total",
            "Total number of times the operator has initialised",
        ))?;
        registry.register(Box::new(starts_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.5, 2.0, 10)
            .context("failed to construct histogram buckets")?;
        let resync_period_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "buildsync_resync_period_seconds",
                "Time the reconciliation pass takes to complete",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(resync_period_seconds.clone()))?;

        let build_info = GaugeVec::new(
            Opts::new(
                "buildsync_build_info",
                "Build metadata for the running operator binary",
            ),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            starts_total,
            resync_period_seconds,
            build_info,
        })
    }

    pub fn inc_start(&self) {
        self.starts_total.inc();
    }

    /// Histogram observed once per reconciliation pass, success or failure.
    pub fn resync_period(&self) -> Histogram {
        self.resync_period_seconds.clone()
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1.0);
    }
}

/// Request metrics for the build backend client.
#[derive(Clone, Debug)]
pub struct ClientMetrics {
    requests: IntCounterVec,
    request_latency: HistogramVec,
}

impl ClientMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new(
                "buildsync_backend_requests_total",
                "Number of requests made to the build backend",
            ),
            &["verb", "handler", "code"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let request_latency = HistogramVec::new(
            HistogramOpts::new(
                "buildsync_backend_request_latency_seconds",
                "Time for a request to the build backend to complete",
            )
            .buckets(vec![0.05, 0.1, 0.2, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["verb", "handler"],
        )?;
        registry.register(Box::new(request_latency.clone()))?;

        Ok(Self {
            requests,
            request_latency,
        })
    }

    /// `code` is the HTTP status, or `"error"` when no response arrived.
    pub fn record(&self, verb: &str, handler: &str, code: &str, elapsed: Duration) {
        self.requests
            .with_label_values(&[verb, handler, code])
            .inc();
        self.request_latency
            .with_label_values(&[verb, handler])
            .observe(elapsed.as_secs_f64());
    }

    pub fn request_count(&self, verb: &str, handler: &str, code: &str) -> u64 {
        self.requests.with_label_values(&[verb, handler, code]).get()
    }
}

/// Gauges published by the reconciliation controller.
#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    jobs: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let jobs = IntGaugeVec::new(
            Opts::new(
                "buildsync_jobs",
                "Number of tracked jobs by the state of their latest build",
            ),
            &["state"],
        )?;
        registry.register(Box::new(jobs.clone()))?;
        Ok(Self { jobs })
    }

    /// Replace the per-state counts. States absent from `counts` drop to zero.
    pub fn set_job_counts<'a>(&self, counts: impl IntoIterator<Item = (&'a str, i64)>) {
        self.jobs.reset();
        for (state, count) in counts {
            self.jobs.with_label_values(&[state]).set(count);
        }
    }

    pub fn job_count(&self, state: &str) -> i64 {
        self.jobs.with_label_values(&[state]).get()
    }
}

pub use prometheus;
