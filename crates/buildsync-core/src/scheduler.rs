//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Runs the reconcile, metrics, serving, and push loops until shutdown."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use buildsync_api::LogServer;
use buildsync_common::DEFAULT_LOOP_INTERVAL;
use buildsync_metrics::PushGateway;
use buildsync_rt::{ControlLoop, DurationObserver, LoopSummary, Reconciler, ShutdownListener};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Owns everything needed to start the operator's loops. Consumed by [`Scheduler::start`].
pub struct Scheduler {
    reconciler: Arc<dyn Reconciler>,
    server: LogServer,
    sync_interval: Duration,
    metrics_interval: Duration,
    resync_observer: Option<Arc<dyn DurationObserver>>,
    push: Option<(PushGateway, Duration)>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("listen", &self.server.local_addr())
            .field("sync_interval", &self.sync_interval)
            .field("metrics_interval", &self.metrics_interval)
            .field("push", &self.push.as_ref().map(|(gateway, _)| gateway.url().as_str()))
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(reconciler: Arc<dyn Reconciler>, server: LogServer) -> Self {
        Self {
            reconciler,
            server,
            sync_interval: DEFAULT_LOOP_INTERVAL,
            metrics_interval: DEFAULT_LOOP_INTERVAL,
            resync_observer: None,
            push: None,
        }
    }

    pub fn with_intervals(mut self, sync: Duration, metrics: Duration) -> Self {
        self.sync_interval = sync;
        self.metrics_interval = metrics;
        self
    }

    /// Where reconcile pass durations are recorded.
    pub fn with_resync_observer(mut self, observer: Arc<dyn DurationObserver>) -> Self {
        self.resync_observer = Some(observer);
        self
    }

    /// Also push metrics to `gateway` every `interval`.
    pub fn with_push_gateway(mut self, gateway: PushGateway, interval: Duration) -> Self {
        self.push = Some((gateway, interval));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Spawn every loop. Each loop gets its own listener on the shared shutdown signal.
    pub fn start(self, shutdown: ShutdownListener) -> SchedulerHandle {
        let addr = self.server.local_addr();

        let mut reconcile = ControlLoop::new("reconcile", self.sync_interval);
        if let Some(observer) = self.resync_observer {
            reconcile = reconcile.with_observer(observer);
        }
        let reconciler = self.reconciler.clone();
        let reconcile = reconcile.spawn(shutdown.clone(), move || {
            let reconciler = reconciler.clone();
            async move { reconciler.sync().await }
        });

        let reconciler = self.reconciler;
        let metrics = ControlLoop::new("metrics", self.metrics_interval)
            .quiet()
            .spawn(shutdown.clone(), move || {
                let reconciler = reconciler.clone();
                async move {
                    reconciler.sync_metrics().await;
                    Ok::<(), Infallible>(())
                }
            });

        let push = self.push.map(|(gateway, interval)| {
            ControlLoop::new("push-gateway", interval)
                .quiet()
                .spawn(shutdown.clone(), move || {
                    let gateway = gateway.clone();
                    async move { gateway.push().await }
                })
        });

        let server = self.server.serve(shutdown.clone().cancelled());
        info!(listen = %addr, push = push.is_some(), "scheduler started");

        SchedulerHandle {
            addr,
            shutdown,
            reconcile,
            metrics,
            push,
            server,
        }
    }
}

/// Per-loop counters gathered after a clean shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub reconcile: LoopSummary,
    pub metrics: LoopSummary,
    pub push: Option<LoopSummary>,
}

/// Handle to the running loops.
#[derive(Debug)]
pub struct SchedulerHandle {
    addr: SocketAddr,
    shutdown: ShutdownListener,
    reconcile: JoinHandle<LoopSummary>,
    metrics: JoinHandle<LoopSummary>,
    push: Option<JoinHandle<LoopSummary>>,
    server: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for shutdown and for every loop to finish its in-flight iteration.
    ///
    /// Returns an error without waiting for shutdown if the serving loop stops
    /// first; the operator cannot run without it.
    pub async fn wait(self) -> Result<SchedulerReport> {
        let Self {
            addr,
            mut shutdown,
            reconcile,
            metrics,
            push,
            mut server,
        } = self;

        tokio::select! {
            biased;
            _ = shutdown.wait() => {}
            exit = &mut server => {
                let err = match exit {
                    Ok(Ok(())) => anyhow!("log server on {addr} stopped unexpectedly"),
                    Ok(Err(err)) => err,
                    Err(join) => anyhow!(join).context(format!("log server on {addr} panicked")),
                };
                error!(listen = %addr, error = %format!("{err:#}"), "serving loop failed; operator cannot continue");
                return Err(err);
            }
        }

        info!("shutdown requested; waiting for loops to finish");
        let report = SchedulerReport {
            reconcile: join_loop("reconcile", reconcile).await?,
            metrics: join_loop("metrics", metrics).await?,
            push: match push {
                Some(handle) => Some(join_loop("push-gateway", handle).await?),
                None => None,
            },
        };
        server
            .await
            .with_context(|| format!("log server on {addr} panicked"))??;
        info!(
            reconcile_iterations = report.reconcile.iterations,
            reconcile_failures = report.reconcile.failures,
            metrics_iterations = report.metrics.iterations,
            "scheduler stopped"
        );
        Ok(report)
    }
}

async fn join_loop(name: &'static str, handle: JoinHandle<LoopSummary>) -> Result<LoopSummary> {
    handle
        .await
        .with_context(|| format!("{name} loop panicked"))
}
