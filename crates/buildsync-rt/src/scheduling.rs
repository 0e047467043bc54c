//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Fixed-interval control loops driven until shutdown."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, Instrument};

use crate::shutdown::ShutdownListener;

/// The reconciliation surface driven by the scheduler.
///
/// Implementations must tolerate `sync` and `sync_metrics` running concurrently.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive tracked job state toward backend truth.
    async fn sync(&self) -> anyhow::Result<()>;

    /// Recompute and publish gauges for the tracked jobs.
    async fn sync_metrics(&self);
}

/// Sink for per-iteration wall-clock durations.
pub trait DurationObserver: Send + Sync {
    fn observe(&self, elapsed: Duration);
}

impl DurationObserver for prometheus::Histogram {
    fn observe(&self, elapsed: Duration) {
        prometheus::Histogram::observe(self, elapsed.as_secs_f64());
    }
}

/// Counters reported by a loop once it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopSummary {
    pub iterations: u64,
    pub failures: u64,
}

/// Runs a callback every `period` until shutdown is observed.
///
/// * The first iteration starts one full period after the loop starts.
/// * Iterations of one loop never overlap; a slow iteration delays the next tick.
/// * A failed iteration is logged and counted; the loop keeps going.
/// * Shutdown is checked at every tick boundary and wins a tie with a tick.
///   An iteration already running is allowed to finish.
pub struct ControlLoop {
    name: &'static str,
    period: Duration,
    observer: Option<Arc<dyn DurationObserver>>,
    quiet: bool,
}

impl std::fmt::Debug for ControlLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLoop")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}

impl ControlLoop {
    pub fn new(name: &'static str, period: Duration) -> Self {
        assert!(!period.is_zero(), "control loop period must be non-zero");
        Self {
            name,
            period,
            observer: None,
            quiet: false,
        }
    }

    /// Record every iteration's duration on `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn DurationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Log completed iterations at debug rather than info level.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn spawn<F, Fut, E>(self, shutdown: ShutdownListener, tick: F) -> JoinHandle<LoopSummary>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        tokio::spawn(self.run(shutdown, tick).in_current_span())
    }

    pub async fn run<F, Fut, E>(self, mut shutdown: ShutdownListener, mut tick: F) -> LoopSummary
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut summary = LoopSummary::default();
        debug!(control_loop = self.name, period = ?self.period, "control loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            if shutdown.is_triggered() {
                break;
            }

            let started = Instant::now();
            let outcome = tick().await;
            let elapsed = started.elapsed();
            summary.iterations += 1;

            if let Err(err) = outcome {
                summary.failures += 1;
                error!(control_loop = self.name, error = %format!("{err:#}"), "control loop iteration failed");
            }
            if self.quiet {
                debug!(control_loop = self.name, duration = ?elapsed, "control loop iteration finished");
            } else {
                info!(control_loop = self.name, duration = ?elapsed, "control loop iteration finished");
            }
            if let Some(observer) = &self.observer {
                observer.observe(elapsed);
            }
        }

        debug!(
            control_loop = self.name,
            iterations = summary.iterations,
            failures = summary.failures,
            "control loop stopped"
        );
        summary
    }
}
