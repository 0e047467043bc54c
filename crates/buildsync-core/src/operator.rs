//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Startup wiring: credentials, clients, controller, and server."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::Result;
use buildsync_api::{router, LogServer, LogServerState};
use buildsync_backend::{AuthConfig, BackendClient, TlsMaterial};
use buildsync_common::{ConfigAgent, LabelSelector, OperatorSettings, StartupError};
use buildsync_controller::BuildController;
use buildsync_metrics::{
    new_registry, ClientMetrics, ControllerMetrics, OperatorMetrics, PushGateway, SharedRegistry,
};
use buildsync_review::ReviewClient;
use buildsync_rt::ShutdownSignal;
use tracing::{debug, info, warn};

use crate::scheduler::{Scheduler, SchedulerReport};

/// Name used for the push-gateway job label and the tracing service field.
pub const OPERATOR_NAME: &str = "buildsyncd";

/// A fully wired operator whose loops have not started yet.
#[derive(Debug)]
pub struct Operator {
    config: ConfigAgent,
    scheduler: Scheduler,
}

/// Build every component from `settings`. Nothing is started.
///
/// Steps run in a fixed order so that cheap validation fails before any client
/// exists: selector, backend credentials, TLS material, metrics, backend client,
/// review client, controller, and finally the serving socket. Must be called
/// inside a tokio runtime.
pub fn bootstrap(settings: &OperatorSettings, config: ConfigAgent) -> Result<Operator, StartupError> {
    let selector = LabelSelector::parse(&settings.label_selector)?;
    debug!(selector = %selector, "label selector parsed");

    let auth = AuthConfig::from_files(
        &settings.backend_user,
        settings.backend_token_file.as_deref(),
        settings.backend_bearer_token_file.as_deref(),
    )?;
    let tls = settings
        .client_cert_pair()
        .map(|(cert, key)| TlsMaterial::load(cert, key, settings.ca_cert_file.as_deref()))
        .transpose()?;
    if tls.is_none() && (settings.cert_file.is_some() || settings.key_file.is_some()) {
        warn!("only one of --cert-file and --key-file was given; client certificates disabled");
    }

    let registry = new_registry();
    let (metrics, client_metrics, controller_metrics) =
        register_metrics(&registry).map_err(|err| StartupError::Metrics(format!("{err:#}")))?;

    let backend = Arc::new(BackendClient::new(
        &settings.backend_url,
        auth,
        tls,
        client_metrics,
    )?);
    let review = ReviewClient::from_token_file(
        &settings.review_token_file,
        &settings.review_endpoint,
        settings.dry_run,
    )?;
    if review.is_dry_run() {
        info!("dry run enabled; commit statuses will be logged, not created");
    }

    let controller = Arc::new(BuildController::new(
        backend.clone(),
        Arc::new(review),
        config.clone(),
        selector,
        controller_metrics,
    ));

    let push = {
        let snapshot = config.config();
        match snapshot.push_gateway.endpoint() {
            Some(endpoint) => Some((
                PushGateway::new(
                    endpoint,
                    OPERATOR_NAME,
                    &PushGateway::default_instance(),
                    registry.clone(),
                )
                .map_err(|err| StartupError::InvalidEndpoint {
                    flag: "push_gateway.endpoint",
                    reason: format!("{err:#}"),
                })?,
                snapshot.push_gateway.interval,
            )),
            None => None,
        }
    };

    let server = LogServer::bind(
        settings.listen,
        router(LogServerState::new(backend, registry)),
    )?;

    let mut scheduler = Scheduler::new(controller, server)
        .with_intervals(settings.sync_interval, settings.metrics_interval)
        .with_resync_observer(Arc::new(metrics.resync_period()));
    if let Some((gateway, interval)) = push {
        info!(url = %gateway.url(), interval = ?interval, "pushing metrics to gateway");
        scheduler = scheduler.with_push_gateway(gateway, interval);
    }

    metrics.inc_start();
    metrics.set_build_info(env!("CARGO_PKG_VERSION"));

    Ok(Operator { config, scheduler })
}

fn register_metrics(
    registry: &SharedRegistry,
) -> Result<(OperatorMetrics, ClientMetrics, ControllerMetrics)> {
    Ok((
        OperatorMetrics::new(registry)?,
        ClientMetrics::new(registry)?,
        ControllerMetrics::new(registry)?,
    ))
}

impl Operator {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.scheduler.local_addr()
    }

    /// Run every loop until `signal` fires, then wait for them to wind down.
    ///
    /// Also triggers `signal` itself when the serving loop fails so that the
    /// config refresher and signal listener stop with it.
    pub async fn run(self, signal: &ShutdownSignal) -> Result<SchedulerReport> {
        let refresh = self.config.spawn_refresh(signal.listener().cancelled());
        let handle = self.scheduler.start(signal.listener());
        info!(listen = %handle.local_addr(), "operator running");

        let outcome = handle.wait().await;
        signal.trigger();
        if let Err(err) = refresh.await {
            warn!(error = %err, "config refresh task panicked");
        }
        outcome
    }
}
