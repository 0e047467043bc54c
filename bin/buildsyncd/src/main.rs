//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "binary"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Binary entrypoint for the buildsync operator daemon."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use buildsync_common::logging::init_tracing;
use buildsync_common::{ConfigAgent, LoggingConfig, OperatorSettings, StartupError, DEFAULT_LISTEN};
use buildsync_core::{bootstrap, OPERATOR_NAME};
use buildsync_rt::{spawn_signal_listener, ShutdownSignal};
use clap::{ArgAction, Parser};
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[command(
    author,
    version = concat!("buildsync ", env!("CARGO_PKG_VERSION")),
    about = "Synchronises build backend jobs with source-control statuses",
    long_about = None
)]
struct Cli {
    #[arg(long, env = "BUILDSYNC_CONFIG_PATH", value_name = "FILE", default_value = "/etc/config/config.toml", help = "Path to the operator configuration file")]
    config_path: PathBuf,

    #[arg(long, env = "BUILDSYNC_LABEL_SELECTOR", default_value = "", help = "Label selector limiting which jobs are reconciled")]
    label_selector: String,

    #[arg(long, env = "BUILDSYNC_BACKEND_URL", default_value = "http://jenkins-proxy", help = "Build backend base URL")]
    backend_url: String,

    #[arg(long, env = "BUILDSYNC_BACKEND_USER", default_value = "jenkins-trigger", help = "User for basic auth against the backend")]
    backend_user: String,

    #[arg(long, env = "BUILDSYNC_BACKEND_TOKEN_FILE", value_name = "FILE", help = "Token file for basic auth against the backend")]
    backend_token_file: Option<PathBuf>,

    #[arg(long, env = "BUILDSYNC_BACKEND_BEARER_TOKEN_FILE", value_name = "FILE", help = "Token file for bearer auth against the backend")]
    backend_bearer_token_file: Option<PathBuf>,

    #[arg(long, env = "BUILDSYNC_CERT_FILE", value_name = "FILE", help = "Client certificate for mutual TLS")]
    cert_file: Option<PathBuf>,

    #[arg(long, env = "BUILDSYNC_KEY_FILE", value_name = "FILE", help = "Client key for mutual TLS")]
    key_file: Option<PathBuf>,

    #[arg(long, env = "BUILDSYNC_CA_CERT_FILE", value_name = "FILE", help = "CA bundle used to verify the backend")]
    ca_cert_file: Option<PathBuf>,

    #[arg(long, env = "BUILDSYNC_REVIEW_ENDPOINT", default_value = "https://api.github.com", help = "Source-control API endpoint")]
    review_endpoint: String,

    #[arg(long, env = "BUILDSYNC_REVIEW_TOKEN_FILE", value_name = "FILE", default_value = "/etc/github/oauth", help = "OAuth token file for the source-control API")]
    review_token_file: PathBuf,

    #[arg(long, env = "BUILDSYNC_DRY_RUN", default_value_t = true, action = ArgAction::Set, help = "Log source-control mutations instead of sending them")]
    dry_run: bool,

    #[arg(long, env = "BUILDSYNC_LISTEN", default_value = DEFAULT_LISTEN, help = "Address for the log and metrics server")]
    listen: SocketAddr,
}

impl Cli {
    fn into_settings(self) -> OperatorSettings {
        OperatorSettings {
            config_path: self.config_path,
            label_selector: self.label_selector,
            backend_url: self.backend_url,
            backend_user: self.backend_user,
            backend_token_file: self.backend_token_file,
            backend_bearer_token_file: self.backend_bearer_token_file,
            cert_file: self.cert_file,
            key_file: self.key_file,
            ca_cert_file: self.ca_cert_file,
            review_endpoint: self.review_endpoint,
            review_token_file: self.review_token_file,
            dry_run: self.dry_run,
            listen: self.listen,
            ..OperatorSettings::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Cli::parse().into_settings();

    let config = match load_config(&settings) {
        Ok(config) => config,
        Err(err) => {
            init_tracing(OPERATOR_NAME, &LoggingConfig::default())?;
            return Err(log_startup_failure(err).into());
        }
    };
    init_tracing(OPERATOR_NAME, &config.config().logging)?;

    run(settings, config)
        .instrument(info_span!("operator", component = OPERATOR_NAME))
        .await
}

fn load_config(settings: &OperatorSettings) -> Result<ConfigAgent, StartupError> {
    ConfigAgent::start(settings.config_path.clone()).map_err(StartupError::Config)
}

/// For failures raised before the operator span exists.
fn log_startup_failure(err: StartupError) -> StartupError {
    error!(component = OPERATOR_NAME, error = %err, "startup failed");
    err
}

async fn run(settings: OperatorSettings, config: ConfigAgent) -> Result<()> {
    let signal = ShutdownSignal::new();
    let _signals =
        spawn_signal_listener(signal.clone()).context("failed to register signal handlers")?;

    let operator = bootstrap(&settings, config).map_err(|err| {
        error!(error = %err, "startup failed");
        err
    })?;

    let report = operator.run(&signal).await.map_err(|err| {
        error!(error = %format!("{err:#}"), "operator stopped with a fatal error");
        err
    })?;
    info!(
        reconcile_iterations = report.reconcile.iterations,
        reconcile_failures = report.reconcile.failures,
        "operator exited cleanly"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults_match_settings() {
        let settings = Cli::parse_from(["buildsyncd"]).into_settings();
        let defaults = OperatorSettings::default();
        assert_eq!(settings.listen, defaults.listen);
        assert_eq!(settings.backend_url, defaults.backend_url);
        assert_eq!(settings.config_path, defaults.config_path);
        assert!(settings.dry_run);
    }

    #[test]
    fn dry_run_can_be_disabled() {
        let settings = Cli::parse_from([
            "buildsyncd",
            "--dry-run=false",
            "--backend-bearer-token-file",
            "/etc/backend/token",
            "--label-selector",
            "tier=presubmit",
        ])
        .into_settings();
        assert!(!settings.dry_run);
        assert_eq!(
            settings.backend_bearer_token_file,
            Some(PathBuf::from("/etc/backend/token"))
        );
        assert_eq!(settings.label_selector, "tier=presubmit");
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
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

    #[test]
    fn config_failure_is_a_structured_error_line() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(captured.clone())
            .finish();
        let settings = Cli::parse_from([
            "buildsyncd",
            "--config-path",
            "/nonexistent/buildsync/config.toml",
        ])
        .into_settings();

        let err = tracing::subscriber::with_default(subscriber, || {
            log_startup_failure(load_config(&settings).unwrap_err())
        });
        assert!(matches!(err, StartupError::Config(_)), "{err}");

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line: serde_json::Value =
            serde_json::from_str(output.lines().last().unwrap()).unwrap();
        assert_eq!(line["level"], "ERROR");
        assert_eq!(line["fields"]["component"], OPERATOR_NAME);
        assert_eq!(line["fields"]["message"], "startup failed");
        let error = line["fields"]["error"].as_str().unwrap();
        assert!(error.starts_with("error starting config agent"), "{error}");
    }
}
