//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Operator configuration file and background-refreshing agent."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use url::Url;

use crate::logging::LogFormat;

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_push_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_reload_interval() -> Duration {
    Duration::from_secs(60)
}

/// Operator configuration loaded from the `--config-path` file.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub push_gateway: PushGatewayConfig,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
    #[serde(default = "default_reload_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub reload_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            push_gateway: PushGatewayConfig::default(),
            jobs: Vec::new(),
            reload_interval: default_reload_interval(),
        }
    }
}

impl OperatorConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<OperatorConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(anyhow!("job names must not be empty"));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(anyhow!("job '{}' is declared more than once", job.name));
            }
            if let Some(report) = &job.report {
                report
                    .split_repo()
                    .with_context(|| format!("job '{}' has an invalid report target", job.name))?;
            }
        }
        self.push_gateway.validate()?;
        if self.reload_interval.is_zero() {
            return Err(anyhow!("reload_interval must be greater than zero"));
        }
        Ok(())
    }
}

impl std::str::FromStr for OperatorConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: OperatorConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// A backend job tracked by the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub labels: IndexMap<String, String>,
    #[serde(default)]
    pub report: Option<ReportTarget>,
}

/// Where build results for a job are reported on the source-control side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReportTarget {
    /// Repository in `owner/name` form.
    pub repo: String,
    pub context: String,
}

impl ReportTarget {
    pub fn split_repo(&self) -> Result<(&str, &str)> {
        match self.repo.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok((owner, name))
            }
            _ => Err(anyhow!("repo '{}' must be in owner/name form", self.repo)),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushGatewayConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_push_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub interval: Duration,
}

impl Default for PushGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            interval: default_push_interval(),
        }
    }
}

impl PushGatewayConfig {
    /// The configured endpoint, treating blank strings as unset.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(endpoint) = self.endpoint() {
            Url::parse(endpoint)
                .with_context(|| format!("push_gateway endpoint '{endpoint}' is not a valid URL"))?;
            if self.interval.is_zero() {
                return Err(anyhow!("push_gateway interval must be greater than zero"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// Holds the current configuration snapshot and refreshes it from disk.
///
/// Readers always see a complete snapshot. A reload that fails to read or
/// validate keeps the previous snapshot in place.
#[derive(Debug, Clone)]
pub struct ConfigAgent {
    path: PathBuf,
    current: Arc<RwLock<Arc<OperatorConfig>>>,
}

impl ConfigAgent {
    /// Load the configuration once. Failure here is a startup failure.
    pub fn start(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = OperatorConfig::from_path(&path)?;
        info!(config_path = %path.display(), jobs = config.jobs.len(), "configuration loaded");
        Ok(Self {
            path,
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Agent serving a fixed snapshot; `reload` re-reads nothing useful for it.
    pub fn from_config(config: OperatorConfig) -> Self {
        Self {
            path: PathBuf::new(),
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<OperatorConfig> {
        self.current.read().clone()
    }

    /// Re-read the file and swap the snapshot if it changed.
    /// Returns whether a new snapshot was installed.
    pub fn reload(&self) -> Result<bool> {
        let next = OperatorConfig::from_path(&self.path)?;
        let mut current = self.current.write();
        if serde_snapshot(&next) == serde_snapshot(&current) {
            return Ok(false);
        }
        *current = Arc::new(next);
        Ok(true)
    }

    /// Refresh in the background on the configured reload interval until `stop` resolves.
    pub fn spawn_refresh<S>(&self, stop: S) -> JoinHandle<()>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        let agent = self.clone();
        let period = agent.config().reload_interval;
        tokio::spawn(async move {
            tokio::pin!(stop);
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop => {
                        debug!("config agent shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reloading = agent.clone();
                        let outcome = tokio::task::spawn_blocking(move || reloading.reload())
                            .await
                            .unwrap_or_else(|err| Err(anyhow!("config reload task failed: {err}")));
                        match outcome {
                            Ok(true) => info!(config_path = %agent.path.display(), "configuration reloaded"),
                            Ok(false) => {}
                            Err(err) => warn!(config_path = %agent.path.display(), error = %format!("{err:#}"), "configuration reload failed; keeping previous snapshot"),
                        }
                    }
                }
            }
        }
        .in_current_span())
    }
}

fn serde_snapshot(config: &OperatorConfig) -> Option<String> {
    toml::to_string(config).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
reload_interval = 5

[push_gateway]
endpoint = "http://pushgateway:9091"
interval = 15

[[jobs]]
name = "pull-unit"
labels = { team = "infra" }
report = { repo = "acme/widgets", context = "ci/unit" }

[[jobs]]
name = "periodic-e2e"
"#;

    #[test]
    fn parses_sample_configuration() {
        let config: OperatorConfig = SAMPLE.parse().unwrap();
        assert_eq!(config.jobs.len(), 2);
        assert_eq!(config.reload_interval, Duration::from_secs(5));
        assert_eq!(config.push_gateway.endpoint(), Some("http://pushgateway:9091"));
        assert_eq!(config.push_gateway.interval, Duration::from_secs(15));
        let job = config.job("pull-unit").unwrap();
        assert_eq!(job.labels.get("team").map(String::as_str), Some("infra"));
        assert_eq!(job.report.as_ref().unwrap().split_repo().unwrap(), ("acme", "widgets"));
        assert!(config.job("periodic-e2e").unwrap().report.is_none());
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: OperatorConfig = "".parse().unwrap();
        assert!(config.jobs.is_empty());
        assert!(config.push_gateway.endpoint().is_none());
    }

    #[test]
    fn rejects_duplicate_and_malformed_jobs() {
        let dup = "[[jobs]]\nname = \"a\"\n[[jobs]]\nname = \"a\"\n";
        assert!(dup.parse::<OperatorConfig>().is_err());

        let bad_repo = "[[jobs]]\nname = \"a\"\nreport = { repo = \"widgets\", context = \"ci\" }\n";
        assert!(bad_repo.parse::<OperatorConfig>().is_err());

        let bad_push = "[push_gateway]\nendpoint = \"not a url\"\n";
        assert!(bad_push.parse::<OperatorConfig>().is_err());
    }

    #[test]
    fn blank_push_endpoint_is_disabled() {
        let config: OperatorConfig = "[push_gateway]\nendpoint = \"  \"\ninterval = 0\n"
            .parse()
            .unwrap();
        assert!(config.push_gateway.endpoint().is_none());
    }
}
