//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Immutable process settings assembled from command line flags."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::StartupError;

/// Address the log and metrics server binds to unless overridden.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Cadence shared by the reconcile and metrics loops.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_secs(30);

/// Process-wide settings. Built once at startup and passed explicitly to every
/// component; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub config_path: PathBuf,
    pub label_selector: String,
    pub backend_url: String,
    pub backend_user: String,
    pub backend_token_file: Option<PathBuf>,
    pub backend_bearer_token_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_cert_file: Option<PathBuf>,
    pub review_endpoint: String,
    pub review_token_file: PathBuf,
    pub dry_run: bool,
    pub listen: SocketAddr,
    pub sync_interval: Duration,
    pub metrics_interval: Duration,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("/etc/config/config.toml"),
            label_selector: String::new(),
            backend_url: "http://jenkins-proxy".to_owned(),
            backend_user: "jenkins-trigger".to_owned(),
            backend_token_file: None,
            backend_bearer_token_file: None,
            cert_file: None,
            key_file: None,
            ca_cert_file: None,
            review_endpoint: "https://api.github.com".to_owned(),
            review_token_file: PathBuf::from("/etc/github/oauth"),
            dry_run: true,
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            sync_interval: DEFAULT_LOOP_INTERVAL,
            metrics_interval: DEFAULT_LOOP_INTERVAL,
        }
    }
}

impl OperatorSettings {
    /// Client certificate material is only used when both halves are present.
    pub fn client_cert_pair(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.cert_file, &self.key_file) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

/// Read a credential file, trimming surrounding whitespace.
pub fn load_token(path: &Path) -> Result<String, StartupError> {
    let raw = fs::read_to_string(path).map_err(|err| StartupError::credential(path, err))?;
    Ok(raw.trim().to_owned())
}
