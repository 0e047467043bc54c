//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Startup error taxonomy."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
use std::path::PathBuf;

use thiserror::Error;

use crate::selector::SelectorError;

/// Errors raised while assembling the operator, before any control loop runs.
///
/// Every variant is fatal: the process reports the diagnostic and exits.
/// Errors raised by a running loop are never expressed with this type.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("error parsing label selector: {0}")]
    InvalidSelector(#[from] SelectorError),
    #[error("error starting config agent: {0:#}")]
    Config(anyhow::Error),
    #[error("could not read credential file {path}: {source}")]
    Credential {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("an auth token for basic or bearer token auth must be supplied")]
    MissingAuth,
    #[error("could not read certificate files: {0}")]
    Certificate(String),
    #[error("must specify a valid {flag} URL: {reason}")]
    InvalidEndpoint { flag: &'static str, reason: String },
    #[error("failed to construct {client} client: {reason}")]
    Client {
        client: &'static str,
        reason: String,
    },
    #[error("failed to bind listener {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register metrics: {0}")]
    Metrics(String),
}

impl StartupError {
    pub fn credential(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Credential {
            path: path.into(),
            source,
        }
    }
}
