//! ---
//! bs_section: "05-networking-external-interfaces"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Build backend client surface."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
//! Client for the build execution backend. The backend is polling-only: the
//! operator asks for the latest build of each job and fetches console logs on
//! demand for the log server.

use async_trait::async_trait;

pub mod auth;
pub mod client;
pub mod model;
pub mod tls;

pub use auth::AuthConfig;
pub use client::{BackendClient, BackendError, LogStream};
pub use model::{Build, BuildRef, BuildState};
pub use tls::TlsMaterial;

/// Source of console logs, consumed by the log server.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn get_log(&self, build: &BuildRef) -> Result<LogStream, BackendError>;
}

/// Source of build state, consumed by the reconciliation controller.
#[async_trait]
pub trait BuildSource: Send + Sync {
    /// Latest build of `job`, or `None` when the job has never run.
    async fn latest_build(&self, job: &str) -> Result<Option<Build>, BackendError>;
}
