//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Shared primitives for the operator runtime."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
//! Core shared primitives for the buildsync operator workspace.
//! This crate exposes process settings, the operator configuration agent,
//! label selector parsing, the startup error taxonomy, and logging setup.

pub mod config;
pub mod error;
pub mod logging;
pub mod selector;
pub mod settings;

pub use config::{
    ConfigAgent, JobConfig, LoggingConfig, OperatorConfig, PushGatewayConfig, ReportTarget,
};
pub use error::StartupError;
pub use logging::{init_tracing, LogFormat};
pub use selector::{LabelSelector, SelectorError};
pub use settings::{load_token, OperatorSettings, DEFAULT_LISTEN, DEFAULT_LOOP_INTERVAL};
