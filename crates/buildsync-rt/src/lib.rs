//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Runtime helpers supporting the operator scheduler."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
//! Shutdown signalling and interval-driven control loops.

pub mod scheduling;
pub mod shutdown;

pub use scheduling::{ControlLoop, DurationObserver, LoopSummary, Reconciler};
pub use shutdown::{spawn_signal_listener, ShutdownListener, ShutdownSignal};
