//! ---
//! bs_section: "01-core-functionality"
//! bs_subsection: "module"
//! bs_type: "source"
//! bs_scope: "code"
//! bs_description: "Core scheduler and operator lifecycle."
//! bs_version: "v0.0.0-prealpha"
//! bs_owner: "tbd"
//! ---
//! Assembles the operator from its settings and drives its long-lived loops.

pub mod operator;
pub mod scheduler;

pub use operator::{bootstrap, Operator, OPERATOR_NAME};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerReport};
