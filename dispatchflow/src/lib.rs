//! # Dispatchflow
//!
//! Execution engine for device test jobs.
//!
//! A job is a tree of [actions](action::Action). The root
//! [`Pipeline`](pipeline::Pipeline) runs its actions in order; composite
//! actions own a child pipeline of their own. The engine provides:
//!
//! - **Hierarchical deadlines**: every level narrows the deadline it was
//!   given to its own budget, so nested retries never outlive their parent
//! - **Typed failures**: engine bugs, job misconfiguration, infrastructure,
//!   test and timeout failures drive retry, cleanup and diagnostics
//! - **Retry and repeat**: [`RetryAction`](pipeline::RetryAction) re-runs its
//!   children with per-attempt cleanup
//! - **Connections**: console sessions with prompt matching and background
//!   feedback draining
//! - **Structured records**: action start, end and result records through an
//!   [`EventSink`](events::EventSink)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dispatchflow::prelude::*;
//!
//! let mut parser = JobParser::new();
//! parser.registry_mut().register("deploy-tftp", |_| Ok(Box::new(DeployTftp::new()) as Box<dyn Action>));
//!
//! let device = DeviceConfig::from_path("devices/bbb-01.yaml")?;
//! let mut job = parser.parse(&std::fs::read_to_string("job.yaml")?, device)?;
//! job.validate().await?;
//! let outcome = job.run().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod action;
pub mod builtin;
pub mod connection;
pub mod context;
pub mod diagnostics;
pub mod errors;
pub mod events;
pub mod job;
pub mod observability;
pub mod pipeline;
pub mod process;
pub mod protocols;
pub mod testing;
pub mod timeout;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::{Action, ActionBase, ActionRegistry, CommandPolicy, Parameters};
    pub use crate::builtin::{CommandAction, FinalizeAction, ShellAction};
    pub use crate::connection::{Connection, SharedConnection, ShellSession};
    pub use crate::context::{ContextStore, DataPath, DEFAULT_NAMESPACE};
    pub use crate::diagnostics::{Diagnostic, DiagnosticRegistry};
    pub use crate::errors::{Failure, FailureKind, Result};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, ResultRecord, ResultStatus};
    pub use crate::job::{DeviceConfig, Job, JobContext, JobDefinition, JobOutcome, JobParser};
    pub use crate::observability::{init_logging, LogFormat};
    pub use crate::pipeline::{Pipeline, RetryAction};
    pub use crate::protocols::Protocol;
    pub use crate::timeout::{Deadline, Timeout};
}
