//! Guided Gentoo installer: a validated install plan executed by a
//! dry-run capable, rollback-aware step orchestrator.

pub mod cmd;
pub mod config;
pub mod env;
pub mod error;
pub mod logging;
pub mod lsblk;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod steps;
pub mod ui;

pub use config::{load, ConfigLayer, Configuration};
pub use env::Environment;
pub use orchestrator::{
    CancelToken, FailurePolicy, Orchestrator, RunOptions, RunState, RunStatus, StepResult,
    StepStatus,
};
pub use pipeline::{master_steps, Pipeline};
pub use report::{Event, Reporter};
pub use steps::{Phase, Step, StepContext};
