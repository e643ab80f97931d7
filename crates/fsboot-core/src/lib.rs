//! Startup orchestration core for fsboot.
//!
//! Brings a file server up through a fixed sequence of provisioning stages
//! (network, iSCSI, cache, file sharing, external NFS, Nextcloud). Each stage
//! delegates to an opaque [`StageAction`]; this crate supplies the pieces
//! around them: a PID-carrying [`StartupLock`] that keeps runs from
//! overlapping, a bounded exponential-backoff [`retry`] executor, the
//! [`StageRunner`] that times and reports a single stage, the [`Orchestrator`]
//! that enforces stage order and the failure policy, and the host status
//! [`Summary`] written after every run.

pub mod action;
pub mod concurrency;
pub mod lifecycle;
pub mod orchestrator;
pub mod probe;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod summary;

pub use action::{
    ActionContext, ActionFailure, ActionOutput, FailureKind, MountPrecondition, Retrying,
    ScriptAction, Sequence, StageAction,
};
pub use concurrency::{
    install_signal_handler, interruptible_sleep, release_held_locks, shutdown_requested,
    StartupLock,
};
pub use lifecycle::{validate_transition, RunState};
pub use orchestrator::{
    FailureHandler, FailurePolicy, LogFailureHandler, Orchestrator, RunOutcome, RunReport,
};
pub use probe::{parse_mount_points, HostProbe, ProbeStatus, SystemProbe};
pub use retry::{retry, retry_with, RetryPolicy};
pub use runner::StageRunner;
pub use stage::{standard_stages, RunResult, Stage, StageId};
pub use summary::{write_summary, Summary};

use thiserror::Error;

/// Exit status reported when a run is cut short by a termination signal.
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] fsboot_config::ConfigError),
    #[error("timed out after {waited_secs}s waiting for startup lock {path} ({holder})")]
    LockTimeout {
        path: String,
        waited_secs: u64,
        holder: String,
    },
    #[error("stage '{after}' cannot be declared after '{before}'")]
    InvalidStageOrder { before: StageId, after: StageId },
    #[error("invalid run state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("interrupted by signal")]
    Interrupted,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
