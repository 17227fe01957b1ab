//! Error taxonomy for the agent (spec §7).
//!
//! Configuration errors are fatal to the whole agent; Resource, Staging,
//! Runtime and Cancellation errors are terminal for a single task and are
//! surfaced as a `FAILED` state transition; Transport errors are retried
//! locally with backoff before escalating to `Configuration`-level fatality.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Fatal: bad platform JSON, unknown resource manager, no applicable
    /// launch method. The agent exits with code 1.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Node count or core count differs from what the allocation manifest
    /// promised. The agent exits with code 2.
    #[error("allocation does not match platform config: {0}")]
    ConfigMismatch(String),

    /// The allocation manifest (nodefile, SLURM_NODELIST, ...) could not be
    /// parsed. The agent exits with code 2.
    #[error("allocation manifest unreadable: {0}")]
    AllocationUnreadable(String),

    /// Fatal for the affected task only: requirement exceeds anything the
    /// pilot could ever satisfy.
    #[error("task {uid} is unschedulable: {reason}")]
    Unschedulable { uid: String, reason: String },

    /// Fatal for the affected task only: the configured launch method isn't
    /// usable on this platform at runtime.
    #[error("launch method {method} unavailable: {reason}")]
    LMUnavailable { method: String, reason: String },

    /// Per-task, terminal: staging source/destination/permission failure.
    #[error("staging failed for directive {directive}: {reason}")]
    Staging { directive: String, reason: String },

    /// Per-task, terminal: spawn failure, non-zero exit, signal death,
    /// sandbox I/O failure.
    #[error("runtime failure for task {uid}: {reason}")]
    Runtime { uid: String, reason: String },

    /// Per-task, terminal, never counted as a failure.
    #[error("task {0} canceled")]
    Canceled(String),

    /// Transient pubsub/queue failure; retried locally with exponential
    /// backoff up to an administratively bounded cap before escalating.
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid platform configuration: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Exit code per spec §6: 1=config, 2=resource, 3=bootstrap, 4=runtime.
    /// Only meaningful for errors that are fatal to the whole agent.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Configuration(_) | Error::Json(_) => 1,
            Error::ConfigMismatch(_) | Error::AllocationUnreadable(_) => 2,
            Error::Unschedulable { .. }
            | Error::LMUnavailable { .. }
            | Error::Staging { .. }
            | Error::Runtime { .. }
            | Error::Canceled(_)
            | Error::Transport(_)
            | Error::Io(_) => 4,
        }
    }
}
