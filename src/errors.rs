//! Typed error hierarchy for the Convoy orchestrator.
//!
//! Four top-level enums cover the four subsystems:
//! - `LockError` — advisory lock acquisition failures
//! - `StateError` — operation state machine violations
//! - `QueueError` — merge queue and integration failures
//! - `WorkerError` — worker polling daemon failures

use thiserror::Error;

/// Errors from the lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock '{name}' is held by live process {pid}")]
    Held { name: String, pid: u32 },

    #[error("Lock '{name}' has unreadable marker content")]
    Corrupt { name: String },

    #[error("Timed out waiting for lock '{name}'")]
    Timeout { name: String },

    #[error("Lock I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the operation state machine.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Operation '{name}' not found")]
    UnknownOperation { name: String },

    #[error("Operation '{name}' already exists")]
    DuplicateOperation { name: String },

    #[error("Operation '{name}' is terminal ({phase}) and cannot move to {target}")]
    TerminalPhase {
        name: String,
        phase: String,
        target: String,
    },

    #[error("Operation '{name}' has a cyclic 'after' chain through '{via}'")]
    DependencyCycle { name: String, via: String },

    #[error("Dependency '{after}' of operation '{name}' does not exist")]
    UnknownDependency { name: String, after: String },

    #[error("Operation '{name}' cannot resume: dependency '{after}' has not merged")]
    DependencyUnmerged { name: String, after: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the merge queue and the integration step.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue already holds a non-terminal entry for operation '{operation}'")]
    DuplicateEntry { operation: String },

    #[error("No queue entry for operation '{operation}'")]
    EntryNotFound { operation: String },

    /// The remote query itself could not be executed. Distinct from a
    /// negative result: callers must never treat this as "branch is gone".
    #[error("Remote branch check could not be performed: {0}")]
    RemoteCheck(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a worker polling daemon.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker '{kind}' stopping after {failures} consecutive crashes")]
    SelfStop { kind: String, failures: u32 },

    #[error("Failed to launch agent session '{session}': {reason}")]
    SessionLaunch { session: String, reason: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
