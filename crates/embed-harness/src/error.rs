//! Error types for harness operations.
//!
//! Two families of problems exist in a test harness. Operational errors
//! (an executor that already shut down, a group wired to the wrong gate)
//! are returned as `HarnessError` through `Result`. Protocol violations
//! observed while a test runs (duplicate acknowledgments, wrong-thread
//! calls) are never returned; they are recorded as
//! [`TestFailure`](crate::results::TestFailure) so the test keeps running
//! and reports every problem it hits.

use thiserror::Error;

/// The main error type for harness operations.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A context-bound operation was invoked from another thread.
    #[error("'{operation}' must run on the {executor} executor")]
    OffExecutor {
        /// The operation that was attempted
        operation: &'static str,
        /// Name of the executor the operation is bound to
        executor: String,
    },

    /// The executor no longer accepts tasks.
    #[error("executor '{0}' has shut down")]
    ExecutorShutDown(String),

    /// The deferral helper was torn down and cannot schedule more work.
    #[error("deferred executor has been torn down")]
    TornDown,

    /// A harness was added to a group that uses a different completion gate.
    #[error("harness {harness} does not share the group's completion gate")]
    GateMismatch {
        /// Identity of the rejected harness
        harness: String,
    },

    /// `InstanceGroup::execute` was called without members.
    #[error("instance group has no members")]
    EmptyGroup,

    /// A single-instance run was requested on a gate shared by several members.
    #[error("single-instance execution needs a gate with total 1, found {0}")]
    SharedGate(usize),

    /// The engine refused an outbound request.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Spawning an executor thread or runtime failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by an [`Engine`](crate::engine::Engine) implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine does not implement the requested capability.
    #[error("engine does not support {0}")]
    Unsupported(&'static str),

    /// Instance creation was rejected.
    #[error("instance creation for '{url}' failed: {reason}")]
    CreationFailed {
        /// The URL the instance was meant to load
        url: String,
        /// Reason for the failure
        reason: String,
    },
}

/// A specialized Result type for harness operations.
pub type Result<T> = std::result::Result<T, HarnessError>;
