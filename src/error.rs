//! Error types for the timer facility.

use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, TimerError>;

/// Errors surfaced by the public API.
///
/// Invariant violations in the timer set and arm-on-armed-timer
/// preconditions are not represented here: the former aborts the process
/// and the latter is a debug assertion, per the facility's error handling
/// design. Only recoverable, caller-actionable failures get a variant.
#[derive(Error, Debug)]
pub enum TimerError {
    /// A kernel timer syscall (create, arm, or read) failed.
    #[error("kernel timer facility failed: {0}")]
    KernelTimer(#[source] std::io::Error),

    /// `WorkerPool::submit` was called after the pool had been stopped.
    #[error("submit on stopped worker pool")]
    PoolStopped,

    /// The manager has already been shut down and cannot accept new work.
    #[error("timer manager has been shut down")]
    ManagerShutDown,
}

impl From<std::io::Error> for TimerError {
    fn from(err: std::io::Error) -> Self {
        TimerError::KernelTimer(err)
    }
}
