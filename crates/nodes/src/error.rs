//! Executor-boundary error type.

use thiserror::Error;

/// Errors returned when handing an instruction to a worker.
///
/// - `Retryable`: no worker could be reached; the instruction may be resent.
/// - `Fatal`: the worker refused the instruction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("retryable executor error: {0}")]
    Retryable(String),

    #[error("fatal executor error: {0}")]
    Fatal(String),
}
