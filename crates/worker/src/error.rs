//! Worker-side error type.

use thiserror::Error;

/// Errors returned by a [`crate::TaskExecutor`].
///
/// Neither variant is a task failure: a task that runs and fails is
/// reported through a `TaskReport`, not through this type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker group refused the dispatch (e.g. unknown group).
    #[error("dispatch rejected: {0}")]
    Rejected(String),

    /// No worker could be reached.
    #[error("worker unavailable: {0}")]
    Unavailable(String),
}
