//! Error types for the hardware-abstraction core.

use thiserror::Error;

/// Errors produced by the framework and the tasks it runs.
///
/// Invariant violations (double-unlock, off-thread calls, etc.) are *not*
/// represented here; they panic, since they indicate a caller bug rather than
/// a runtime condition to recover from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameworkError {
    /// The shared native context could not be created. Fatal to framework
    /// construction; there is no recovery path.
    #[error("failed to create native context: {0}")]
    ContextCreation(String),
    /// A surface could not be created by the surface factory.
    #[error("failed to create surface: {0}")]
    SurfaceCreation(String),
    /// The bounded task queue stayed full for the entire retry window.
    #[error("context thread task queue is full")]
    QueueFull,
    /// The framework is shutting down and rejected the operation.
    #[error("framework is shutting down")]
    ShuttingDown,
    /// A queued task panicked; the panic was captured by the task wrapper so
    /// the worker loop keeps running.
    #[error("task panicked: {0}")]
    TaskPanicked(String),
    /// Anything that indicates a bug in the framework itself.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error observed by a caller waiting on a [`TaskFuture`](crate::TaskFuture).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task was cancelled before it ran, typically because the framework
    /// was shutting down when it was submitted.
    #[error("task was cancelled")]
    Cancelled,
    /// The timeout elapsed before the task completed.
    #[error("timed out waiting for task")]
    Timeout,
    /// The task ran and failed.
    #[error(transparent)]
    Failed(#[from] FrameworkError),
}

/// Failure reported by a resource driver's `update`.
///
/// This is a recoverable, per-resource condition: the resource manager
/// captures the message as an `Error` status instead of propagating it to the
/// caller's task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource update failed: {0}")]
pub struct UpdateError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameworkError::QueueFull;
        assert_eq!(err.to_string(), "context thread task queue is full");

        let err = FrameworkError::ContextCreation("no display".to_string());
        assert_eq!(err.to_string(), "failed to create native context: no display");

        let err = TaskError::Failed(FrameworkError::ShuttingDown);
        assert_eq!(err.to_string(), "framework is shutting down");
    }
}
