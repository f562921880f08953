//! Error types for module evaluation, lthreads and lifetime jobs

use strand_core::error::{CloneError, ContextError, CoreError, LimitError, PermissionError, ValueError};
use thiserror::Error;

/// Failure of a module evaluation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("evaluation failed: {0}")]
    Failed(String),

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("evaluation panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Permission(#[from] PermissionError),
}

impl From<ValueError> for EvalError {
    fn from(err: ValueError) -> Self {
        match err {
            ValueError::Lock(_) => EvalError::Cancelled,
            other => EvalError::Failed(other.to_string()),
        }
    }
}

impl From<LimitError> for EvalError {
    fn from(err: LimitError) -> Self {
        match err {
            LimitError::ContextDone => EvalError::Cancelled,
            other => EvalError::Failed(other.to_string()),
        }
    }
}

impl From<CloneError> for EvalError {
    fn from(err: CloneError) -> Self {
        EvalError::Failed(err.to_string())
    }
}

/// Errors raised while spawning an lthread
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Context(#[from] ContextError),

    /// The simultaneous instances limit is exhausted
    #[error(transparent)]
    Limit(#[from] LimitError),

    /// A global or the self value could not be shared or cloned
    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error("failed to spawn the execution thread: {0}")]
    ThreadSpawn(String),
}

/// Errors of a running or finished lthread
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LThreadError {
    #[error("lthread is done")]
    IsDone,

    #[error("lthread was cancelled")]
    Cancelled,

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("lthread result cannot be shared: {0}")]
    ResultClone(CloneError),
}

/// Lifetime job errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("lifetime job metadata must be immutable, got {0}")]
    MetaMustBeImmutable(&'static str),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Permission(#[from] PermissionError),
}

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    LThread(#[from] LThreadError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_done_limit_maps_to_cancelled() {
        assert_eq!(EvalError::from(LimitError::ContextDone), EvalError::Cancelled);
        assert!(matches!(
            EvalError::from(LimitError::NotPresent("x".into())),
            EvalError::Failed(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = JobError::MetaMustBeImmutable("object");
        assert_eq!(err.to_string(), "lifetime job metadata must be immutable, got object");
        assert_eq!(LThreadError::IsDone.to_string(), "lthread is done");
    }
}
