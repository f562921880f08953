//! Error types for the strand core

use thiserror::Error;

/// Top-level error for the core runtime
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Permission error: {0}")]
    Permission(#[from] PermissionError),

    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Limit error: {0}")]
    Limit(#[from] LimitError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Isolation error: {0}")]
    Isolation(#[from] IsolationError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Clone error: {0}")]
    Clone(#[from] CloneError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Value error: {0}")]
    Value(#[from] ValueError),

    #[error("Mutation error: {0}")]
    Mutation(#[from] MutationError),

    #[error("Watch error: {0}")]
    Watch(#[from] WatchError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Permission check failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PermissionError {
    /// The permission was never granted
    #[error("not allowed, missing permission: {0}")]
    NotGranted(String),

    /// The permission is forbidden, or was dropped
    #[error("not allowed, forbidden permission: {0}")]
    Forbidden(String),
}

/// Context construction and lifecycle errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContextError {
    #[error(transparent)]
    Permission(#[from] PermissionError),

    /// A child context asked for a permission its parent does not hold
    #[error("parent context does not hold the permission {0}")]
    PermissionNotHeldByParent(String),

    /// A limit was declared twice
    #[error("limit '{0}' is declared more than once")]
    DuplicateLimit(String),

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("context is done")]
    Done,
}

/// Limiter errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LimitError {
    #[error("limit '{0}' is not present in the context")]
    NotPresent(String),

    /// A Total limit did not have enough tokens left
    #[error("limit '{name}' exhausted: requested {requested}, available {available}")]
    Exhausted {
        name: String,
        requested: i64,
        available: i64,
    },

    #[error("invalid limit '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("context is done")]
    ContextDone,
}

/// Resource acquisition errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceError {
    #[error("context is done while waiting for resource '{0}'")]
    ContextDone(String),

    #[error("resource '{0}' is not held by the releasing holder")]
    NotHeld(String),
}

/// Transaction lifecycle errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransactionError {
    #[error("transaction already started")]
    AlreadyStarted,

    #[error("transaction not started")]
    NotStarted,

    #[error("context already has a transaction")]
    ContextAlreadyHasTransaction,

    #[error("cannot add irreversible effect to transaction")]
    CannotAddIrreversibleEffect,

    #[error("effects are not allowed in a readonly transaction")]
    EffectsNotAllowedInReadonly,

    /// Commit or rollback already completed
    #[error("transaction is finished")]
    Finished,

    /// Commit or rollback is in progress (end callbacks are running)
    #[error("transaction is finishing")]
    Finishing,

    #[error("end callback already set for key '{0}'")]
    AlreadySetEndCallback(String),

    #[error("failed to apply effect: {0}")]
    EffectFailed(String),

    /// Aggregated failures of end callbacks
    #[error("callback errors: {}", .0.join("; "))]
    Callbacks(Vec<String>),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Read/write isolation failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IsolationError {
    /// A write transaction waited too long for readonly transactions
    #[error("timed out waiting for readonly transactions to finish")]
    ReadonlyWaitTimeout,

    /// A reader waited too long for the running write transaction
    #[error("timed out waiting for the write transaction to finish")]
    WriteWaitTimeout,

    #[error("a running transaction is expected")]
    RunningTransactionExpected,

    #[error("context is done")]
    ContextDone,
}

/// SmartLock acquisition errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LockError {
    #[error("context is done while waiting for lock")]
    ContextDone,
}

/// Deep clone failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CloneError {
    #[error("value is not clonable: {0}")]
    NotClonable(String),
}

/// Value encoding failures
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("value is not serializable: {0}")]
    NotSerializable(String),

    #[error("cyclic value cannot be serialized")]
    Cyclic,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Container operation errors
#[derive(Debug, Error)]
pub enum ValueError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Clone(#[from] CloneError),

    #[error(transparent)]
    Limit(#[from] LimitError),

    #[error("mutation inside a readonly transaction")]
    MutationInReadonlyTransaction,

    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("invalid range {start}..{end} (length {len})")]
    InvalidRange { start: usize, end: usize, len: usize },

    #[error("value is not watchable")]
    NotWatchable,
}

/// Mutation construction and application errors
#[derive(Debug, Error)]
pub enum MutationError {
    #[error("cannot apply an incomplete mutation")]
    Incomplete,

    #[error("invalid operand {index}: {reason}")]
    InvalidOperand { index: usize, reason: String },

    #[error("cannot apply {kind} mutation to {target}")]
    TargetMismatch { kind: String, target: String },

    #[error("specific mutations are not supported by {0}")]
    UnsupportedSpecificMutation(String),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Error returned by a mutation callback; any error unsubscribes the callback
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CallbackError {
    /// The callback asks to be removed
    #[error("unsubscribe")]
    Unsubscribe,

    #[error("callback failed: {0}")]
    Failed(String),
}

/// Watcher errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WatchError {
    #[error("watch timeout")]
    Timeout,

    #[error("stopped watcher")]
    Stopped,

    #[error("context is done while waiting for a mutation")]
    ContextDone,
}

/// ValueHistory errors
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("watched value cannot be snapshotted: {0}")]
    Snapshot(#[from] CodecError),

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("no date is selected")]
    NoSelectedDate,

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;
