//! strand core - contexts, transactions, sharing and mutation observation
//!
//! This crate holds everything lightweight threads need to read, mutate
//! and observe shared values safely.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Context                             │
//! │  permissions · limiters · transaction slot · cancel tree      │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │   Transaction ──── effects, resources, end callbacks          │
//! │        │                                                      │
//! │        ▼                                                      │
//! │   TransactionIsolator (one per shared container)              │
//! │        │                                                      │
//! │        ▼                                                      │
//! │   ┌──────────────┐    SmartLock: inert until shared,          │
//! │   │ Object/List  │──▶ starving waiters cancel the holder      │
//! │   └──────┬───────┘                                            │
//! │          │ Mutation                                           │
//! │          ▼                                                    │
//! │   MutationCallbacks · ValueWatchers · ValueHistory            │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Core Concepts
//!
//! ## Contexts and limits
//!
//! A [`Context`] carries the permissions of one thread of control and its
//! named [`Limiter`]s. Total limits fail immediately when exhausted; rate
//! limits block until the background ticker refills them.
//!
//! ## Transactions
//!
//! A [`Transaction`] binds to one context, collects reversible effects
//! and commits or rolls back exactly once. Readonly transactions never
//! block each other; a write transaction waits for them.
//!
//! ## Sharing
//!
//! [`share_or_clone`] hands a value to another thread: immutable values
//! pass as is, sharable containers are shared, the rest are deep-cloned.
//!
//! ## Observation
//!
//! Containers report each change as a [`Mutation`] to callbacks and
//! watchers. Watching at intermediate or deep depth forwards the
//! mutations of nested containers with relocalized paths.
//!
//! # Example
//!
//! ```rust
//! use strand_core::{Context, Object, Value, ValueHistory};
//!
//! let ctx = Context::root(vec![], vec![]).unwrap();
//! let counter = Object::from_entries(vec![("n".to_string(), Value::Int(0))]);
//! let history = ValueHistory::new(&ctx, &Value::Object(counter.clone())).unwrap();
//!
//! counter.set_prop(&ctx, "n", Value::Int(1)).unwrap();
//! assert_eq!(counter.keys(), vec!["n"]);
//! assert_eq!(history.change_count(), 1);
//! ```

// Modules
pub mod config;
pub mod context;
pub mod error;
pub mod history;
pub mod limit;
pub mod mutation;
pub mod permission;
pub mod resource;
pub mod sharing;
pub mod transaction;
pub mod value;
pub mod watch;

// Re-exports for convenience
pub use config::RuntimeConfig;
pub use context::{Context, ContextConfig, TeardownStatus};
pub use error::{
    CallbackError, CloneError, CodecError, ContextError, CoreError, HistoryError, IsolationError,
    LimitError, LockError, MutationError, PermissionError, ResourceError, Result, TransactionError,
    ValueError, WatchError,
};
pub use history::ValueHistory;
pub use limit::{Limit, LimitKind, Limiter};
pub use mutation::{
    Change, Mutation, MutationCallbackConfig, MutationCallbacks, MutationKind, WatchingDepth,
};
pub use permission::{Permission, PermissionEntity, PermissionKind, PermissionSet};
pub use resource::{ResourceHolder, ResourceTable};
pub use sharing::{share_or_clone, NotSharable, PotentiallySharable, SmartLock};
pub use transaction::{
    start_new_readonly_transaction, start_new_transaction, Effect, Reversibility, Transaction,
    TransactionIsolator, TransactionOptions, TransactionOutcome,
};
pub use value::{HostHandle, List, Object, Value};
pub use watch::{GenericWatcher, JoinedWatchers, StoppedWatcher, Watchable, Watcher};
pub use strand_types::{CallbackHandle, ContextId, TransactionId, ValueId};
