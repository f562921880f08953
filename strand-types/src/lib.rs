//! Shared types for strand
//!
//! This crate provides the identifier newtypes used across the strand
//! runtime: contexts, transactions, mutable values, callback handles,
//! lightweight threads and lifetime-job sets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl $name {
            /// Allocate a fresh, process-unique id
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            pub fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Execution context identifier
    ContextId,
    NEXT_CONTEXT_ID,
    "ctx"
);

counter_id!(
    /// Identity of a mutable container value.
    ///
    /// Used instead of pointer identity for cycle detection and clone maps.
    ValueId,
    NEXT_VALUE_ID,
    "value"
);

counter_id!(
    /// Lightweight thread identifier
    LThreadId,
    NEXT_LTHREAD_ID,
    "lthread"
);

counter_id!(
    /// Identifier of the lifetime jobs attached to one owner value
    JobsId,
    NEXT_JOBS_ID,
    "jobs"
);

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Handle returned when registering a mutation callback.
///
/// Handles are allocated per registry, start at [`CallbackHandle::FIRST_VALID`]
/// and only ever increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackHandle(pub u64);

impl CallbackHandle {
    pub const FIRST_VALID: CallbackHandle = CallbackHandle(1);

    pub fn is_valid(&self) -> bool {
        self.0 >= Self::FIRST_VALID.0
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
