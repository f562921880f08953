//! Sharing values across lightweight threads
//!
//! A mutable value crossing a thread boundary is either shared (and from
//! then on protected by its [`SmartLock`]) or deep-cloned. Immutable values
//! cross unchanged.

mod smart_lock;

pub use smart_lock::{SmartLock, SmartLockGuard};

use crate::context::Context;
use crate::error::{CloneError, LockError};
use crate::value::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use strand_types::ValueId;

/// Why a value cannot be shared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotSharable(pub String);

impl fmt::Display for NotSharable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A value that can be shared between lightweight threads
pub trait PotentiallySharable {
    fn is_sharable(&self, origin: &Context) -> Result<(), NotSharable>;

    /// Share the value; idempotent
    fn share(&self, origin: &Context);

    fn is_shared(&self) -> bool;

    fn smart_lock(&self, ctx: &Context) -> Result<(), LockError>;

    fn smart_unlock(&self, ctx: &Context);
}

/// Identity-keyed map of already visited containers
pub type CloneMap = HashMap<ValueId, Value>;

/// Return `value` itself if immutable or sharable (sharing it), or a deep clone.
pub fn share_or_clone(value: &Value, origin: &Context) -> Result<Value, CloneError> {
    if !value.is_mutable() || value.is_shared() {
        return Ok(value.clone());
    }
    match value.check_sharable(origin, &mut HashSet::new()) {
        Ok(()) => {
            value.share(origin);
            Ok(value.clone())
        }
        Err(reason) => {
            tracing::debug!(reason = %reason, "value is not sharable, cloning it");
            value.deep_clone_with(&mut CloneMap::new())
        }
    }
}
