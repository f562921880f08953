//! Process-wide table of acquired resources
//!
//! Resources are identified by an opaque name (a URL, a path ...). A
//! resource is held either by a context or by a transaction; acquiring a
//! resource already held by the same holder succeeds immediately.

use crate::error::ResourceError;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strand_types::{ContextId, TransactionId};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Who holds a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHolder {
    Context(ContextId),
    Transaction(TransactionId),
}

impl fmt::Display for ResourceHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceHolder::Context(id) => write!(f, "{}", id),
            ResourceHolder::Transaction(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Default)]
pub struct ResourceTable {
    held: Mutex<HashMap<String, ResourceHolder>>,
    released: Condvar,
}

static GLOBAL_TABLE: Lazy<Arc<ResourceTable>> = Lazy::new(|| Arc::new(ResourceTable::new()));

impl ResourceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> Arc<ResourceTable> {
        GLOBAL_TABLE.clone()
    }

    /// Block until `name` is free (or already ours), then take it
    pub fn acquire(
        &self,
        name: &str,
        holder: ResourceHolder,
        is_done: &dyn Fn() -> bool,
    ) -> Result<(), ResourceError> {
        let mut held = self.held.lock();
        loop {
            match held.get(name) {
                None => {
                    held.insert(name.to_string(), holder);
                    tracing::debug!(resource = name, %holder, "resource acquired");
                    return Ok(());
                }
                Some(current) if *current == holder => return Ok(()),
                Some(_) => {
                    if is_done() {
                        return Err(ResourceError::ContextDone(name.to_string()));
                    }
                    self.released.wait_for(&mut held, ACQUIRE_POLL_INTERVAL);
                }
            }
        }
    }

    /// Take `name` only if it is free (or already ours)
    pub fn try_acquire(&self, name: &str, holder: ResourceHolder) -> bool {
        let mut held = self.held.lock();
        match held.get(name) {
            None => {
                held.insert(name.to_string(), holder);
                true
            }
            Some(current) => *current == holder,
        }
    }

    pub fn release(&self, name: &str, holder: ResourceHolder) -> Result<(), ResourceError> {
        let mut held = self.held.lock();
        match held.get(name) {
            Some(current) if *current == holder => {
                held.remove(name);
                drop(held);
                self.released.notify_all();
                Ok(())
            }
            _ => Err(ResourceError::NotHeld(name.to_string())),
        }
    }

    /// Release every resource of `holder`, returning how many were released
    pub fn release_all(&self, holder: ResourceHolder) -> usize {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, current| *current != holder);
        let released = before - held.len();
        drop(held);
        if released > 0 {
            self.released.notify_all();
        }
        released
    }

    pub fn holder_of(&self, name: &str) -> Option<ResourceHolder> {
        self.held.lock().get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_try_acquire_conflict() {
        let table = ResourceTable::new();
        let a = ResourceHolder::Context(ContextId::next());
        let b = ResourceHolder::Context(ContextId::next());

        assert!(table.try_acquire("file:///a", a));
        assert!(table.try_acquire("file:///a", a));
        assert!(!table.try_acquire("file:///a", b));

        table.release("file:///a", a).unwrap();
        assert!(table.try_acquire("file:///a", b));
    }

    #[test]
    fn test_release_requires_holder() {
        let table = ResourceTable::new();
        let a = ResourceHolder::Context(ContextId::next());
        let b = ResourceHolder::Transaction(TransactionId::new());
        table.try_acquire("r", a);
        assert_eq!(
            table.release("r", b),
            Err(ResourceError::NotHeld("r".to_string()))
        );
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let table = Arc::new(ResourceTable::new());
        let a = ResourceHolder::Context(ContextId::next());
        let b = ResourceHolder::Context(ContextId::next());
        table.acquire("r", a, &|| false).unwrap();

        let t = table.clone();
        let waiter = thread::spawn(move || t.acquire("r", b, &|| false));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(table.holder_of("r"), Some(a));

        assert_eq!(table.release_all(a), 1);
        waiter.join().unwrap().unwrap();
        assert_eq!(table.holder_of("r"), Some(b));
    }

    #[test]
    fn test_acquire_aborts_when_done() {
        let table = ResourceTable::new();
        let a = ResourceHolder::Context(ContextId::next());
        let b = ResourceHolder::Context(ContextId::next());
        table.try_acquire("r", a);
        assert_eq!(
            table.acquire("r", b, &|| true),
            Err(ResourceError::ContextDone("r".to_string()))
        );
    }
}
