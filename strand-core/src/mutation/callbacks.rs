//! Registry of mutation callbacks attached to one container

use super::{Mutation, WatchingDepth};
use crate::context::{panic_message, Context};
use crate::error::CallbackError;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use strand_types::CallbackHandle;

/// Called synchronously after each mutation; any error removes the callback
pub type MutationCallbackFn =
    Arc<dyn Fn(&Context, &Mutation) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Clone)]
pub struct MutationCallbackConfig {
    pub callback: MutationCallbackFn,
    pub depth: WatchingDepth,
}

impl MutationCallbackConfig {
    pub fn new(
        depth: WatchingDepth,
        callback: impl Fn(&Context, &Mutation) -> Result<(), CallbackError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            callback: Arc::new(callback),
            depth,
        }
    }
}

#[derive(Clone)]
struct Slot {
    handle: CallbackHandle,
    callback: MutationCallbackFn,
    depth: WatchingDepth,
}

struct Registry {
    slots: Vec<Option<Slot>>,
    first_free: usize,
    next_handle: u64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            first_free: 0,
            next_handle: CallbackHandle::FIRST_VALID.as_u64(),
        }
    }
}

impl Registry {
    fn compact_free_pointer(&mut self) {
        self.first_free = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .unwrap_or(self.slots.len());
    }
}

/// Callbacks live in a slot array. Removal tombstones a slot and later
/// registrations fill the first tombstone; handles keep increasing and
/// are never reused.
#[derive(Default)]
pub struct MutationCallbacks {
    registry: Mutex<Registry>,
}

impl MutationCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, config: MutationCallbackConfig) -> CallbackHandle {
        let mut registry = self.registry.lock();
        let handle = CallbackHandle(registry.next_handle);
        registry.next_handle += 1;

        let slot = Some(Slot {
            handle,
            callback: config.callback,
            depth: config.depth.or_shallow(),
        });
        let index = registry.first_free;
        if index < registry.slots.len() {
            registry.slots[index] = slot;
        } else {
            registry.slots.push(slot);
        }
        registry.compact_free_pointer();
        handle
    }

    /// Returns whether a live callback was removed
    pub fn remove(&self, handle: CallbackHandle) -> bool {
        if !handle.is_valid() {
            return false;
        }
        let mut registry = self.registry.lock();
        let Some(index) = registry
            .slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.handle == handle))
        else {
            return false;
        };
        registry.slots[index] = None;
        registry.first_free = registry.first_free.min(index);
        true
    }

    pub fn remove_many(&self, handles: &[CallbackHandle]) {
        for handle in handles {
            self.remove(*handle);
        }
    }

    /// Tombstone every slot
    pub fn clear(&self) {
        let mut registry = self.registry.lock();
        registry.slots.iter_mut().for_each(|slot| *slot = None);
        registry.first_free = 0;
    }

    pub fn len(&self) -> usize {
        self.registry.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every callback whose depth covers `mutation`, in
    /// registration order.
    ///
    /// Callbacks run without the registry lock held, so they may add or
    /// remove callbacks. A callback that errors or panics is removed.
    pub fn call(&self, ctx: &Context, mutation: &Mutation) {
        let mut snapshot: Vec<Slot> = {
            let registry = self.registry.lock();
            registry.slots.iter().flatten().cloned().collect()
        };
        snapshot.sort_by_key(|s| s.handle);

        let mut dropped = Vec::new();
        for slot in snapshot {
            if mutation.depth().is_specified() && slot.depth < mutation.depth() {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (slot.callback)(ctx, mutation)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(CallbackError::Unsubscribe)) => dropped.push(slot.handle),
                Ok(Err(err)) => {
                    tracing::debug!(error = %err, "mutation callback failed, removing it");
                    dropped.push(slot.handle);
                }
                Err(payload) => {
                    tracing::warn!(panic = %panic_message(&payload), "mutation callback panicked, removing it");
                    dropped.push(slot.handle);
                }
            }
        }

        self.remove_many(&dropped);
        self.registry.lock().compact_free_pointer();
    }
}
