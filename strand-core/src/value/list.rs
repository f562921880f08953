use super::container::{self, Container, ContainerCore};
use super::{admit, Value};
use crate::context::Context;
use crate::error::{CloneError, LockError, ValueError};
use crate::mutation::{Mutation, MutationCallbackConfig, WatchingDepth};
use crate::sharing::{share_or_clone, CloneMap, NotSharable, PotentiallySharable};
use crate::watch::{GenericWatcher, Watchable, WatcherConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use strand_types::{CallbackHandle, ValueId};

pub(crate) struct ListInner {
    core: ContainerCore,
    elements: Mutex<Vec<Value>>,
}

impl Container for ListInner {
    fn core(&self) -> &ContainerCore {
        &self.core
    }

    // Resolved at dispatch time: the child may have moved since it was added
    fn locate(&self, child: ValueId) -> Option<String> {
        self.elements
            .lock()
            .iter()
            .position(|v| v.id() == Some(child))
            .map(|i| format!("/{}", i))
    }

    fn children(&self) -> Vec<Value> {
        self.elements
            .lock()
            .iter()
            .filter(|v| v.as_watchable().is_some())
            .cloned()
            .collect()
    }
}

/// Mutable sequence
#[derive(Clone)]
pub struct List {
    inner: Arc<ListInner>,
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl List {
    pub fn new() -> Self {
        Self::from_values(Vec::new())
    }

    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            inner: Arc::new(ListInner {
                core: ContainerCore::new(),
                elements: Mutex::new(values),
            }),
        }
    }

    pub fn id(&self) -> ValueId {
        self.inner.core.id()
    }

    pub fn len(&self) -> usize {
        self.inner.elements.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn values_snapshot(&self) -> Vec<Value> {
        self.inner.elements.lock().clone()
    }

    pub fn get(&self, ctx: &Context, index: usize) -> Result<Value, ValueError> {
        let _guard = self.inner.core.begin_read(ctx)?;
        let elements = self.inner.elements.lock();
        elements
            .get(index)
            .cloned()
            .ok_or(ValueError::IndexOutOfBounds {
                index,
                len: elements.len(),
            })
    }

    pub fn set(&self, ctx: &Context, index: usize, value: Value) -> Result<(), ValueError> {
        let core = &self.inner.core;
        let _guard = core.begin_write(ctx)?;
        let value = admit(ctx, core.is_shared(), value)?;

        let previous = {
            let mut elements = self.inner.elements.lock();
            let len = elements.len();
            let slot = elements
                .get_mut(index)
                .ok_or(ValueError::IndexOutOfBounds { index, len })?;
            std::mem::replace(slot, value.clone())
        };
        container::unwatch_child_if_absent(&self.inner, ctx, &previous);
        container::watch_child(&self.inner, ctx, &value);

        if core.is_observed() {
            let mutation = Mutation::set_elem_at_index(index, &value, WatchingDepth::Shallow, format!("/{}", index));
            core.dispatch(ctx, &mutation);
        }
        Ok(())
    }

    /// Insert before `index`; `index == len` appends
    pub fn insert(&self, ctx: &Context, index: usize, value: Value) -> Result<(), ValueError> {
        self.insert_at(ctx, Some(index), value)
    }

    pub fn push(&self, ctx: &Context, value: Value) -> Result<(), ValueError> {
        self.insert_at(ctx, None, value)
    }

    /// `None` appends; the index is resolved under the write guard
    fn insert_at(&self, ctx: &Context, index: Option<usize>, value: Value) -> Result<(), ValueError> {
        let core = &self.inner.core;
        let _guard = core.begin_write(ctx)?;
        let value = admit(ctx, core.is_shared(), value)?;

        let index = {
            let mut elements = self.inner.elements.lock();
            let len = elements.len();
            let index = index.unwrap_or(len);
            if index > len {
                return Err(ValueError::IndexOutOfBounds { index, len });
            }
            elements.insert(index, value.clone());
            index
        };
        container::watch_child(&self.inner, ctx, &value);

        if core.is_observed() {
            let mutation =
                Mutation::insert_elem_at_index(index, &value, WatchingDepth::Shallow, format!("/{}", index));
            core.dispatch(ctx, &mutation);
        }
        Ok(())
    }

    pub fn insert_sequence(&self, ctx: &Context, index: usize, values: Vec<Value>) -> Result<(), ValueError> {
        let core = &self.inner.core;
        let _guard = core.begin_write(ctx)?;
        let shared = core.is_shared();
        let values = values
            .into_iter()
            .map(|v| admit(ctx, shared, v))
            .collect::<Result<Vec<_>, ValueError>>()?;

        {
            let mut elements = self.inner.elements.lock();
            let len = elements.len();
            if index > len {
                return Err(ValueError::IndexOutOfBounds { index, len });
            }
            elements.splice(index..index, values.iter().cloned());
        }
        for value in &values {
            container::watch_child(&self.inner, ctx, value);
        }

        if core.is_observed() {
            let mutation =
                Mutation::insert_sequence_at_index(index, &values, WatchingDepth::Shallow, format!("/{}", index));
            core.dispatch(ctx, &mutation);
        }
        Ok(())
    }

    pub fn remove(&self, ctx: &Context, index: usize) -> Result<Value, ValueError> {
        let core = &self.inner.core;
        let _guard = core.begin_write(ctx)?;

        let removed = {
            let mut elements = self.inner.elements.lock();
            let len = elements.len();
            if index >= len {
                return Err(ValueError::IndexOutOfBounds { index, len });
            }
            elements.remove(index)
        };
        container::unwatch_child_if_absent(&self.inner, ctx, &removed);

        if core.is_observed() {
            let mutation = Mutation::remove_position(index, WatchingDepth::Shallow, format!("/{}", index));
            core.dispatch(ctx, &mutation);
        }
        Ok(removed)
    }

    /// Remove the half-open range `range`
    pub fn remove_range(&self, ctx: &Context, range: Range<usize>) -> Result<Vec<Value>, ValueError> {
        let core = &self.inner.core;
        let _guard = core.begin_write(ctx)?;

        let removed: Vec<Value> = {
            let mut elements = self.inner.elements.lock();
            let len = elements.len();
            if range.start > range.end || range.end > len {
                return Err(ValueError::InvalidRange {
                    start: range.start,
                    end: range.end,
                    len,
                });
            }
            elements.drain(range.clone()).collect()
        };
        for value in &removed {
            container::unwatch_child_if_absent(&self.inner, ctx, value);
        }

        if core.is_observed() {
            let mutation = Mutation::remove_position_range(
                range.start,
                range.end,
                WatchingDepth::Shallow,
                format!("/{}", range.start),
            );
            core.dispatch(ctx, &mutation);
        }
        Ok(removed)
    }

    pub fn is_shared(&self) -> bool {
        self.inner.core.is_shared()
    }

    pub fn share(&self, origin: &Context) {
        let inner = &self.inner;
        inner.core.share(origin, || {
            let elements = inner.elements.lock().clone();
            for (index, child) in elements.into_iter().enumerate() {
                if !child.is_mutable() || child.is_shared() {
                    continue;
                }
                match share_or_clone(&child, origin) {
                    Ok(shared) if !shared.same_identity(&child) => {
                        let mut elements = inner.elements.lock();
                        if let Some(slot) = elements.get_mut(index).filter(|v| v.same_identity(&child)) {
                            *slot = shared;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(list = %inner.core.id(), index, error = %err, "element kept unshared");
                    }
                }
            }
        });
    }

    pub(crate) fn check_sharable(&self, origin: &Context, visited: &mut HashSet<ValueId>) -> Result<(), NotSharable> {
        if !visited.insert(self.id()) || self.is_shared() {
            return Ok(());
        }
        for (index, value) in self.values_snapshot().into_iter().enumerate() {
            value
                .check_sharable(origin, visited)
                .map_err(|reason| NotSharable(format!("element {}: {}", index, reason)))?;
        }
        Ok(())
    }

    pub(crate) fn deep_clone_with(&self, clones: &mut CloneMap) -> Result<Value, CloneError> {
        if let Some(existing) = clones.get(&self.id()) {
            return Ok(existing.clone());
        }
        let clone = List::new();
        clones.insert(self.id(), Value::List(clone.clone()));

        let elements = self
            .values_snapshot()
            .iter()
            .map(|v| v.deep_clone_with(clones))
            .collect::<Result<Vec<_>, CloneError>>()?;
        *clone.inner.elements.lock() = elements;
        Ok(Value::List(clone))
    }

    pub fn same_list(&self, other: &List) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Watchable for List {
    fn on_mutation(&self, ctx: &Context, config: MutationCallbackConfig) -> Result<CallbackHandle, ValueError> {
        container::on_mutation(&self.inner, ctx, config)
    }

    fn remove_mutation_callback(&self, _ctx: &Context, handle: CallbackHandle) {
        self.inner.core.remove_callback(handle);
    }

    fn remove_mutation_callbacks(&self, _ctx: &Context) {
        self.inner.core.remove_callbacks();
    }

    fn watcher(&self, ctx: &Context, config: WatcherConfig) -> Arc<GenericWatcher> {
        container::watcher(&self.inner, ctx, config)
    }
}

impl PotentiallySharable for List {
    fn is_sharable(&self, origin: &Context) -> Result<(), NotSharable> {
        self.check_sharable(origin, &mut HashSet::new())
    }

    fn share(&self, origin: &Context) {
        List::share(self, origin)
    }

    fn is_shared(&self) -> bool {
        List::is_shared(self)
    }

    fn smart_lock(&self, ctx: &Context) -> Result<(), LockError> {
        self.inner.core.smart_lock().lock(ctx)
    }

    fn smart_unlock(&self, ctx: &Context) {
        self.inner.core.smart_lock().unlock(ctx)
    }
}

impl fmt::Debug for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("id", &self.id())
            .field("len", &self.len())
            .field("shared", &self.is_shared())
            .finish()
    }
}
