//! State shared by every mutable container: identity, smart lock,
//! isolation, observers and depth propagation.

use super::Value;
use crate::context::Context;
use crate::error::{CallbackError, ValueError};
use crate::mutation::{Mutation, MutationCallbackConfig, MutationCallbacks, WatchingDepth};
use crate::sharing::{SmartLock, SmartLockGuard};
use crate::transaction::TransactionIsolator;
use crate::watch::{GenericWatcher, ValueWatchers, WatcherConfig};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use strand_types::{CallbackHandle, ValueId};

thread_local! {
    // Containers currently dispatching on this thread; breaks forwarding
    // loops between containers that reference each other.
    static DISPATCHING: RefCell<Vec<ValueId>> = const { RefCell::new(Vec::new()) };
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter(id: ValueId) -> Option<Self> {
        DISPATCHING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.contains(&id) {
                return None;
            }
            stack.push(id);
            Some(DispatchGuard)
        })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

struct Forwarder {
    child: Value,
    handle: CallbackHandle,
}

#[derive(Default)]
struct Propagation {
    depth: WatchingDepth,
    forwarders: Vec<Forwarder>,
}

/// Implemented by the shared inner state of each container type
pub(crate) trait Container: Send + Sync + 'static {
    fn core(&self) -> &ContainerCore;

    /// Path segment (`/key` or `/index`) under which `child` currently lives
    fn locate(&self, child: ValueId) -> Option<String>;

    fn children(&self) -> Vec<Value>;
}

pub(crate) struct ContainerCore {
    id: ValueId,
    lock: SmartLock,
    isolator: OnceCell<TransactionIsolator>,
    callbacks: MutationCallbacks,
    watchers: ValueWatchers,
    propagation: Mutex<Propagation>,
}

impl ContainerCore {
    pub(crate) fn new() -> Self {
        Self {
            id: ValueId::next(),
            lock: SmartLock::new(),
            isolator: OnceCell::new(),
            callbacks: MutationCallbacks::new(),
            watchers: ValueWatchers::new(),
            propagation: Mutex::new(Propagation::default()),
        }
    }

    pub(crate) fn id(&self) -> ValueId {
        self.id
    }

    pub(crate) fn smart_lock(&self) -> &SmartLock {
        &self.lock
    }

    pub(crate) fn is_shared(&self) -> bool {
        self.lock.is_value_shared()
    }

    /// Mark shared; `on_share` runs once, for the call that shares
    pub(crate) fn share(&self, origin: &Context, on_share: impl FnOnce()) -> bool {
        self.lock.share(origin, || {
            self.isolator.get_or_init(TransactionIsolator::new);
            on_share();
        })
    }

    fn isolate(&self, ctx: &Context) -> Result<(), ValueError> {
        if self.is_shared() {
            self.isolator
                .get_or_init(TransactionIsolator::new)
                .wait_for_other_transactions(ctx, false)?;
        }
        Ok(())
    }

    pub(crate) fn begin_read(&self, ctx: &Context) -> Result<SmartLockGuard<'_>, ValueError> {
        self.isolate(ctx)?;
        Ok(self.lock.acquire(ctx)?)
    }

    pub(crate) fn begin_write(&self, ctx: &Context) -> Result<SmartLockGuard<'_>, ValueError> {
        if ctx
            .transaction()
            .is_some_and(|tx| tx.is_readonly() && !tx.is_finished())
        {
            return Err(ValueError::MutationInReadonlyTransaction);
        }
        self.isolate(ctx)?;
        Ok(self.lock.acquire(ctx)?)
    }

    /// Whether building a mutation is worth it
    pub(crate) fn is_observed(&self) -> bool {
        !self.callbacks.is_empty() || !self.watchers.is_empty()
    }

    pub(crate) fn watched_depth(&self) -> WatchingDepth {
        self.propagation.lock().depth
    }

    pub(crate) fn dispatch(&self, ctx: &Context, mutation: &Mutation) {
        let Some(_guard) = DispatchGuard::enter(self.id) else {
            return;
        };
        self.watchers.inform(mutation);
        self.callbacks.call(ctx, mutation);
    }

    pub(crate) fn add_callback(&self, config: MutationCallbackConfig) -> CallbackHandle {
        self.callbacks.add(config)
    }

    pub(crate) fn remove_callback(&self, handle: CallbackHandle) {
        self.callbacks.remove(handle);
    }

    pub(crate) fn remove_callbacks(&self) {
        self.callbacks.clear();
    }

    pub(crate) fn add_watcher(&self, config: WatcherConfig) -> Arc<GenericWatcher> {
        let watcher = GenericWatcher::new(config);
        self.watchers.add(&watcher);
        watcher
    }
}

/// Subscribe `config` on `this`, extending depth propagation if needed
pub(crate) fn on_mutation<T: Container>(
    this: &Arc<T>,
    ctx: &Context,
    mut config: MutationCallbackConfig,
) -> Result<CallbackHandle, ValueError> {
    config.depth = config.depth.or_shallow();
    let _guard = this.core().lock.acquire(ctx)?;
    ensure_watching_depth(this, ctx, config.depth);
    Ok(this.core().add_callback(config))
}

pub(crate) fn watcher<T: Container>(this: &Arc<T>, ctx: &Context, config: WatcherConfig) -> Arc<GenericWatcher> {
    ensure_watching_depth(this, ctx, config.depth.or_shallow());
    this.core().add_watcher(config)
}

/// Forward the mutations of every child when `depth` reaches beyond the
/// container itself
pub(crate) fn ensure_watching_depth<T: Container>(this: &Arc<T>, ctx: &Context, depth: WatchingDepth) {
    if depth.minus_one().is_none() {
        return;
    }
    // Forwarders registered for a shallower depth are replaced
    let stale = {
        let mut propagation = this.core().propagation.lock();
        if propagation.depth >= depth {
            return;
        }
        propagation.depth = depth;
        std::mem::take(&mut propagation.forwarders)
    };
    for forwarder in stale {
        if let Some(watchable) = forwarder.child.as_watchable() {
            watchable.remove_mutation_callback(ctx, forwarder.handle);
        }
    }
    for child in this.children() {
        watch_child(this, ctx, &child);
    }
}

/// Register a forwarder on `child` if the container propagates depth
pub(crate) fn watch_child<T: Container>(this: &Arc<T>, ctx: &Context, child: &Value) {
    let core = this.core();
    let Some(child_depth) = core.watched_depth().minus_one() else {
        return;
    };
    let (Some(child_id), Some(watchable)) = (child.id(), child.as_watchable()) else {
        return;
    };
    if child_id == core.id {
        return;
    }
    if core
        .propagation
        .lock()
        .forwarders
        .iter()
        .any(|f| f.child.id() == Some(child_id))
    {
        return;
    }

    let parent: Weak<T> = Arc::downgrade(this);
    let forward = MutationCallbackConfig::new(child_depth, move |ctx, mutation| {
        let parent = parent.upgrade().ok_or(CallbackError::Unsubscribe)?;
        let segment = parent.locate(child_id).ok_or(CallbackError::Unsubscribe)?;
        parent.core().dispatch(ctx, &mutation.relocalized(&segment));
        Ok(())
    });

    match watchable.on_mutation(ctx, forward) {
        Ok(handle) => core.propagation.lock().forwarders.push(Forwarder {
            child: child.clone(),
            handle,
        }),
        Err(err) => {
            tracing::warn!(parent = %core.id, child = %child_id, error = %err, "failed to forward child mutations");
        }
    }
}

/// Drop the forwarder of `child` once it is no longer in the container
pub(crate) fn unwatch_child_if_absent<T: Container>(this: &Arc<T>, ctx: &Context, child: &Value) {
    let Some(child_id) = child.id() else {
        return;
    };
    if this.locate(child_id).is_some() {
        return;
    }
    let removed = {
        let mut propagation = this.core().propagation.lock();
        let index = propagation
            .forwarders
            .iter()
            .position(|f| f.child.id() == Some(child_id));
        index.map(|i| propagation.forwarders.remove(i))
    };
    if let Some(forwarder) = removed {
        if let Some(watchable) = forwarder.child.as_watchable() {
            watchable.remove_mutation_callback(ctx, forwarder.handle);
        }
    }
}
