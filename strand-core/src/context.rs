//! Execution contexts
//!
//! A [`Context`] is the environment of one thread of control:
//!
//! - granted and forbidden permissions (deny wins),
//! - named limiters, shared with child contexts,
//! - at most one bound [`Transaction`],
//! - a place in the cancellation tree: cancelling a context cancels its
//!   descendants, rolls back its transaction, releases the resources it
//!   holds and runs its `on_done` tasks.
//!
//! `Context` is a cheap handle (`Arc` inside); clones refer to the same
//! context.

use crate::error::{ContextError, LimitError, PermissionError, ResourceError};
use crate::limit::{Limit, Limiter, EXECUTION_TOTAL_LIMIT_NAME};
use crate::permission::{Permission, PermissionSet};
use crate::resource::{ResourceHolder, ResourceTable};
use crate::transaction::Transaction;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use strand_types::ContextId;

/// Progress of the graceful teardown of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TeardownStatus {
    NeverStarted = 0,
    TearingDown = 1,
    TornDown = 2,
    TornDownWithErrors = 3,
    TornDownWithCancellation = 4,
}

impl TeardownStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TeardownStatus::TearingDown,
            2 => TeardownStatus::TornDown,
            3 => TeardownStatus::TornDownWithErrors,
            4 => TeardownStatus::TornDownWithCancellation,
            _ => TeardownStatus::NeverStarted,
        }
    }
}

type TeardownTask = Box<dyn FnOnce(&Context) -> Result<(), String> + Send>;
type DoneTask = Box<dyn FnOnce(TeardownStatus) -> Result<(), String> + Send>;

/// Parameters of a new context
#[derive(Default)]
pub struct ContextConfig {
    pub permissions: Vec<Permission>,
    pub forbidden: Vec<Permission>,
    pub limits: Vec<Limit>,
    pub parent: Option<Context>,
    /// Defaults to the parent's table, or the process-wide one
    pub resources: Option<Arc<ResourceTable>>,
}

#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: ContextId,
    parent: Option<Context>,
    permissions: RwLock<PermissionSet>,
    limiters: HashMap<String, Arc<Limiter>>,
    /// Limiters created by this context (not inherited)
    own_limiters: Vec<Arc<Limiter>>,
    tx: Mutex<Option<Arc<Transaction>>>,
    done: AtomicBool,
    done_tx: Mutex<Option<Sender<()>>>,
    done_rx: Receiver<()>,
    children: Mutex<Vec<Weak<ContextInner>>>,
    resources: Arc<ResourceTable>,
    teardown_status: AtomicU8,
    teardown_tasks: Mutex<Vec<TeardownTask>>,
    done_tasks: Mutex<Vec<DoneTask>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("done", &self.is_done())
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl Context {
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        let ContextConfig {
            permissions,
            forbidden,
            limits,
            parent,
            resources,
        } = config;

        if let Some(parent) = &parent {
            for perm in &permissions {
                if !parent.has_permission(perm) {
                    return Err(ContextError::PermissionNotHeldByParent(perm.to_string()));
                }
            }
        }

        let mut limiters: HashMap<String, Arc<Limiter>> = parent
            .as_ref()
            .map(|p| p.inner.limiters.clone())
            .unwrap_or_default();
        let mut own_limiters = Vec::new();
        let mut declared = Vec::new();

        for limit in &limits {
            if declared.contains(&limit.name) {
                return Err(ContextError::DuplicateLimit(limit.name.clone()));
            }
            declared.push(limit.name.clone());

            // Buckets inherited from the parent are shared, never loosened.
            if limiters.contains_key(&limit.name) {
                continue;
            }
            let limiter = Limiter::new(limit)?;
            limiters.insert(limit.name.clone(), limiter.clone());
            own_limiters.push(limiter);
        }

        let resources = resources
            .or_else(|| parent.as_ref().map(|p| p.inner.resources.clone()))
            .unwrap_or_else(ResourceTable::global);

        let (done_tx, done_rx) = channel::bounded(0);
        let ctx = Context {
            inner: Arc::new(ContextInner {
                id: ContextId::next(),
                parent: parent.clone(),
                permissions: RwLock::new(PermissionSet::new(permissions, forbidden)),
                limiters,
                own_limiters,
                tx: Mutex::new(None),
                done: AtomicBool::new(false),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
                children: Mutex::new(Vec::new()),
                resources,
                teardown_status: AtomicU8::new(TeardownStatus::NeverStarted as u8),
                teardown_tasks: Mutex::new(Vec::new()),
                done_tasks: Mutex::new(Vec::new()),
            }),
        };

        for limiter in &ctx.inner.own_limiters {
            let weak = Arc::downgrade(&ctx.inner);
            limiter.set_exhaustion_hook(move || {
                if let Some(inner) = weak.upgrade() {
                    Context { inner }.cancel_ungracefully();
                }
            });
        }

        if let Some(parent) = &parent {
            let mut children = parent.inner.children.lock();
            children.retain(|child| child.strong_count() > 0);
            children.push(Arc::downgrade(&ctx.inner));
            drop(children);
            if parent.is_done() {
                ctx.cancel_ungracefully();
            }
        }

        tracing::debug!(ctx = %ctx.id(), parent = ?parent.as_ref().map(|p| p.id()), "context created");
        Ok(ctx)
    }

    /// Root context with the given permissions and limits
    pub fn root(permissions: Vec<Permission>, limits: Vec<Limit>) -> Result<Self, ContextError> {
        Self::new(ContextConfig {
            permissions,
            limits,
            ..Default::default()
        })
    }

    /// Child context; the permissions must be held by `self`
    pub fn child(&self, mut config: ContextConfig) -> Result<Self, ContextError> {
        config.parent = Some(self.clone());
        Self::new(config)
    }

    /// Child context with the same permissions and limiters
    pub fn bound_child(&self) -> Result<Self, ContextError> {
        let permissions = self.inner.permissions.read().clone();
        Self::new(ContextConfig {
            permissions: permissions.granted().to_vec(),
            forbidden: permissions.forbidden().to_vec(),
            parent: Some(self.clone()),
            ..Default::default()
        })
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn parent(&self) -> Option<&Context> {
        self.inner.parent.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Disconnected once the context is cancelled; usable in `select!`
    pub fn done(&self) -> &Receiver<()> {
        &self.inner.done_rx
    }

    /// Sleep for `duration`, waking early with an error on cancellation
    pub fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        match self.inner.done_rx.recv_timeout(duration) {
            Err(channel::RecvTimeoutError::Timeout) => Ok(()),
            _ => Err(ContextError::Done),
        }
    }

    // -- permissions --

    pub fn check_permission(&self, perm: &Permission) -> Result<(), PermissionError> {
        self.inner.permissions.read().check(perm)
    }

    pub fn has_permission(&self, perm: &Permission) -> bool {
        self.check_permission(perm).is_ok()
    }

    /// Irreversibly remove permissions from this context
    pub fn drop_permissions(&self, dropped: &[Permission]) {
        self.inner.permissions.write().drop_permissions(dropped);
    }

    pub fn granted_permissions(&self) -> Vec<Permission> {
        self.inner.permissions.read().granted().to_vec()
    }

    pub fn forbidden_permissions(&self) -> Vec<Permission> {
        self.inner.permissions.read().forbidden().to_vec()
    }

    // -- limits --

    pub fn limiter(&self, name: &str) -> Option<Arc<Limiter>> {
        self.inner.limiters.get(name).cloned()
    }

    pub fn take(&self, name: &str, count: i64) -> Result<(), LimitError> {
        if self.is_done() {
            return Err(LimitError::ContextDone);
        }
        let limiter = self
            .limiter(name)
            .ok_or_else(|| LimitError::NotPresent(name.to_string()))?;
        limiter.take(count, &|| self.is_done())
    }

    pub fn give_back(&self, name: &str, count: i64) -> Result<(), LimitError> {
        if self.is_done() {
            return Err(LimitError::ContextDone);
        }
        let limiter = self
            .limiter(name)
            .ok_or_else(|| LimitError::NotPresent(name.to_string()))?;
        limiter.give_back(count);
        Ok(())
    }

    /// Run a blocking operation without consuming the execution time budget
    pub fn do_io<T>(&self, f: impl FnOnce() -> T) -> T {
        let limiter = self.limiter(EXECUTION_TOTAL_LIMIT_NAME);
        if let Some(limiter) = &limiter {
            limiter.pause_depletion();
        }
        let result = f();
        if let Some(limiter) = &limiter {
            limiter.resume_depletion();
        }
        result
    }

    // -- transaction --

    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.inner.tx.lock().clone()
    }

    pub fn has_transaction(&self) -> bool {
        self.inner.tx.lock().is_some()
    }

    /// Bind `tx`, failing if another transaction is bound
    pub(crate) fn bind_transaction(&self, tx: Arc<Transaction>) -> bool {
        let mut slot = self.inner.tx.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(tx);
        true
    }

    pub(crate) fn unbind_transaction(&self, tx: &Transaction) {
        let mut slot = self.inner.tx.lock();
        if slot.as_ref().is_some_and(|current| current.id() == tx.id()) {
            *slot = None;
        }
    }

    // -- resources --

    pub fn resource_table(&self) -> &Arc<ResourceTable> {
        &self.inner.resources
    }

    fn resource_holder(&self) -> (ResourceHolder, Option<Arc<Transaction>>) {
        match self.transaction() {
            Some(tx) => (ResourceHolder::Transaction(tx.id()), Some(tx)),
            None => (ResourceHolder::Context(self.id()), None),
        }
    }

    /// Block until the resource is acquired by this context (or its transaction)
    pub fn acquire_resource(&self, name: &str) -> Result<(), ResourceError> {
        let (holder, tx) = self.resource_holder();
        self.inner
            .resources
            .acquire(name, holder, &|| self.is_done())?;
        if let Some(tx) = tx {
            tx.record_resource(name);
        }
        Ok(())
    }

    pub fn try_acquire_resource(&self, name: &str) -> bool {
        let (holder, tx) = self.resource_holder();
        let acquired = self.inner.resources.try_acquire(name, holder);
        if acquired {
            if let Some(tx) = tx {
                tx.record_resource(name);
            }
        }
        acquired
    }

    pub fn release_resource(&self, name: &str) -> Result<(), ResourceError> {
        let (holder, _) = self.resource_holder();
        self.inner.resources.release(name, holder)
    }

    // -- cancellation --

    /// Register a task run by [`Context::cancel_gracefully`] before cancellation
    pub fn on_graceful_teardown(
        &self,
        task: impl FnOnce(&Context) -> Result<(), String> + Send + 'static,
    ) {
        self.inner.teardown_tasks.lock().push(Box::new(task));
    }

    /// Register a task run once the context is cancelled.
    ///
    /// Runs immediately if the context is already done.
    pub fn on_done(&self, task: impl FnOnce(TeardownStatus) -> Result<(), String> + Send + 'static) {
        if self.is_done() {
            run_done_task(self.id(), Box::new(task), self.teardown_status());
            return;
        }
        self.inner.done_tasks.lock().push(Box::new(task));
        // Cancellation may have happened between the check and the push.
        if self.is_done() {
            self.run_done_tasks();
        }
    }

    pub fn teardown_status(&self) -> TeardownStatus {
        TeardownStatus::from_u8(self.inner.teardown_status.load(Ordering::Acquire))
    }

    /// Run the graceful teardown tasks, then cancel
    pub fn cancel_gracefully(&self) {
        if self.is_done() {
            return;
        }
        let started = self.inner.teardown_status.compare_exchange(
            TeardownStatus::NeverStarted as u8,
            TeardownStatus::TearingDown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if started.is_ok() {
            let status = self.graceful_teardown();
            self.inner.teardown_status.store(status as u8, Ordering::Release);
        }
        self.cancel_ungracefully();
    }

    fn graceful_teardown(&self) -> TeardownStatus {
        let tasks = std::mem::take(&mut *self.inner.teardown_tasks.lock());
        let mut errors = false;

        for task in tasks {
            if self.is_done() {
                return TeardownStatus::TornDownWithCancellation;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| task(self))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    errors = true;
                    tracing::warn!(ctx = %self.id(), error = %err, "error returned by a context teardown task");
                }
                Err(payload) => {
                    errors = true;
                    tracing::warn!(ctx = %self.id(), panic = %panic_message(&payload), "panic in a context teardown task");
                }
            }
        }

        if errors {
            TeardownStatus::TornDownWithErrors
        } else {
            TeardownStatus::TornDown
        }
    }

    /// Cancel immediately. Idempotent.
    pub fn cancel_ungracefully(&self) {
        if self.inner.done.swap(true, Ordering::AcqRel) {
            return;
        }
        // Dropping the sender disconnects every `done()` receiver.
        self.inner.done_tx.lock().take();
        tracing::debug!(ctx = %self.id(), "context cancelled");

        let children: Vec<Context> = self
            .inner
            .children
            .lock()
            .drain(..)
            .filter_map(|weak| weak.upgrade())
            .map(|inner| Context { inner })
            .collect();
        for child in children {
            child.cancel_ungracefully();
        }

        for limiter in &self.inner.own_limiters {
            limiter.destroy();
        }

        if let Some(tx) = self.transaction() {
            if let Err(err) = tx.rollback() {
                tracing::warn!(ctx = %self.id(), tx = %tx.id(), error = %err, "rollback on cancellation failed");
            }
        }

        let released = self
            .inner
            .resources
            .release_all(ResourceHolder::Context(self.id()));
        if released > 0 {
            tracing::debug!(ctx = %self.id(), released, "released context resources");
        }

        self.run_done_tasks();
    }

    fn run_done_tasks(&self) {
        let tasks = std::mem::take(&mut *self.inner.done_tasks.lock());
        let status = self.teardown_status();
        for task in tasks {
            run_done_task(self.id(), task, status);
        }
    }
}

fn run_done_task(id: ContextId, task: DoneTask, status: TeardownStatus) {
    match panic::catch_unwind(AssertUnwindSafe(|| task(status))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(ctx = %id, error = %err, "error returned by an on-done task"),
        Err(payload) => {
            tracing::warn!(ctx = %id, panic = %panic_message(&payload), "panic in an on-done task")
        }
    }
}

/// Best-effort text of a caught panic payload
pub fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
