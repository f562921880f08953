//! Lightweight threads
//!
//! An [`LThread`] evaluates one module on its own OS thread, in a child
//! context of the spawner. The module cooperates through
//! [`ExecutionState::yield_step`]: each yield records an [`ExecutedStep`]
//! and, depending on the step policy, parks the thread on a single-slot
//! continuation channel until [`LThread::resume_async`] is called.
//!
//! ```text
//!   spawn ──▶ Paused? ──resume──▶ Running ──yield──▶ Paused ──resume──┐
//!                                    ▲                                 │
//!                                    └─────────────────────────────────┘
//!                                    │
//!                          return / error / cancel
//!                                    ▼
//!                                   Done
//! ```
//!
//! Every running lthread holds one token of the simultaneous instances
//! limiter, taken at spawn and given back when its thread exits.

use crate::error::{EvalError, LThreadError, SpawnError};
use crate::module::{Evaluator, ExecutionState, Module};
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strand_core::context::panic_message;
use strand_core::limit::THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME;
use strand_core::{
    config, share_or_clone, Context, ContextConfig, LimitError, Limit, Limiter, Object, Permission,
    PermissionKind, Value,
};
use strand_types::LThreadId;

/// Result of one yield
#[derive(Debug, Clone)]
pub struct ExecutedStep {
    pub result: Value,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Continue,
    Pause,
}

/// Decides after each yield whether the lthread keeps running
pub type StepPolicy = Arc<dyn Fn(&ExecutedStep) -> StepDecision + Send + Sync>;

static GLOBAL_INSTANCES: OnceCell<Arc<Limiter>> = OnceCell::new();

/// The spawner's own instance limiter, or the process-wide one
fn instances_limiter(spawner: &Context) -> Result<Arc<Limiter>, LimitError> {
    if let Some(limiter) = spawner.limiter(THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME) {
        return Ok(limiter);
    }
    GLOBAL_INSTANCES
        .get_or_try_init(|| {
            Limiter::new(&Limit::total(
                THREADS_SIMULTANEOUS_INSTANCES_LIMIT_NAME,
                config::current().lthreads.max_simultaneous_instances,
            ))
        })
        .cloned()
}

/// Parameters of [`spawn_lthread`]
pub struct SpawnArgs {
    spawner: Context,
    module: Arc<Module>,
    evaluator: Arc<dyn Evaluator>,
    globals: Vec<(String, Value)>,
    lthread_ctx: Option<Context>,
    start_paused: bool,
    pause_after_yield: bool,
    step_policy: Option<StepPolicy>,
    self_value: Option<Value>,
    timeout: Option<Duration>,
    ignore_create_permission: bool,
}

impl SpawnArgs {
    pub fn new(spawner: &Context, module: Arc<Module>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            spawner: spawner.clone(),
            module,
            evaluator,
            globals: Vec::new(),
            lthread_ctx: None,
            start_paused: false,
            pause_after_yield: true,
            step_policy: None,
            self_value: None,
            timeout: None,
            ignore_create_permission: false,
        }
    }

    pub fn with_global(mut self, name: impl Into<String>, value: Value) -> Self {
        self.globals.push((name.into(), value));
        self
    }

    pub fn with_globals(mut self, globals: Vec<(String, Value)>) -> Self {
        self.globals.extend(globals);
        self
    }

    /// Run in this context instead of a fresh child of the spawner
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.lthread_ctx = Some(ctx);
        self
    }

    pub fn start_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    /// Without a step policy, pause after each yield (default: true)
    pub fn pause_after_yield(mut self, pause: bool) -> Self {
        self.pause_after_yield = pause;
        self
    }

    pub fn with_step_policy(
        mut self,
        policy: impl Fn(&ExecutedStep) -> StepDecision + Send + Sync + 'static,
    ) -> Self {
        self.step_policy = Some(Arc::new(policy));
        self
    }

    pub fn with_self(mut self, value: Value) -> Self {
        self.self_value = Some(value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ignore_create_permission(mut self, ignore: bool) -> Self {
        self.ignore_create_permission = ignore;
        self
    }
}

pub(crate) struct LThreadInner {
    id: LThreadId,
    module_name: String,
    ctx: Context,
    started: AtomicBool,
    paused: AtomicBool,
    done: AtomicBool,
    continue_tx: Sender<()>,
    continue_rx: Receiver<()>,
    finished_rx: Receiver<()>,
    result: Mutex<Option<Result<Value, LThreadError>>>,
    steps: Mutex<Vec<ExecutedStep>>,
    step_policy: Option<StepPolicy>,
    pause_after_yield: bool,
}

impl LThreadInner {
    /// Park until resumed. Returns false if the context ended the wait.
    fn park(&self, ctx: &Context) -> bool {
        self.paused.store(true, Ordering::Release);
        let resumed = select! {
            recv(self.continue_rx) -> _ => true,
            recv(ctx.done()) -> _ => false,
        };
        self.paused.store(false, Ordering::Release);
        resumed
    }

    pub(crate) fn yield_step(&self, ctx: &Context, result: Value) -> Result<(), EvalError> {
        let step = ExecutedStep {
            result: share_or_clone(&result, ctx)?,
            date: Utc::now(),
        };
        let decision = match &self.step_policy {
            Some(policy) => policy(&step),
            None if self.pause_after_yield => StepDecision::Pause,
            None => StepDecision::Continue,
        };
        self.steps.lock().push(step);

        if decision == StepDecision::Pause && !self.park(ctx) {
            return Err(EvalError::Cancelled);
        }
        Ok(())
    }
}

/// Handle to a lightweight thread; cheap to clone
#[derive(Clone)]
pub struct LThread {
    inner: Arc<LThreadInner>,
}

/// Spawn a module evaluation on a new lthread
pub fn spawn_lthread(args: SpawnArgs) -> Result<LThread, SpawnError> {
    let SpawnArgs {
        spawner,
        module,
        evaluator,
        globals,
        lthread_ctx,
        start_paused,
        pause_after_yield,
        step_policy,
        self_value,
        timeout,
        ignore_create_permission,
    } = args;

    if !ignore_create_permission {
        spawner.check_permission(&Permission::create_lthread())?;
    }

    let ctx = match lthread_ctx {
        Some(ctx) => ctx,
        None => spawner.child(ContextConfig {
            permissions: lthread_permissions(&spawner, &module, &globals),
            limits: module.manifest.limits.clone(),
            ..Default::default()
        })?,
    };

    let prepared = prepare_inputs(&spawner, globals, self_value);
    let (globals, self_value) = match prepared {
        Ok(inputs) => inputs,
        Err(err) => {
            ctx.cancel_ungracefully();
            return Err(err.into());
        }
    };

    let limiter = match instances_limiter(&spawner) {
        Ok(limiter) => limiter,
        Err(err) => {
            ctx.cancel_ungracefully();
            return Err(err.into());
        }
    };
    if let Err(err) = limiter.take(1, &|| spawner.is_done()) {
        ctx.cancel_ungracefully();
        return Err(err.into());
    }

    let (continue_tx, continue_rx) = channel::bounded(1);
    let (finished_tx, finished_rx) = channel::bounded::<()>(0);
    let inner = Arc::new(LThreadInner {
        id: LThreadId::next(),
        module_name: module.name.clone(),
        ctx: ctx.clone(),
        started: AtomicBool::new(false),
        paused: AtomicBool::new(start_paused),
        done: AtomicBool::new(false),
        continue_tx,
        continue_rx,
        finished_rx,
        result: Mutex::new(None),
        steps: Mutex::new(Vec::new()),
        step_policy,
        pause_after_yield,
    });

    let state = ExecutionState::for_lthread(ctx.clone(), globals, inner.clone());
    let thread_inner = inner.clone();
    let thread_limiter = limiter.clone();
    let spawned = thread::Builder::new()
        .name(format!("lthread-{}", inner.id.as_u64()))
        .spawn(move || {
            run(&thread_inner, &*evaluator, &module, &state, self_value.as_ref(), start_paused);
            thread_limiter.give_back(1);
            thread_inner.done.store(true, Ordering::Release);
            drop(finished_tx);
        });

    if let Err(err) = spawned {
        limiter.give_back(1);
        ctx.cancel_ungracefully();
        return Err(SpawnError::ThreadSpawn(err.to_string()));
    }

    if let Some(timeout) = timeout {
        spawn_timeout_watchdog(&ctx, timeout);
    }

    tracing::debug!(lthread = %inner.id, module = %inner.module_name, ctx = %ctx.id(), paused = start_paused, "lthread spawned");
    Ok(LThread { inner })
}

/// Manifest permissions, plus lthread creation and access to the passed
/// globals when the spawner holds them.
fn lthread_permissions(spawner: &Context, module: &Module, globals: &[(String, Value)]) -> Vec<Permission> {
    let mut permissions = module.manifest.permissions.clone();
    let mut extra = vec![Permission::create_lthread()];
    for (name, _) in globals {
        extra.push(Permission::global_var(PermissionKind::Read, name.as_str()));
        extra.push(Permission::global_var(PermissionKind::Use, name.as_str()));
    }
    for perm in extra {
        if spawner.has_permission(&perm) && !permissions.contains(&perm) {
            permissions.push(perm);
        }
    }
    permissions
}

fn prepare_inputs(
    spawner: &Context,
    globals: Vec<(String, Value)>,
    self_value: Option<Value>,
) -> Result<(Object, Option<Value>), strand_core::CloneError> {
    let globals = globals
        .into_iter()
        .map(|(name, value)| Ok((name, share_or_clone(&value, spawner)?)))
        .collect::<Result<Vec<_>, strand_core::CloneError>>()?;
    let self_value = self_value
        .map(|value| share_or_clone(&value, spawner))
        .transpose()?;
    Ok((Object::from_entries(globals), self_value))
}

fn spawn_timeout_watchdog(ctx: &Context, timeout: Duration) {
    let ctx = ctx.clone();
    let deadline = Instant::now() + timeout;
    let spawned = thread::Builder::new()
        .name("lthread-timeout".to_string())
        .spawn(move || {
            select! {
                recv(ctx.done()) -> _ => {}
                recv(channel::at(deadline)) -> _ => {
                    tracing::warn!(ctx = %ctx.id(), ?timeout, "lthread timed out");
                    ctx.cancel_gracefully();
                }
            }
        });
    if let Err(err) = spawned {
        tracing::error!(error = %err, "failed to spawn the lthread timeout watchdog");
    }
}

fn run(
    inner: &LThreadInner,
    evaluator: &dyn Evaluator,
    module: &Module,
    state: &ExecutionState,
    self_value: Option<&Value>,
    start_paused: bool,
) {
    let ctx = state.ctx();
    let result = if start_paused && !inner.park(ctx) {
        Err(LThreadError::Cancelled)
    } else {
        inner.started.store(true, Ordering::Release);
        evaluate(inner, evaluator, module, state, self_value)
    };

    match &result {
        Ok(_) => tracing::debug!(lthread = %inner.id, "lthread finished"),
        Err(err) => tracing::debug!(lthread = %inner.id, error = %err, "lthread finished with an error"),
    }
    *inner.result.lock() = Some(result);
    ctx.cancel_gracefully();
}

fn evaluate(
    inner: &LThreadInner,
    evaluator: &dyn Evaluator,
    module: &Module,
    state: &ExecutionState,
    self_value: Option<&Value>,
) -> Result<Value, LThreadError> {
    let ctx = state.ctx();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(module, state, self_value)));
    match outcome {
        Ok(Ok(value)) => share_or_clone(&value, ctx).map_err(LThreadError::ResultClone),
        Ok(Err(_)) if ctx.is_done() => Err(LThreadError::Cancelled),
        Ok(Err(EvalError::Cancelled)) => Err(LThreadError::Cancelled),
        Ok(Err(err)) => Err(LThreadError::Eval(err)),
        Err(payload) => {
            let message = panic_message(&payload);
            tracing::warn!(lthread = %inner.id, panic = %message, "panic during lthread evaluation");
            Err(LThreadError::Eval(EvalError::Panicked(message)))
        }
    }
}

impl LThread {
    pub fn id(&self) -> LThreadId {
        self.inner.id
    }

    pub fn module_name(&self) -> &str {
        &self.inner.module_name
    }

    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Whether the module evaluation has begun
    pub fn has_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Wake the lthread if it is paused; otherwise does nothing
    pub fn resume_async(&self) -> Result<(), LThreadError> {
        if self.is_done() {
            return Err(LThreadError::IsDone);
        }
        if self
            .inner
            .paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.inner.continue_tx.try_send(());
        }
        Ok(())
    }

    /// Cancel the lthread context; a paused lthread ends as well
    pub fn cancel(&self) {
        self.inner.ctx.cancel_gracefully();
    }

    /// Block until done. Later calls return the same result immediately.
    pub fn wait_result(&self) -> Result<Value, LThreadError> {
        // Disconnects when the execution thread exits
        let _ = self.inner.finished_rx.recv();
        self.inner
            .result
            .lock()
            .clone()
            .unwrap_or(Err(LThreadError::Cancelled))
    }

    /// Like [`LThread::wait_result`], giving up after `timeout`
    pub fn wait_result_timeout(&self, timeout: Duration) -> Option<Result<Value, LThreadError>> {
        match self.inner.finished_rx.recv_timeout(timeout) {
            Err(channel::RecvTimeoutError::Timeout) => None,
            _ => Some(self.wait_result()),
        }
    }

    pub fn steps(&self) -> Vec<ExecutedStep> {
        self.inner.steps.lock().clone()
    }
}

impl std::fmt::Debug for LThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LThread")
            .field("id", &self.inner.id)
            .field("module", &self.inner.module_name)
            .field("paused", &self.is_paused())
            .field("done", &self.is_done())
            .finish()
    }
}

/// A set of lthreads waited on or cancelled together
#[derive(Default)]
pub struct LThreadGroup {
    threads: Mutex<Vec<LThread>>,
}

impl LThreadGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Panics if the lthread is already in the group
    pub fn add(&self, lthread: LThread) {
        let mut threads = self.threads.lock();
        if threads.iter().any(|t| t.id() == lthread.id()) {
            panic!("{} is already part of the group", lthread.id());
        }
        threads.push(lthread);
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Wait for every member; the first error is returned after all are done
    pub fn wait_all_results(&self) -> Result<Vec<Value>, LThreadError> {
        let threads = self.threads.lock().clone();
        let mut results = Vec::with_capacity(threads.len());
        let mut first_error = None;
        for lthread in &threads {
            match lthread.wait_result() {
                Ok(value) => results.push(value),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    pub fn cancel_all(&self) {
        let threads = self.threads.lock().clone();
        for lthread in threads {
            lthread.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Manifest, NativeEvaluator};

    fn spawner() -> Context {
        Context::root(vec![Permission::create_lthread()], vec![]).unwrap()
    }

    fn module(f: impl Fn(&ExecutionState, Option<&Value>) -> Result<Value, EvalError> + Send + Sync + 'static) -> Arc<Module> {
        Module::native("test", Manifest::new(), f)
    }

    fn spawn(ctx: &Context, m: Arc<Module>) -> SpawnArgs {
        SpawnArgs::new(ctx, m, Arc::new(NativeEvaluator))
    }

    #[test]
    fn test_requires_create_permission() {
        let ctx = Context::root(vec![], vec![]).unwrap();
        let m = module(|_, _| Ok(Value::Nil));
        assert!(matches!(spawn_lthread(spawn(&ctx, m.clone())), Err(SpawnError::Permission(_))));
        spawn_lthread(spawn(&ctx, m).ignore_create_permission(true))
            .unwrap()
            .wait_result()
            .unwrap();
    }

    #[test]
    fn test_manifest_permission_must_be_held_by_spawner() {
        let ctx = spawner();
        let m = Module::native(
            "needs-write",
            Manifest::new().with_permission(Permission::global_var(PermissionKind::Write, "x")),
            |_, _| Ok(Value::Nil),
        );
        assert!(matches!(spawn_lthread(spawn(&ctx, m)), Err(SpawnError::Context(_))));
    }

    #[test]
    fn test_context_is_cancelled_after_completion() {
        let ctx = spawner();
        let lthread = spawn_lthread(spawn(&ctx, module(|_, _| Ok(Value::Int(1))))).unwrap();
        assert_eq!(lthread.wait_result().unwrap().as_int(), Some(1));
        assert!(lthread.context().is_done());
        assert!(!ctx.is_done());
        assert_eq!(lthread.resume_async(), Err(LThreadError::IsDone));
    }

    #[test]
    fn test_step_policy_controls_pauses() {
        let ctx = spawner();
        let m = module(|state, _| {
            for i in 0..4 {
                state.yield_step(Value::Int(i))?;
            }
            Ok(Value::Nil)
        });
        let lthread = spawn_lthread(spawn(&ctx, m).with_step_policy(|step| {
            if step.result.as_int() == Some(2) {
                StepDecision::Pause
            } else {
                StepDecision::Continue
            }
        }))
        .unwrap();

        while !lthread.is_paused() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(lthread.steps().len(), 3);
        lthread.resume_async().unwrap();
        lthread.wait_result().unwrap();
        assert_eq!(lthread.steps().len(), 4);
    }

    #[test]
    fn test_no_pause_after_yield() {
        let ctx = spawner();
        let m = module(|state, _| {
            state.yield_step(Value::Int(1))?;
            state.yield_step(Value::Int(2))?;
            Ok(Value::Int(3))
        });
        let lthread = spawn_lthread(spawn(&ctx, m).pause_after_yield(false)).unwrap();
        assert_eq!(lthread.wait_result().unwrap().as_int(), Some(3));
        let steps: Vec<_> = lthread.steps().iter().filter_map(|s| s.result.as_int()).collect();
        assert_eq!(steps, vec![1, 2]);
    }

    #[test]
    fn test_panic_becomes_error() {
        let ctx = spawner();
        let lthread = spawn_lthread(spawn(&ctx, module(|_, _| panic!("boom")))).unwrap();
        assert!(matches!(
            lthread.wait_result(),
            Err(LThreadError::Eval(EvalError::Panicked(message))) if message == "boom"
        ));
    }

    #[test]
    fn test_timeout_cancels() {
        let ctx = spawner();
        let m = module(|state, _| {
            state.ctx().sleep(Duration::from_secs(10)).map_err(|_| EvalError::Cancelled)?;
            Ok(Value::Nil)
        });
        let lthread = spawn_lthread(spawn(&ctx, m).with_timeout(Duration::from_millis(20))).unwrap();
        assert!(matches!(lthread.wait_result(), Err(LThreadError::Cancelled)));
    }

    #[test]
    #[should_panic(expected = "already part of the group")]
    fn test_group_rejects_duplicates() {
        let ctx = spawner();
        let lthread = spawn_lthread(spawn(&ctx, module(|_, _| Ok(Value::Nil)))).unwrap();
        let group = LThreadGroup::new();
        group.add(lthread.clone());
        group.add(lthread);
    }
}
