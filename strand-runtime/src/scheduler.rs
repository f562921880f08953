//! Lifetime job scheduler
//!
//! One background thread owns the table of job instances. Registrations
//! and unregistrations arrive through bounded channels, so value methods
//! never touch the table directly. On every tick the scheduler resumes
//! paused instances that never started, or that stayed paused for longer
//! than `max_idle`.

use crate::lthread::LThread;
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use strand_core::config;
use strand_types::JobsId;

const CHANNEL_CAPACITY: usize = 1000;

static GLOBAL: Lazy<LifetimeJobScheduler> = Lazy::new(|| {
    let config = config::current();
    LifetimeJobScheduler::start(config.job_tick_interval(), config.job_max_idle())
});

struct Tracked {
    lthread: LThread,
    /// Last tick the instance was seen running, or last resume
    last_active: Instant,
}

struct SchedulerInner {
    register_tx: Sender<(JobsId, Vec<LThread>)>,
    unregister_tx: Sender<JobsId>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LifetimeJobScheduler {
    inner: Arc<SchedulerInner>,
}

impl LifetimeJobScheduler {
    /// The process-wide scheduler, started on first use
    pub fn global() -> &'static LifetimeJobScheduler {
        &GLOBAL
    }

    /// Start a scheduler thread with its own table
    pub fn start(tick: Duration, max_idle: Duration) -> Self {
        let (register_tx, register_rx) = channel::bounded(CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = channel::bounded(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("lifetime-jobs".to_string())
            .spawn(move || run(register_rx, unregister_rx, shutdown_rx, tick, max_idle));
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(error = %err, "failed to start the lifetime job scheduler");
                None
            }
        };

        Self {
            inner: Arc::new(SchedulerInner {
                register_tx,
                unregister_tx,
                shutdown_tx: Mutex::new(Some(shutdown_tx)),
                handle: Mutex::new(handle),
            }),
        }
    }

    pub fn register(&self, id: JobsId, instances: Vec<LThread>) {
        if self.inner.register_tx.send((id, instances)).is_err() {
            tracing::warn!(jobs = %id, "lifetime job scheduler is stopped, registration dropped");
        }
    }

    pub fn unregister(&self, id: JobsId) {
        if self.inner.unregister_tx.send(id).is_err() {
            tracing::debug!(jobs = %id, "lifetime job scheduler is stopped, unregistration dropped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.shutdown_tx.lock().is_some()
    }

    /// Stop the scheduler thread and wait for it. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown_tx.lock().take();
        if let Some(handle) = self.inner.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("lifetime job scheduler thread panicked");
            }
        }
    }
}

fn run(
    register_rx: Receiver<(JobsId, Vec<LThread>)>,
    unregister_rx: Receiver<JobsId>,
    shutdown_rx: Receiver<()>,
    tick: Duration,
    max_idle: Duration,
) {
    let ticker = channel::tick(tick);
    let mut jobs: HashMap<JobsId, Vec<Tracked>> = HashMap::new();

    loop {
        select! {
            recv(register_rx) -> msg => match msg {
                Ok((id, instances)) => {
                    let now = Instant::now();
                    jobs.entry(id).or_default().extend(
                        instances.into_iter().map(|lthread| Tracked { lthread, last_active: now }),
                    );
                }
                Err(_) => break,
            },
            recv(unregister_rx) -> msg => {
                if let Ok(id) = msg {
                    jobs.remove(&id);
                }
            }
            recv(shutdown_rx) -> _ => break,
            recv(ticker) -> msg => {
                if let Ok(now) = msg {
                    resume_idle(&mut jobs, now, max_idle);
                }
            }
        }
    }
    tracing::debug!(remaining = jobs.len(), "lifetime job scheduler stopped");
}

fn resume_idle(jobs: &mut HashMap<JobsId, Vec<Tracked>>, now: Instant, max_idle: Duration) {
    for instances in jobs.values_mut() {
        instances.retain(|tracked| !tracked.lthread.is_done());
        for tracked in instances.iter_mut() {
            if !tracked.lthread.is_paused() {
                tracked.last_active = now;
                continue;
            }
            let never_started = !tracked.lthread.has_started();
            if never_started || now.duration_since(tracked.last_active) > max_idle {
                if tracked.lthread.resume_async().is_ok() {
                    tracked.last_active = now;
                }
            }
        }
    }
    jobs.retain(|_, instances| !instances.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime_job::{LifetimeJob, ValueLifetimeJobs};
    use crate::module::{Manifest, Module, NativeEvaluator};
    use crate::EvalError;
    use strand_core::{Context, Object, Permission, Value};

    fn counting_job(rounds: i64) -> LifetimeJob {
        let module = Module::native("count", Manifest::new(), move |state, owner| {
            let owner = owner
                .and_then(|v| v.as_object())
                .ok_or_else(|| EvalError::Failed("owner must be an object".into()))?;
            for _ in 0..rounds {
                let n = owner.prop(state.ctx(), "n")?.and_then(|v| v.as_int()).unwrap_or(0);
                owner.set_prop(state.ctx(), "n", Value::Int(n + 1))?;
                state.yield_step(Value::Int(n + 1))?;
            }
            Ok(Value::Nil)
        });
        LifetimeJob::new(Value::from("counter"), module, Arc::new(NativeEvaluator)).unwrap()
    }

    #[test]
    fn test_scheduler_drives_paused_jobs_to_completion() {
        let scheduler = LifetimeJobScheduler::start(Duration::from_millis(1), Duration::from_millis(5));
        let ctx = Context::root(vec![Permission::create_lthread()], vec![]).unwrap();
        let owner = Object::new();

        let jobs = ValueLifetimeJobs::with_scheduler(
            Value::Object(owner.clone()),
            vec![counting_job(3)],
            scheduler.clone(),
        );
        jobs.instantiate_lthreads(&ctx).unwrap();

        for lthread in jobs.instances() {
            let result = lthread.wait_result_timeout(Duration::from_secs(5));
            assert!(matches!(result, Some(Ok(Value::Nil))));
            assert_eq!(lthread.steps().len(), 3);
        }
        assert_eq!(owner.prop(&ctx, "n").unwrap().and_then(|v| v.as_int()), Some(3));
        scheduler.shutdown();
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_teardown_cancels_instances() {
        let scheduler = LifetimeJobScheduler::start(Duration::from_millis(1), Duration::from_secs(60));
        let ctx = Context::root(vec![Permission::create_lthread()], vec![]).unwrap();
        let jobs = ValueLifetimeJobs::with_scheduler(
            Value::Object(Object::new()),
            vec![counting_job(1_000)],
            scheduler.clone(),
        );
        jobs.instantiate_lthreads(&ctx).unwrap();
        let instances = jobs.instances();

        jobs.teardown();
        assert!(jobs.instances().is_empty());
        for lthread in instances {
            assert!(lthread.wait_result_timeout(Duration::from_secs(5)).is_some());
            assert!(lthread.is_done());
        }
        scheduler.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let scheduler = LifetimeJobScheduler::start(Duration::from_millis(1), Duration::from_millis(1));
        scheduler.shutdown();
        scheduler.shutdown();
        scheduler.register(JobsId::next(), Vec::new());
    }
}
